//! Replication Module
//!
//! Log shipping from the leader to each follower: one shipper actor per
//! follower, managed as a group for the current membership.

pub mod protocol;
mod shipper;
mod actor;
mod manager;
mod follower;

pub use protocol::{AppendEntriesResponse, FrameHeader, RaftMessage};
pub use shipper::{FollowerProgress, LeaderContext, LogShipper, Mode};
pub use actor::ShipperHandle;
pub use manager::LogShippingManager;
pub use follower::handle_append_entries;

use std::time::Duration;

use crate::id::MemberId;

/// Outbound replication messages to one follower
pub type Outbound = tokio::sync::mpsc::Sender<RaftMessage>;

/// Delivers shipper messages to followers.
///
/// Each follower gets its own channel, so a follower whose connection
/// stalls only holds up its own shipper.
pub trait Transport: Send + Sync {
    /// Open the outbound channel to `follower`
    fn open(&self, follower: &MemberId) -> Outbound;
}

/// Configuration for log shipping
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Maximum entries per catch-up batch
    pub catchup_batch_size: usize,
    /// Maximum number of unacknowledged entries pipelined to a follower
    pub max_allowed_shipping_lag: u64,
    /// Resend interval when a follower does not answer, in milliseconds
    pub retry_interval_ms: u64,
    /// Capacity of each shipper's command queue
    pub queue_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            catchup_batch_size: 64,
            max_allowed_shipping_lag: 256,
            retry_interval_ms: 5000,
            queue_size: 1024,
        }
    }
}

impl ReplicationConfig {
    /// Resend interval as Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
