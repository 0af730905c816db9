//! WolfCore - Replicated Core Catch-Up
//!
//! Keeps the members of a replicated core cluster in step with the leader.
//!
//! # Architecture
//!
//! The leader runs one log shipper per follower. A shipper probes the
//! follower's log, walks back to the point where both logs agree, catches
//! the follower up in batches and then pipelines new entries as they are
//! appended. When the entries a follower needs have been pruned, the
//! shipper tells it so, and the follower falls back to downloading a full
//! copy of the core state and the store from an upstream member.
//!
//! # Features
//!
//! - Per-follower shipping actors with mismatch, catch-up and pipeline modes
//! - Versioned core snapshots with one payload per state machine
//! - Catch-up server and client for snapshots, store copies and transaction pulls
//! - Single-flight state download that panics the database on any failure
//! - Pluggable upstream selection strategies

pub mod catchup;
pub mod config;
pub mod downloader;
pub mod error;
pub mod id;
pub mod log;
pub mod logging;
pub mod replication;
pub mod snapshot;
pub mod topology;
pub mod upstream;

pub use config::CoreConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catchup::{CatchupClient, CatchupServer, CatchupSource, TcpCatchupClient};
    pub use crate::config::CoreConfig;
    pub use crate::downloader::{LocalDatabase, StateDownloader};
    pub use crate::error::{Error, Result};
    pub use crate::id::{MemberId, StoreId};
    pub use crate::log::{InMemoryRaftLog, LogEntry, LogIndex, RaftLog, Term};
    pub use crate::replication::{LeaderContext, LogShippingManager, RaftMessage, Transport};
    pub use crate::snapshot::{CoreSnapshot, CoreStateMachine, CoreStateMachines, CoreStateType};
    pub use crate::topology::{MemberInfo, StaticTopology, TopologyService};
    pub use crate::upstream::{UpstreamSelector, UpstreamStrategy};
}
