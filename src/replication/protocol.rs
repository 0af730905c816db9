//! Replication Protocol
//!
//! Defines the steady-state log shipping messages exchanged between the
//! leader and its followers.

use serde::{Deserialize, Serialize};

use crate::id::MemberId;
use crate::log::{LogEntry, LogIndex, Term};

/// Protocol messages sent on the replication stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Append entries request (from leader to follower).
    ///
    /// An empty `entries` list doubles as a heartbeat carrying the commit index.
    AppendEntriesRequest {
        leader_id: MemberId,
        leader_term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },

    /// Append entries response (from follower to leader)
    AppendEntriesResponse(AppendEntriesResponse),

    /// The entry the follower needs has been pruned from the leader's log.
    ///
    /// The follower can only recover by downloading a full snapshot.
    LogCompactionInfo {
        leader_id: MemberId,
        leader_term: Term,
        prev_log_index: LogIndex,
        earliest_retained_index: LogIndex,
        earliest_retained_term: Option<Term>,
    },
}

/// Follower's answer to an append entries request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Responding follower
    pub from: MemberId,
    /// Follower's current term
    pub term: Term,
    /// Whether the follower's log matched `(prev_log_index, prev_log_term)`
    pub success: bool,
    /// Highest index known to be identical to the leader's log (valid on success)
    pub match_index: LogIndex,
    /// Follower's last appended index, a hint for mismatch backtracking
    pub append_index: LogIndex,
}

impl RaftMessage {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            RaftMessage::AppendEntriesRequest { entries, .. } if entries.is_empty() => "Heartbeat",
            RaftMessage::AppendEntriesRequest { .. } => "AppendEntriesRequest",
            RaftMessage::AppendEntriesResponse(_) => "AppendEntriesResponse",
            RaftMessage::LogCompactionInfo { .. } => "LogCompactionInfo",
        }
    }

    /// Whether this message tells the follower it needs a snapshot
    pub fn is_compaction_info(&self) -> bool {
        matches!(self, RaftMessage::LogCompactionInfo { .. })
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Check a received body against this header
    pub fn verify(&self, body: &[u8]) -> bool {
        body.len() == self.length as usize && crc32fast::hash(body) == self.checksum
    }
}
