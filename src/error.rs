//! WolfCore Error Types

use thiserror::Error;

use crate::id::{MemberId, StoreId};

/// Result type alias for WolfCore operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCore error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Snapshot format error: {0}")]
    SnapshotFormat(String),

    // Replication errors
    #[error("Stale term: remote term {remote} is ahead of local term {local}")]
    StaleTerm { remote: u64, local: u64 },

    #[error("Log shipper for {0} has stopped")]
    ShipperClosed(MemberId),

    #[error("Log error: {0}")]
    Log(String),

    // Upstream selection errors
    #[error("Could not find an upstream member with which to connect")]
    SelectionExhausted,

    // Download errors
    #[error("Store copy from {source_member} failed: {reason}")]
    StoreCopyFailed { source_member: MemberId, reason: String },

    #[error("Store id mismatch: expected {expected}, found {actual}")]
    StoreIdMismatch { expected: StoreId, actual: StoreId },

    #[error("Transactions from {0} have been pruned on the upstream")]
    TransactionsPruned(u64),

    #[error("A state download is already in progress")]
    DownloadInProgress,

    #[error("State machine error: {0}")]
    StateMachine(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Unknown member: {0}")]
    UnknownMember(MemberId),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable by a higher-level scheduler
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SelectionExhausted
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::DownloadInProgress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::SelectionExhausted.is_retryable());
        assert!(Error::ConnectionTimeout("core-2:6000".into()).is_retryable());
        assert!(!Error::SnapshotFormat("truncated".into()).is_retryable());

        let failed = Error::StoreCopyFailed {
            source_member: MemberId::new("core-2"),
            reason: "timeout".into(),
        };
        assert!(!failed.is_retryable());
    }
}
