//! Replicated Log Entry Types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Position of an entry in the replicated log.
///
/// `-1` is the base position before the first entry.
pub type LogIndex = i64;

/// Leader epoch an entry was appended in
pub type Term = u64;

/// Index of the base position that precedes every entry
pub const BASE_INDEX: LogIndex = -1;

/// Term of the base position
pub const BASE_TERM: Term = 0;

/// A replicated log entry: an opaque command stamped with its term.
///
/// Entries are immutable once appended; the command payload is reference
/// counted so every follower's shipper can hold it without copying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the leader appended this entry
    pub term: Term,
    /// Opaque application command
    pub command: Bytes,
}

impl LogEntry {
    /// Create a new entry
    pub fn new(term: Term, command: impl Into<Bytes>) -> Self {
        Self {
            term,
            command: command.into(),
        }
    }
}

/// A log position: index together with the term of the entry at that index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub index: LogIndex,
    pub term: Term,
}

impl LogPosition {
    /// The base position before the first entry
    pub const BASE: LogPosition = LogPosition {
        index: BASE_INDEX,
        term: BASE_TERM,
    };

    pub fn new(index: LogIndex, term: Term) -> Self {
        Self { index, term }
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(index={}, term={})", self.index, self.term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization() {
        let entry = LogEntry::new(7, vec![1u8, 2, 3]);
        let bytes = bincode::serialize(&entry).unwrap();
        let restored: LogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(entry, restored);
    }
}
