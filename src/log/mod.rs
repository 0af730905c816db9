//! Replicated Log Module
//!
//! The log store itself is owned by the consensus layer; replication only
//! needs a concurrently readable view of it, plus the skip a follower
//! performs after installing a core snapshot. `InMemoryRaftLog` provides a
//! complete implementation used by embedders and tests.

pub mod entry;
mod memory;

pub use entry::{LogEntry, LogIndex, LogPosition, Term, BASE_INDEX, BASE_TERM};
pub use memory::InMemoryRaftLog;

/// Access to a member's replicated log.
///
/// The log is append-only from the leader's point of view and safe for
/// concurrent readers. Entries at or below `prev_index` have been pruned;
/// the term at `prev_index` itself is still known.
pub trait RaftLog: Send + Sync {
    /// Index of the last pruned entry, `BASE_INDEX` if nothing was pruned
    fn prev_index(&self) -> LogIndex;

    /// Index of the last appended entry
    fn append_index(&self) -> LogIndex;

    /// Term of the entry at `index`, `None` if pruned or not yet appended
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Read a single retained entry
    fn read_entry(&self, index: LogIndex) -> Option<LogEntry>;

    /// Read the inclusive range `[from, to]`.
    ///
    /// Returns `None` unless every entry in the range is retained.
    fn read_range(&self, from: LogIndex, to: LogIndex) -> Option<Vec<LogEntry>> {
        (from..=to).map(|index| self.read_entry(index)).collect()
    }

    /// First index still present in the log
    fn earliest_retained_index(&self) -> LogIndex {
        self.prev_index() + 1
    }

    /// Discard the whole log and continue after `(index, term)`.
    ///
    /// Used once a snapshot install has moved local state past the log. A
    /// log that already reaches beyond `index` is left alone.
    fn skip(&self, index: LogIndex, term: Term);
}
