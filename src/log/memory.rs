//! In-Memory Replicated Log

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::entry::{LogEntry, LogIndex, Term, BASE_INDEX, BASE_TERM};
use super::RaftLog;
use crate::error::{Error, Result};

struct LogState {
    /// Index of the last pruned entry
    prev_index: LogIndex,
    /// Term of the last pruned entry
    prev_term: Term,
    /// Retained entries, the first one at `prev_index + 1`
    entries: VecDeque<LogEntry>,
}

impl LogState {
    fn append_index(&self) -> LogIndex {
        self.prev_index + self.entries.len() as LogIndex
    }

    fn slot(&self, index: LogIndex) -> Option<usize> {
        if index <= self.prev_index || index > self.append_index() {
            return None;
        }
        Some((index - self.prev_index - 1) as usize)
    }
}

/// Replicated log held in memory.
///
/// Readers and the single appending leader share it through an `Arc`;
/// every operation takes the internal lock once, so a range read never
/// observes a half-applied prune.
pub struct InMemoryRaftLog {
    state: RwLock<LogState>,
}

impl Default for InMemoryRaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRaftLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState {
                prev_index: BASE_INDEX,
                prev_term: BASE_TERM,
                entries: VecDeque::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry, returning its index
    pub fn append(&self, entry: LogEntry) -> Result<LogIndex> {
        let mut state = self.write();
        let last_term = state
            .entries
            .back()
            .map(|e| e.term)
            .unwrap_or(state.prev_term);
        if entry.term < last_term {
            return Err(Error::Log(format!(
                "Entry term {} is older than last term {}",
                entry.term, last_term
            )));
        }
        state.entries.push_back(entry);
        Ok(state.append_index())
    }

    /// Append several entries, returning the new append index
    pub fn append_all(&self, entries: impl IntoIterator<Item = LogEntry>) -> Result<LogIndex> {
        let mut index = self.append_index();
        for entry in entries {
            index = self.append(entry)?;
        }
        Ok(index)
    }

    /// Remove every entry at or after `from_index`
    pub fn truncate(&self, from_index: LogIndex) -> Result<()> {
        let mut state = self.write();
        if from_index <= state.prev_index {
            return Err(Error::Log(format!(
                "Cannot truncate at {} which is at or below the pruned index {}",
                from_index, state.prev_index
            )));
        }
        if let Some(slot) = state.slot(from_index) {
            state.entries.truncate(slot);
        }
        Ok(())
    }

    /// Prune every entry below `below`, keeping at least the last entry.
    ///
    /// Returns the new prev index.
    pub fn prune(&self, below: LogIndex) -> LogIndex {
        let mut state = self.write();
        let limit = below.min(state.append_index());
        while state.prev_index + 1 < limit {
            match state.entries.pop_front() {
                Some(entry) => {
                    state.prev_index += 1;
                    state.prev_term = entry.term;
                }
                None => break,
            }
        }
        tracing::debug!("Pruned log below {}, prev index now {}", below, state.prev_index);
        state.prev_index
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Whether no entries are retained
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }
}

impl RaftLog for InMemoryRaftLog {
    fn prev_index(&self) -> LogIndex {
        self.read().prev_index
    }

    fn append_index(&self) -> LogIndex {
        self.read().append_index()
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        let state = self.read();
        if index == state.prev_index {
            return Some(state.prev_term);
        }
        state.slot(index).map(|slot| state.entries[slot].term)
    }

    fn read_entry(&self, index: LogIndex) -> Option<LogEntry> {
        let state = self.read();
        state.slot(index).map(|slot| state.entries[slot].clone())
    }

    fn read_range(&self, from: LogIndex, to: LogIndex) -> Option<Vec<LogEntry>> {
        if from > to {
            return Some(Vec::new());
        }
        let state = self.read();
        let first = state.slot(from)?;
        let last = state.slot(to)?;
        Some(state.entries.range(first..=last).cloned().collect())
    }

    fn skip(&self, index: LogIndex, term: Term) {
        let mut state = self.write();
        if index > state.append_index() {
            tracing::info!("Skipping log to {} (term {})", index, term);
            state.entries.clear();
            state.prev_index = index;
            state.prev_term = term;
        }
    }
}
