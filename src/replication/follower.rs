//! Follower Side of Log Shipping
//!
//! Applies append requests to a local log and produces the response the
//! leader's shipper reacts to.

use super::protocol::{AppendEntriesResponse, RaftMessage};
use crate::error::{Error, Result};
use crate::id::MemberId;
use crate::log::{InMemoryRaftLog, LogIndex, RaftLog, Term};

/// Handle an append entries request against `log`.
///
/// Entries that conflict with the local log are truncated before the
/// leader's entries are appended. Entries that already match are left
/// untouched, so a delayed request never shortens the log.
pub fn handle_append_entries(
    log: &InMemoryRaftLog,
    local_id: &MemberId,
    local_term: Term,
    request: &RaftMessage,
) -> Result<AppendEntriesResponse> {
    let RaftMessage::AppendEntriesRequest {
        leader_term,
        prev_log_index,
        prev_log_term,
        entries,
        ..
    } = request
    else {
        return Err(Error::Internal(format!(
            "Expected an append request, got {}",
            request.type_name()
        )));
    };

    let reject = |log: &InMemoryRaftLog, term: Term| AppendEntriesResponse {
        from: local_id.clone(),
        term,
        success: false,
        match_index: -1,
        append_index: log.append_index(),
    };

    if *leader_term < local_term {
        tracing::debug!(
            "Rejecting append from stale term {} (local term {})",
            leader_term,
            local_term
        );
        return Ok(reject(log, local_term));
    }
    let term = *leader_term;

    // history at or below the local base is covered by an installed snapshot
    let base = log.prev_index();
    if *prev_log_index >= base && log.term_at(*prev_log_index) != Some(*prev_log_term) {
        tracing::debug!(
            "Log mismatch at {}: leader has term {}, local has {:?}",
            prev_log_index,
            prev_log_term,
            log.term_at(*prev_log_index)
        );
        return Ok(reject(log, term));
    }

    for (offset, entry) in entries.iter().enumerate() {
        let index = prev_log_index + 1 + offset as LogIndex;
        if index <= base {
            continue;
        }
        match log.term_at(index) {
            Some(existing) if existing == entry.term => continue,
            Some(_) => {
                tracing::info!("Truncating conflicting entries from {}", index);
                log.truncate(index)?;
                log.append(entry.clone())?;
            }
            None => {
                log.append(entry.clone())?;
            }
        }
    }

    Ok(AppendEntriesResponse {
        from: local_id.clone(),
        term,
        success: true,
        match_index: prev_log_index + entries.len() as LogIndex,
        append_index: log.append_index(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;

    fn request(prev_index: LogIndex, prev_term: Term, entries: Vec<LogEntry>) -> RaftMessage {
        RaftMessage::AppendEntriesRequest {
            leader_id: MemberId::new("leader"),
            leader_term: 3,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            leader_commit: -1,
        }
    }

    #[test]
    fn test_append_to_empty_log() {
        let log = InMemoryRaftLog::new();
        let id = MemberId::new("f1");
        let msg = request(-1, 0, vec![LogEntry::new(1, vec![1u8]), LogEntry::new(1, vec![2u8])]);

        let response = handle_append_entries(&log, &id, 1, &msg).unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, 1);
        assert_eq!(response.term, 3);
        assert_eq!(log.append_index(), 1);
    }

    #[test]
    fn test_mismatch_reports_append_index() {
        let log = InMemoryRaftLog::new();
        log.append(LogEntry::new(1, vec![])).unwrap();
        let msg = request(4, 2, vec![LogEntry::new(2, vec![])]);

        let response = handle_append_entries(&log, &MemberId::new("f1"), 1, &msg).unwrap();
        assert!(!response.success);
        assert_eq!(response.append_index, 0);
    }

    #[test]
    fn test_conflicting_suffix_replaced() {
        let log = InMemoryRaftLog::new();
        log.append_all([LogEntry::new(1, vec![]), LogEntry::new(1, vec![]), LogEntry::new(2, vec![])])
            .unwrap();
        let msg = request(0, 1, vec![LogEntry::new(3, vec![7u8])]);

        let response = handle_append_entries(&log, &MemberId::new("f1"), 2, &msg).unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, 1);
        assert_eq!(log.append_index(), 1);
        assert_eq!(log.term_at(1), Some(3));
    }

    #[test]
    fn test_append_below_skipped_base() {
        let log = InMemoryRaftLog::new();
        log.skip(5, 2);
        let msg = request(3, 2, vec![LogEntry::new(2, vec![]), LogEntry::new(2, vec![]), LogEntry::new(3, vec![])]);

        let response = handle_append_entries(&log, &MemberId::new("f1"), 2, &msg).unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, 6);
        assert_eq!(log.prev_index(), 5);
        assert_eq!(log.append_index(), 6);
        assert_eq!(log.term_at(6), Some(3));
    }

    #[test]
    fn test_stale_leader_rejected() {
        let log = InMemoryRaftLog::new();
        let msg = request(-1, 0, vec![LogEntry::new(1, vec![])]);

        let response = handle_append_entries(&log, &MemberId::new("f1"), 7, &msg).unwrap();
        assert!(!response.success);
        assert_eq!(response.term, 7);
        assert!(log.is_empty());
    }

    #[test]
    fn test_rejects_non_append_message() {
        let log = InMemoryRaftLog::new();
        let msg = RaftMessage::LogCompactionInfo {
            leader_id: MemberId::new("leader"),
            leader_term: 1,
            prev_log_index: 0,
            earliest_retained_index: 2,
            earliest_retained_term: None,
        };
        assert!(handle_append_entries(&log, &MemberId::new("f1"), 1, &msg).is_err());
    }
}
