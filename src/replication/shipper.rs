//! Log Shipper
//!
//! Per-follower replication state machine run on the leader. Every event
//! produces at most one outbound message, which keeps the state machine
//! synchronous and lets the owning actor deal with all I/O.
//!
//! Modes:
//! - `Mismatch`: probing backwards one entry at a time until the follower's
//!   log matches ours.
//! - `Catchup`: sending bounded batches after the match index until the
//!   follower reaches our last index.
//! - `Pipeline`: forwarding new entries as they are appended, in strict
//!   index order.

use std::sync::Arc;
use tokio::time::Instant;

use super::protocol::RaftMessage;
use super::ReplicationConfig;
use crate::id::MemberId;
use crate::log::{LogEntry, LogIndex, RaftLog, Term, BASE_INDEX};

/// Replication mode of a single follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The follower's log disagrees with ours; walking backwards
    Mismatch,
    /// Sending batches from the log until the follower reaches our tail
    Catchup,
    /// Forwarding new entries as they arrive
    Pipeline,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Mismatch => write!(f, "MISMATCH"),
            Mode::Catchup => write!(f, "CATCHUP"),
            Mode::Pipeline => write!(f, "PIPELINE"),
        }
    }
}

/// Leader state carried by every outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderContext {
    pub term: Term,
    pub commit_index: LogIndex,
}

impl LeaderContext {
    pub fn new(term: Term, commit_index: LogIndex) -> Self {
        Self { term, commit_index }
    }
}

/// Published view of a follower's replication progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerProgress {
    pub match_index: LogIndex,
    pub last_sent_index: LogIndex,
    pub mode: Mode,
}

/// Result of sending the batch that follows the match index
struct Batch {
    message: Option<RaftMessage>,
    caught_up: bool,
}

/// Replication state machine for one follower
pub struct LogShipper {
    leader_id: MemberId,
    follower: MemberId,
    log: Arc<dyn RaftLog>,
    config: ReplicationConfig,
    context: LeaderContext,
    last_sent_index: LogIndex,
    match_index: LogIndex,
    mode: Mode,
    retry_deadline: Option<Instant>,
}

impl LogShipper {
    /// Create a shipper; nothing is sent until `start`
    pub fn new(
        leader_id: MemberId,
        follower: MemberId,
        log: Arc<dyn RaftLog>,
        config: ReplicationConfig,
        context: LeaderContext,
    ) -> Self {
        Self {
            leader_id,
            follower,
            log,
            config,
            context,
            last_sent_index: BASE_INDEX,
            match_index: BASE_INDEX,
            mode: Mode::Mismatch,
            retry_deadline: None,
        }
    }

    pub fn follower(&self) -> &MemberId {
        &self.follower
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn match_index(&self) -> LogIndex {
        self.match_index
    }

    pub fn last_sent_index(&self) -> LogIndex {
        self.last_sent_index
    }

    pub fn progress(&self) -> FollowerProgress {
        FollowerProgress {
            match_index: self.match_index,
            last_sent_index: self.last_sent_index,
            mode: self.mode,
        }
    }

    /// When the shipper wants `on_timeout` to be called next
    pub fn next_deadline(&self) -> Option<Instant> {
        self.retry_deadline
    }

    /// Begin shipping by probing the follower with our tail entry
    pub fn start(&mut self) -> Option<RaftMessage> {
        tracing::info!("Starting log shipper to {}", self.follower);
        self.mode = Mode::Mismatch;
        let append_index = self.log.append_index();
        if append_index > self.log.prev_index() {
            self.send_single(append_index)
        } else {
            self.last_sent_index = append_index;
            self.send_empty(append_index)
        }
    }

    /// The follower confirmed that its log matches ours up to `new_match_index`
    pub fn on_match(&mut self, new_match_index: LogIndex) -> Option<RaftMessage> {
        if new_match_index > self.match_index {
            self.match_index = new_match_index;
        } else {
            tracing::debug!(
                "Match index for {} not progressing: {} (current {})",
                self.follower,
                new_match_index,
                self.match_index
            );
        }

        match self.mode {
            Mode::Mismatch => {
                let batch = self.send_next_batch_after_match();
                self.transition_after_batch(batch)
            }
            Mode::Catchup => {
                if self.match_index >= self.last_sent_index {
                    let batch = self.send_next_batch_after_match();
                    self.transition_after_batch(batch)
                } else {
                    None
                }
            }
            Mode::Pipeline => {
                // entries held back by the lag limit are picked up once the follower drains
                if self.match_index >= self.last_sent_index
                    && self.log.append_index() > self.last_sent_index
                {
                    let batch = self.send_next_batch_after_match();
                    self.transition_after_batch(batch)
                } else {
                    None
                }
            }
        }
    }

    /// The follower's log disagrees with our last message.
    ///
    /// `remote_append_index` is the follower's last appended index.
    pub fn on_mismatch(&mut self, remote_append_index: LogIndex) -> Option<RaftMessage> {
        let ceiling = match self.mode {
            Mode::Mismatch => self.last_sent_index - 1,
            Mode::Catchup | Mode::Pipeline => {
                tracing::info!(
                    "Mismatch in mode {} from follower {}, moving to {}",
                    self.mode,
                    self.follower,
                    Mode::Mismatch
                );
                self.mode = Mode::Mismatch;
                self.last_sent_index
            }
        };

        let index = ceiling
            .min(remote_append_index)
            .max(self.match_index)
            .max(0);
        self.send_single(index)
    }

    /// New entries were appended to the leader's log after `prev_index`.
    ///
    /// Only forwarded in `Pipeline`; while catching up the entries are
    /// dropped because catch-up re-reads them from the log.
    pub fn on_new_entries(
        &mut self,
        prev_index: LogIndex,
        prev_term: Term,
        entries: &[LogEntry],
    ) -> Option<RaftMessage> {
        if self.mode != Mode::Pipeline || entries.is_empty() {
            return None;
        }
        if prev_index < self.last_sent_index {
            return None;
        }
        let lag = (self.last_sent_index - self.match_index).max(0) as u64;
        if lag > self.config.max_allowed_shipping_lag {
            tracing::trace!(
                "Holding back entries for {}: {} unacknowledged",
                self.follower,
                lag
            );
            return None;
        }

        if prev_index > self.last_sent_index {
            let wanted_end = prev_index + entries.len() as LogIndex;
            let end = wanted_end.min(self.last_sent_index + self.batch_size());
            return self.send_range(self.last_sent_index + 1, end);
        }

        self.schedule_retry();
        self.last_sent_index = prev_index + entries.len() as LogIndex;
        Some(self.append_request(prev_index, prev_term, entries.to_vec()))
    }

    /// The leader's term or commit index changed
    pub fn on_leader_context(&mut self, context: LeaderContext) {
        self.context = context;
    }

    /// Resend if the follower has not answered within the retry interval
    pub fn on_timeout(&mut self, now: Instant) -> Option<RaftMessage> {
        match self.retry_deadline {
            Some(deadline) if now >= deadline => {}
            _ => return None,
        }

        match self.mode {
            Mode::Mismatch => self.send_single(self.last_sent_index),
            Mode::Catchup => {
                let batch = self.send_next_batch_after_match();
                self.transition_after_batch(batch)
            }
            Mode::Pipeline => {
                if self.last_sent_index > self.match_index {
                    tracing::info!(
                        "Follower {} is unresponsive in {}, moving to {}",
                        self.follower,
                        Mode::Pipeline,
                        Mode::Catchup
                    );
                    self.mode = Mode::Catchup;
                    let batch = self.send_next_batch_after_match();
                    self.transition_after_batch(batch)
                } else if self.log.append_index() > self.last_sent_index {
                    let batch = self.send_next_batch_after_match();
                    self.transition_after_batch(batch)
                } else {
                    self.send_empty(self.last_sent_index)
                }
            }
        }
    }

    fn batch_size(&self) -> LogIndex {
        self.config.catchup_batch_size.max(1) as LogIndex
    }

    fn schedule_retry(&mut self) {
        self.retry_deadline = Some(Instant::now() + self.config.retry_interval());
    }

    fn transition_after_batch(&mut self, batch: Batch) -> Option<RaftMessage> {
        let compacted = batch
            .message
            .as_ref()
            .map(RaftMessage::is_compaction_info)
            .unwrap_or(false);
        if !compacted {
            let next = if batch.caught_up {
                Mode::Pipeline
            } else {
                Mode::Catchup
            };
            if next != self.mode {
                tracing::info!(
                    "Follower {} moving from {} to {} at match index {}",
                    self.follower,
                    self.mode,
                    next,
                    self.match_index
                );
                self.mode = next;
            }
        }
        batch.message
    }

    fn send_next_batch_after_match(&mut self) -> Batch {
        let last_index = self.log.append_index();
        if last_index > self.match_index {
            let end = last_index.min(self.match_index + self.batch_size());
            Batch {
                message: self.send_range(self.match_index + 1, end),
                caught_up: end == last_index,
            }
        } else {
            Batch {
                message: None,
                caught_up: true,
            }
        }
    }

    fn send_single(&mut self, index: LogIndex) -> Option<RaftMessage> {
        let append_index = self.log.append_index();
        if index < 0 || index > append_index {
            self.last_sent_index = append_index;
            return self.send_empty(append_index);
        }

        self.schedule_retry();
        self.last_sent_index = index;

        let prev_index = index - 1;
        let Some(prev_term) = self.log.term_at(prev_index) else {
            return Some(self.compaction_info(prev_index));
        };
        if prev_term > self.context.term {
            tracing::warn!(
                "Aborting send to {}: previous term {} is ahead of leader term {}",
                self.follower,
                prev_term,
                self.context.term
            );
            return None;
        }
        let Some(entry) = self.log.read_entry(index) else {
            return Some(self.compaction_info(prev_index));
        };

        tracing::trace!("Probing {} with entry {}", self.follower, index);
        Some(self.append_request(prev_index, prev_term, vec![entry]))
    }

    fn send_range(&mut self, start: LogIndex, end: LogIndex) -> Option<RaftMessage> {
        self.schedule_retry();
        let prev_index = start - 1;
        let Some(prev_term) = self.log.term_at(prev_index) else {
            return Some(self.compaction_info(prev_index));
        };
        let Some(entries) = self.log.read_range(start, end) else {
            return Some(self.compaction_info(prev_index));
        };

        self.last_sent_index = end;
        tracing::debug!("Sending entries {}..={} to {}", start, end, self.follower);
        Some(self.append_request(prev_index, prev_term, entries))
    }

    fn send_empty(&mut self, prev_index: LogIndex) -> Option<RaftMessage> {
        self.schedule_retry();
        let Some(prev_term) = self.log.term_at(prev_index) else {
            return Some(self.compaction_info(prev_index));
        };
        Some(self.append_request(prev_index, prev_term, Vec::new()))
    }

    fn compaction_info(&mut self, prev_log_index: LogIndex) -> RaftMessage {
        let earliest = self.log.earliest_retained_index();
        tracing::warn!(
            "Entry after {} was pruned when sending to {}, earliest retained index is {}",
            prev_log_index,
            self.follower,
            earliest
        );
        self.mode = Mode::Mismatch;
        RaftMessage::LogCompactionInfo {
            leader_id: self.leader_id.clone(),
            leader_term: self.context.term,
            prev_log_index,
            earliest_retained_index: earliest,
            earliest_retained_term: self.log.term_at(earliest),
        }
    }

    fn append_request(
        &self,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
    ) -> RaftMessage {
        RaftMessage::AppendEntriesRequest {
            leader_id: self.leader_id.clone(),
            leader_term: self.context.term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.context.commit_index,
        }
    }
}
