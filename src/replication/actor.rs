//! Shipper Actor
//!
//! Runs one `LogShipper` on its own task. Events arrive on a bounded queue
//! and are processed strictly in order; the retry deadline is driven by the
//! same loop, so the shipper's state is never touched concurrently.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::shipper::{FollowerProgress, LeaderContext, LogShipper};
use super::{Outbound, RaftMessage, ReplicationConfig};
use crate::error::{Error, Result};
use crate::id::MemberId;
use crate::log::{LogEntry, LogIndex, Term};

/// Events delivered to a shipper
#[derive(Debug)]
enum ShipperCommand {
    Match(LogIndex),
    Mismatch(LogIndex),
    NewEntries {
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<LogEntry>,
    },
    LeaderContext(LeaderContext),
}

/// Handle to a running shipper task
pub struct ShipperHandle {
    follower: MemberId,
    tx: mpsc::Sender<ShipperCommand>,
    progress: watch::Receiver<FollowerProgress>,
    task: JoinHandle<()>,
}

impl ShipperHandle {
    /// Start `shipper` on a new task, sending its messages to `outbound`
    pub fn spawn(mut shipper: LogShipper, config: &ReplicationConfig, outbound: Outbound) -> Self {
        let follower = shipper.follower().clone();
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (progress_tx, progress) = watch::channel(shipper.progress());

        let task = tokio::spawn(async move {
            let first = shipper.start();
            progress_tx.send_replace(shipper.progress());
            if let Some(msg) = first {
                if !send(&outbound, shipper.follower(), msg).await {
                    return;
                }
            }
            run(shipper, rx, progress_tx, outbound).await;
        });

        Self {
            follower,
            tx,
            progress,
            task,
        }
    }

    pub fn follower(&self) -> &MemberId {
        &self.follower
    }

    /// Latest published progress
    pub fn progress(&self) -> FollowerProgress {
        *self.progress.borrow()
    }

    /// Subscribe to progress updates
    pub fn subscribe(&self) -> watch::Receiver<FollowerProgress> {
        self.progress.clone()
    }

    pub fn on_match(&self, match_index: LogIndex) -> Result<()> {
        self.offer(ShipperCommand::Match(match_index))
    }

    pub fn on_mismatch(&self, append_index: LogIndex) -> Result<()> {
        self.offer(ShipperCommand::Mismatch(append_index))
    }

    pub fn on_new_entries(
        &self,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<LogEntry>,
    ) -> Result<()> {
        self.offer(ShipperCommand::NewEntries {
            prev_index,
            prev_term,
            entries,
        })
    }

    pub fn on_leader_context(&self, context: LeaderContext) -> Result<()> {
        self.offer(ShipperCommand::LeaderContext(context))
    }

    /// Stop the task; queued events are discarded
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        tracing::info!("Stopped log shipper to {}", self.follower);
    }

    /// Enqueue without blocking the caller.
    ///
    /// A full queue drops the event; the shipper recovers through its
    /// retry timer.
    fn offer(&self, command: ShipperCommand) -> Result<()> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(command)) => {
                tracing::warn!(
                    "Shipper queue for {} is full, dropping {}",
                    self.follower,
                    command_name(&command)
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::ShipperClosed(self.follower.clone()))
            }
        }
    }
}

fn command_name(command: &ShipperCommand) -> &'static str {
    match command {
        ShipperCommand::Match(_) => "Match",
        ShipperCommand::Mismatch(_) => "Mismatch",
        ShipperCommand::NewEntries { .. } => "NewEntries",
        ShipperCommand::LeaderContext(_) => "LeaderContext",
    }
}

async fn run(
    mut shipper: LogShipper,
    mut rx: mpsc::Receiver<ShipperCommand>,
    progress_tx: watch::Sender<FollowerProgress>,
    outbound: Outbound,
) {
    loop {
        let deadline = shipper.next_deadline();
        let out = tokio::select! {
            command = rx.recv() => match command {
                Some(command) => apply(&mut shipper, command),
                None => break,
            },
            _ = wait_for(deadline) => shipper.on_timeout(Instant::now()),
        };

        progress_tx.send_if_modified(|current| {
            let latest = shipper.progress();
            if *current == latest {
                false
            } else {
                *current = latest;
                true
            }
        });

        if let Some(msg) = out {
            if !send(&outbound, shipper.follower(), msg).await {
                break;
            }
        }
    }
    tracing::debug!("Shipper loop for {} exited", shipper.follower());
}

fn apply(shipper: &mut LogShipper, command: ShipperCommand) -> Option<RaftMessage> {
    match command {
        ShipperCommand::Match(index) => shipper.on_match(index),
        ShipperCommand::Mismatch(index) => shipper.on_mismatch(index),
        ShipperCommand::NewEntries {
            prev_index,
            prev_term,
            entries,
        } => shipper.on_new_entries(prev_index, prev_term, &entries),
        ShipperCommand::LeaderContext(context) => {
            shipper.on_leader_context(context);
            None
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Returns false once the outbound channel is gone
async fn send(outbound: &Outbound, follower: &MemberId, msg: RaftMessage) -> bool {
    tracing::trace!("Sending {} to {}", msg.type_name(), follower);
    outbound.send(msg).await.is_ok()
}
