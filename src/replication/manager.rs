//! Log Shipping Manager
//!
//! Owns one shipper actor per follower for as long as this member leads.

use std::collections::HashMap;
use std::sync::Arc;

use super::actor::ShipperHandle;
use super::protocol::AppendEntriesResponse;
use super::shipper::{FollowerProgress, LeaderContext, LogShipper};
use super::{ReplicationConfig, Transport};
use crate::error::{Error, Result};
use crate::id::MemberId;
use crate::log::{LogEntry, LogIndex, RaftLog, Term};

/// Log shipping for the current membership
pub struct LogShippingManager {
    /// This member's id
    leader_id: MemberId,
    /// Leader's log, shared read-only with every shipper
    log: Arc<dyn RaftLog>,
    /// Replication configuration
    config: ReplicationConfig,
    /// Opens the message channel to each follower
    transport: Arc<dyn Transport>,
    /// Current leader context, `None` while not leading
    context: Option<LeaderContext>,
    /// Running shippers by follower
    shippers: HashMap<MemberId, ShipperHandle>,
}

impl LogShippingManager {
    pub fn new(
        leader_id: MemberId,
        log: Arc<dyn RaftLog>,
        config: ReplicationConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            leader_id,
            log,
            config,
            transport,
            context: None,
            shippers: HashMap::new(),
        }
    }

    /// Start shipping to `members` after winning an election
    pub async fn start(&mut self, context: LeaderContext, members: &[MemberId]) {
        tracing::info!(
            "Starting log shipping for term {} to {} members",
            context.term,
            members.len()
        );
        self.stop_all().await;
        self.context = Some(context);
        self.on_membership_changed(members).await;
    }

    /// Reconcile running shippers with the new membership
    pub async fn on_membership_changed(&mut self, members: &[MemberId]) {
        let Some(context) = self.context else {
            return;
        };

        let removed: Vec<MemberId> = self
            .shippers
            .keys()
            .filter(|id| !members.contains(id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(handle) = self.shippers.remove(&id) {
                tracing::info!("Member {} removed, stopping its shipper", id);
                handle.stop().await;
            }
        }

        for member in members {
            if *member == self.leader_id || self.shippers.contains_key(member) {
                continue;
            }
            let shipper = LogShipper::new(
                self.leader_id.clone(),
                member.clone(),
                self.log.clone(),
                self.config.clone(),
                context,
            );
            let outbound = self.transport.open(member);
            let handle = ShipperHandle::spawn(shipper, &self.config, outbound);
            self.shippers.insert(member.clone(), handle);
        }
    }

    /// Forward newly appended entries to every shipper
    pub fn on_new_entries(&self, prev_index: LogIndex, prev_term: Term, entries: &[LogEntry]) {
        for handle in self.shippers.values() {
            if let Err(e) = handle.on_new_entries(prev_index, prev_term, entries.to_vec()) {
                tracing::warn!("Failed to forward entries: {}", e);
            }
        }
    }

    /// Propagate a new term or commit index
    pub fn on_leader_context(&mut self, context: LeaderContext) {
        self.context = Some(context);
        for handle in self.shippers.values() {
            if let Err(e) = handle.on_leader_context(context) {
                tracing::warn!("Failed to update leader context: {}", e);
            }
        }
    }

    /// Route a follower's response to its shipper.
    ///
    /// Returns `Error::StaleTerm` when the follower has seen a newer term,
    /// in which case this member must step down.
    pub fn handle_append_response(&self, response: &AppendEntriesResponse) -> Result<()> {
        let Some(context) = self.context else {
            return Ok(());
        };
        if response.term > context.term {
            return Err(Error::StaleTerm {
                remote: response.term,
                local: context.term,
            });
        }
        if response.term < context.term {
            tracing::debug!(
                "Ignoring response from {} for old term {}",
                response.from,
                response.term
            );
            return Ok(());
        }

        let handle = self
            .shippers
            .get(&response.from)
            .ok_or_else(|| Error::UnknownMember(response.from.clone()))?;
        if response.success {
            handle.on_match(response.match_index)
        } else {
            handle.on_mismatch(response.append_index)
        }
    }

    /// Progress of the shipper for `member`
    pub fn progress(&self, member: &MemberId) -> Option<FollowerProgress> {
        self.shippers.get(member).map(ShipperHandle::progress)
    }

    /// Followers currently being shipped to
    pub fn followers(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self.shippers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop all shipping, e.g. after losing leadership
    pub async fn stop(&mut self) {
        tracing::info!("Stopping log shipping");
        self.context = None;
        self.stop_all().await;
    }

    async fn stop_all(&mut self) {
        let handles: Vec<ShipperHandle> = self.shippers.drain().map(|(_, h)| h).collect();
        futures::future::join_all(handles.into_iter().map(ShipperHandle::stop)).await;
    }
}
