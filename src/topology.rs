//! Cluster Topology
//!
//! Who is in the cluster, in which role, and where each member serves
//! catch-up requests. Discovery itself is outside this crate; the
//! `TopologyService` trait is the seam, and `StaticTopology` a complete
//! in-process implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::id::MemberId;

/// Role of a member in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberRole {
    /// Voting member of the consensus group
    Core,
    /// Non-voting member that only pulls data
    ReadReplica,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Core => write!(f, "CORE"),
            MemberRole::ReadReplica => write!(f, "READ_REPLICA"),
        }
    }
}

/// A known cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: MemberId,
    pub role: MemberRole,
    /// Address (host:port) of the member's catch-up server
    pub catchup_address: String,
    /// Server groups the member belongs to
    #[serde(default)]
    pub groups: Vec<String>,
}

impl MemberInfo {
    pub fn core(id: impl Into<MemberId>, catchup_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: MemberRole::Core,
            catchup_address: catchup_address.into(),
            groups: Vec::new(),
        }
    }

    pub fn read_replica(id: impl Into<MemberId>, catchup_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: MemberRole::ReadReplica,
            catchup_address: catchup_address.into(),
            groups: Vec::new(),
        }
    }

    /// Add server groups
    pub fn in_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn is_in_any_group(&self, groups: &[String]) -> bool {
        self.groups.iter().any(|g| groups.contains(g))
    }
}

/// View of the cluster topology
#[async_trait]
pub trait TopologyService: Send + Sync {
    /// This member's id
    fn local_member(&self) -> &MemberId;

    /// Current core members, including this one if it is a core
    async fn core_members(&self) -> Vec<MemberInfo>;

    /// Current read replicas, including this one if it is a replica
    async fn read_replicas(&self) -> Vec<MemberInfo>;

    /// Look up a member by id
    async fn find(&self, member: &MemberId) -> Option<MemberInfo>;

    /// Resolve the catch-up address of `member`
    async fn find_catchup_address(&self, member: &MemberId) -> Result<String> {
        self.find(member)
            .await
            .map(|info| info.catchup_address)
            .ok_or_else(|| Error::UnknownMember(member.clone()))
    }
}

/// Topology maintained in process
pub struct StaticTopology {
    local: MemberId,
    members: RwLock<HashMap<MemberId, MemberInfo>>,
}

impl StaticTopology {
    pub fn new(local: MemberId, members: impl IntoIterator<Item = MemberInfo>) -> Self {
        let members = members.into_iter().map(|m| (m.id.clone(), m)).collect();
        Self {
            local,
            members: RwLock::new(members),
        }
    }

    /// Add or replace a member
    pub async fn upsert(&self, member: MemberInfo) {
        tracing::debug!("Topology: {} is {} at {}", member.id, member.role, member.catchup_address);
        self.members.write().await.insert(member.id.clone(), member);
    }

    /// Remove a member, returning its last known info
    pub async fn remove(&self, member: &MemberId) -> Option<MemberInfo> {
        let removed = self.members.write().await.remove(member);
        if removed.is_some() {
            tracing::info!("Topology: {} left the cluster", member);
        }
        removed
    }

    async fn with_role(&self, role: MemberRole) -> Vec<MemberInfo> {
        let mut members: Vec<MemberInfo> = self
            .members
            .read()
            .await
            .values()
            .filter(|m| m.role == role)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }
}

#[async_trait]
impl TopologyService for StaticTopology {
    fn local_member(&self) -> &MemberId {
        &self.local
    }

    async fn core_members(&self) -> Vec<MemberInfo> {
        self.with_role(MemberRole::Core).await
    }

    async fn read_replicas(&self) -> Vec<MemberInfo> {
        self.with_role(MemberRole::ReadReplica).await
    }

    async fn find(&self, member: &MemberId) -> Option<MemberInfo> {
        self.members.read().await.get(member).cloned()
    }
}
