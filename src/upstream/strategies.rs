//! Built-in Upstream Strategies

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::UpstreamStrategy;
use crate::error::{Error, Result};
use crate::id::MemberId;
use crate::topology::{MemberInfo, TopologyService};

pub const CONNECT_WITHIN_SERVER_GROUP: &str = "connect-randomly-within-server-group";
pub const CONNECT_TO_RANDOM_CORE: &str = "connect-to-random-core-server";
pub const CONNECT_TO_RANDOM_READ_REPLICA: &str = "connect-to-random-read-replica";

/// Names accepted in configuration
pub const KNOWN_STRATEGIES: [&str; 3] = [
    CONNECT_WITHIN_SERVER_GROUP,
    CONNECT_TO_RANDOM_CORE,
    CONNECT_TO_RANDOM_READ_REPLICA,
];

/// Build a strategy from its configured name
pub fn strategy_by_name(
    name: &str,
    topology: Arc<dyn TopologyService>,
    server_groups: &[String],
) -> Result<Box<dyn UpstreamStrategy>> {
    match name {
        CONNECT_WITHIN_SERVER_GROUP => Ok(Box::new(ConnectRandomlyWithinServerGroup {
            topology,
            groups: server_groups.to_vec(),
        })),
        CONNECT_TO_RANDOM_CORE => Ok(Box::new(ConnectToRandomCoreServer { topology })),
        CONNECT_TO_RANDOM_READ_REPLICA => Ok(Box::new(ConnectToRandomReadReplica { topology })),
        other => Err(Error::Config(format!(
            "Unknown upstream strategy '{}', expected one of {}",
            other,
            KNOWN_STRATEGIES.join(", ")
        ))),
    }
}

/// Pick a random member other than `local`
fn pick_random(local: &MemberId, candidates: Vec<MemberInfo>) -> Option<MemberId> {
    let candidates: Vec<MemberId> = candidates
        .into_iter()
        .map(|m| m.id)
        .filter(|id| id != local)
        .collect();
    candidates.choose(&mut rand::thread_rng()).cloned()
}

/// Any member sharing one of this member's server groups
pub struct ConnectRandomlyWithinServerGroup {
    topology: Arc<dyn TopologyService>,
    groups: Vec<String>,
}

#[async_trait]
impl UpstreamStrategy for ConnectRandomlyWithinServerGroup {
    fn name(&self) -> &str {
        CONNECT_WITHIN_SERVER_GROUP
    }

    async fn select_upstream(&self) -> Result<Option<MemberId>> {
        if self.groups.is_empty() {
            return Ok(None);
        }
        let mut members = self.topology.core_members().await;
        members.extend(self.topology.read_replicas().await);
        members.retain(|m| m.is_in_any_group(&self.groups));
        Ok(pick_random(self.topology.local_member(), members))
    }
}

/// Any core member
pub struct ConnectToRandomCoreServer {
    topology: Arc<dyn TopologyService>,
}

#[async_trait]
impl UpstreamStrategy for ConnectToRandomCoreServer {
    fn name(&self) -> &str {
        CONNECT_TO_RANDOM_CORE
    }

    async fn select_upstream(&self) -> Result<Option<MemberId>> {
        let cores = self.topology.core_members().await;
        Ok(pick_random(self.topology.local_member(), cores))
    }
}

/// Any read replica
pub struct ConnectToRandomReadReplica {
    topology: Arc<dyn TopologyService>,
}

#[async_trait]
impl UpstreamStrategy for ConnectToRandomReadReplica {
    fn name(&self) -> &str {
        CONNECT_TO_RANDOM_READ_REPLICA
    }

    async fn select_upstream(&self) -> Result<Option<MemberId>> {
        let replicas = self.topology.read_replicas().await;
        Ok(pick_random(self.topology.local_member(), replicas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;

    fn topology(local: &str) -> Arc<dyn TopologyService> {
        Arc::new(StaticTopology::new(
            MemberId::new(local),
            vec![
                MemberInfo::core("core-1", "a:1").in_groups(["eu"]),
                MemberInfo::core("core-2", "a:2").in_groups(["us"]),
                MemberInfo::read_replica("rr-1", "b:1").in_groups(["eu"]),
            ],
        ))
    }

    #[tokio::test]
    async fn test_core_strategy_never_selects_self() {
        let strategy = strategy_by_name(CONNECT_TO_RANDOM_CORE, topology("core-1"), &[]).unwrap();
        for _ in 0..20 {
            assert_eq!(
                strategy.select_upstream().await.unwrap(),
                Some(MemberId::new("core-2"))
            );
        }
    }

    #[tokio::test]
    async fn test_read_replica_strategy() {
        let strategy =
            strategy_by_name(CONNECT_TO_RANDOM_READ_REPLICA, topology("core-2"), &[]).unwrap();
        assert_eq!(
            strategy.select_upstream().await.unwrap(),
            Some(MemberId::new("rr-1"))
        );

        let alone = strategy_by_name(CONNECT_TO_RANDOM_READ_REPLICA, topology("rr-1"), &[]).unwrap();
        assert_eq!(alone.select_upstream().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_group_strategy() {
        let groups = vec!["eu".to_string()];
        let strategy =
            strategy_by_name(CONNECT_WITHIN_SERVER_GROUP, topology("rr-1"), &groups).unwrap();
        assert_eq!(
            strategy.select_upstream().await.unwrap(),
            Some(MemberId::new("core-1"))
        );

        let ungrouped = strategy_by_name(CONNECT_WITHIN_SERVER_GROUP, topology("rr-1"), &[]).unwrap();
        assert_eq!(ungrouped.select_upstream().await.unwrap(), None);
    }

    #[test]
    fn test_unknown_strategy_name() {
        let result = strategy_by_name("connect-to-the-moon", topology("core-1"), &[]);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
