//! Upstream Selection
//!
//! Picks the member a follower or read replica should download state from.
//! Strategies are consulted in configured order; the first one to name a
//! member wins.

pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::id::MemberId;
use crate::topology::TopologyService;

pub use strategies::{strategy_by_name, CONNECT_TO_RANDOM_CORE, KNOWN_STRATEGIES};

/// A pluggable way of choosing an upstream member
#[async_trait]
pub trait UpstreamStrategy: Send + Sync {
    /// Name used in configuration and logs
    fn name(&self) -> &str;

    /// Propose a member, or `None` if this strategy has no candidate
    async fn select_upstream(&self) -> Result<Option<MemberId>>;
}

/// The chosen upstream and the strategy that chose it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCandidate {
    pub member: MemberId,
    pub strategy: String,
}

/// Ordered list of strategies with a per-call time limit
pub struct UpstreamSelector {
    strategies: Vec<Box<dyn UpstreamStrategy>>,
    strategy_timeout: Duration,
}

impl UpstreamSelector {
    pub fn new(strategies: Vec<Box<dyn UpstreamStrategy>>, strategy_timeout: Duration) -> Self {
        Self {
            strategies,
            strategy_timeout,
        }
    }

    /// Build the configured strategies.
    ///
    /// The random core strategy is always available as the last resort.
    pub fn from_config(
        config: &UpstreamConfig,
        server_groups: &[String],
        topology: Arc<dyn TopologyService>,
    ) -> Result<Self> {
        let mut names: Vec<&str> = config.strategies.iter().map(String::as_str).collect();
        if !names.contains(&CONNECT_TO_RANDOM_CORE) {
            names.push(CONNECT_TO_RANDOM_CORE);
        }

        let strategies = names
            .into_iter()
            .map(|name| strategy_by_name(name, topology.clone(), server_groups))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            "Upstream strategies: {}",
            strategies
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self::new(strategies, config.strategy_timeout()))
    }

    /// Names of the strategies, in precedence order
    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Ask each strategy in turn for an upstream member
    pub async fn best_upstream(&self) -> Result<UpstreamCandidate> {
        for strategy in &self.strategies {
            tracing::debug!("Trying upstream strategy {}", strategy.name());
            match timeout(self.strategy_timeout, strategy.select_upstream()).await {
                Ok(Ok(Some(member))) => {
                    tracing::info!(
                        "Selected upstream {} using strategy {}",
                        member,
                        strategy.name()
                    );
                    return Ok(UpstreamCandidate {
                        member,
                        strategy: strategy.name().to_string(),
                    });
                }
                Ok(Ok(None)) => {
                    tracing::debug!("Strategy {} found no upstream", strategy.name());
                }
                Ok(Err(e)) => {
                    tracing::warn!("Strategy {} failed: {}", strategy.name(), e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Strategy {} timed out after {:?}",
                        strategy.name(),
                        self.strategy_timeout
                    );
                }
            }
        }
        Err(Error::SelectionExhausted)
    }
}
