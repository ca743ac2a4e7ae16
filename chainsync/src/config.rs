use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event_stream::{BroadcastStream, EventStream};
use crate::repos::Repo;
use crate::{Chain, ChainId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one chain must be configured")]
    NoChains,
    #[error("chain {0} is configured more than once")]
    DuplicateChain(ChainId),
    #[error("chain {chain_id} is invalid: {reason}")]
    InvalidChain { chain_id: ChainId, reason: String },
    #[error("could not read chains config: {0}")]
    Io(String),
    #[error("could not parse chains config: {0}")]
    Parse(String),
}

/// Exponential backoff: `base_delay_ms * 2^attempt`, capped at `max_delay_ms`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 1_000, 60_000)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);

        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Same policy with every delay doubled, used while a chain is degraded.
    pub fn slowed_down(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms.saturating_mul(2),
            max_delay_ms: self.max_delay_ms.saturating_mul(2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures within `failure_window_ms` that degrade a chain.
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    /// Consecutive successes that recover a degraded chain.
    pub recovery_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_ms: 60_000,
            recovery_threshold: 3,
        }
    }
}

impl HealthConfig {
    pub fn new(failure_threshold: u32, failure_window_ms: u64, recovery_threshold: u32) -> Self {
        Self {
            failure_threshold,
            failure_window_ms,
            recovery_threshold,
        }
    }
}

#[derive(Clone)]
pub struct Config<R: Repo> {
    pub repo: R,
    pub stream: Arc<dyn EventStream>,
    pub chains: Vec<Chain>,
    /// TOML file re-read whenever a chain is enabled or disabled.
    pub chains_source: Option<PathBuf>,
    pub adapter_retry_policy: RetryPolicy,
    pub persistence_retry_policy: RetryPolicy,
    pub publish_retry_policy: RetryPolicy,
    pub health: HealthConfig,
    pub rpc_timeout_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub feed_capacity: usize,
    pub outbox_batch_size: u32,
}

impl<R: Repo> Config<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            stream: Arc::new(BroadcastStream::default()),
            chains: vec![],
            chains_source: None,
            adapter_retry_policy: RetryPolicy::default(),
            persistence_retry_policy: RetryPolicy::new(5, 500, 30_000),
            publish_retry_policy: RetryPolicy::new(3, 500, 10_000),
            health: HealthConfig::default(),
            rpc_timeout_ms: 10_000,
            shutdown_deadline_ms: 30_000,
            feed_capacity: 64,
            outbox_batch_size: 256,
        }
    }

    pub fn add_chain(mut self, chain: Chain) -> Self {
        self.chains.push(chain);

        self
    }

    pub fn with_stream(mut self, stream: Arc<dyn EventStream>) -> Self {
        self.stream = stream;

        self
    }

    pub fn with_chains_source(mut self, path: impl AsRef<Path>) -> Self {
        self.chains_source = Some(path.as_ref().to_path_buf());

        self
    }

    pub fn with_adapter_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.adapter_retry_policy = retry_policy;

        self
    }

    pub fn with_persistence_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.persistence_retry_policy = retry_policy;

        self
    }

    pub fn with_publish_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.publish_retry_policy = retry_policy;

        self
    }

    pub fn with_health_config(mut self, health: HealthConfig) -> Self {
        self.health = health;

        self
    }

    pub fn with_rpc_timeout_ms(mut self, rpc_timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = rpc_timeout_ms;

        self
    }

    pub fn with_shutdown_deadline_ms(mut self, shutdown_deadline_ms: u64) -> Self {
        self.shutdown_deadline_ms = shutdown_deadline_ms;

        self
    }

    pub fn with_feed_capacity(mut self, feed_capacity: usize) -> Self {
        self.feed_capacity = feed_capacity;

        self
    }

    pub fn with_outbox_batch_size(mut self, outbox_batch_size: u32) -> Self {
        self.outbox_batch_size = outbox_batch_size;

        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() && self.chains_source.is_none() {
            return Err(ConfigError::NoChains);
        }

        validate_chains(&self.chains)
    }
}

pub fn validate_chains(chains: &[Chain]) -> Result<(), ConfigError> {
    let mut chain_ids = HashSet::new();

    for chain in chains {
        if !chain_ids.insert(&chain.id) {
            return Err(ConfigError::DuplicateChain(chain.id.clone()));
        }

        validate_chain(chain)?;
    }

    Ok(())
}

pub fn validate_chain(chain: &Chain) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidChain {
        chain_id: chain.id.clone(),
        reason: reason.to_string(),
    };

    if chain.id.as_str().is_empty() {
        return Err(invalid("id must not be empty"));
    }
    if chain.json_rpc_url.trim().is_empty() {
        return Err(invalid("json_rpc_url must not be empty"));
    }
    if chain.blocks_per_batch == 0 {
        return Err(invalid("blocks_per_batch must be positive"));
    }
    if chain.max_concurrent_fetches == 0 {
        return Err(invalid("max_concurrent_fetches must be positive"));
    }
    if chain.block_cadence_ms == 0 {
        return Err(invalid("block_cadence_ms must be positive"));
    }
    if chain.finality_depth.value() == 0 {
        return Err(invalid("finality_depth must be positive"));
    }

    Ok(())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChainsFile {
    #[serde(default)]
    chains: Vec<Chain>,
}

/// Reads `[[chains]]` entries from a TOML file.
pub fn load_chains(path: impl AsRef<Path>) -> Result<Vec<Chain>, ConfigError> {
    let contents =
        std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;

    load_chains_from_str(&contents)
}

pub fn load_chains_from_str(contents: &str) -> Result<Vec<Chain>, ConfigError> {
    let chains_file: ChainsFile =
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate_chains(&chains_file.chains)?;

    Ok(chains_file.chains)
}
