use crate::adapters::AdapterError;
use crate::config::ConfigError;
use crate::event_stream::StreamError;
use crate::repos::RepoError;
use crate::sync_states::SyncStateError;
use crate::ChainId;

/// Failures of a chain's sync loop.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transient RPC failure: {0}")]
    TransientRpc(String),
    #[error("invalid chain configuration: {0}")]
    FatalConfig(String),
    #[error("reorg detected at {detected_at} reaches past the finality depth of {finality_depth}")]
    ReorgBeyondFinality { detected_at: u64, finality_depth: u64 },
    #[error("persistence failed: {0}")]
    Persistence(#[from] RepoError),
    #[error("stream publication failed: {0}")]
    StreamPublish(#[from] StreamError),
    #[error(transparent)]
    SyncState(#[from] SyncStateError),
}

impl SyncError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::TransientRpc(_) => "transient_rpc",
            SyncError::FatalConfig(_) => "fatal_config",
            SyncError::ReorgBeyondFinality { .. } => "reorg_beyond_finality",
            SyncError::Persistence(_) => "persistence",
            SyncError::StreamPublish(_) => "stream_publish",
            SyncError::SyncState(_) => "sync_state",
        }
    }


    /// Failures that park the batch and degrade the chain immediately.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            SyncError::Persistence(_) | SyncError::ReorgBeyondFinality { .. } | SyncError::SyncState(_)
        )
    }
}

impl From<AdapterError> for SyncError {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::Transient(message) => SyncError::TransientRpc(message),
            AdapterError::FatalConfig(message) => SyncError::FatalConfig(message),
        }
    }
}

/// Failures surfaced to callers of the control surface.
#[derive(Debug, thiserror::Error)]
pub enum ChainsyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("chain {chain_id} cannot be enabled: {reason}")]
    FatalConfig { chain_id: ChainId, reason: String },
    #[error("chain {0} is not registered")]
    UnknownChain(ChainId),
    #[error("chain {0} is disabled")]
    Disabled(ChainId),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    SyncState(#[from] SyncStateError),
}
