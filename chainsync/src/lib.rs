pub mod adapters;
pub mod blocks;
mod chain_reorg;
mod chains;
pub mod config;
#[cfg(feature = "postgres")]
mod diesels;
mod errors;
pub mod event_stream;
mod hashes;
pub mod ingester;
mod metrics;
mod orchestrator;
mod plugins;
mod repos;
mod retries;
pub mod sync_states;

pub use adapters::{AdapterError, AdapterFactory, BlockStream, ChainAdapter};
pub use blocks::{BalanceDelta, Block, Event, EventParam, Transaction, TransactionStatus};
pub use chain_reorg::{FinalityDepth, ReorgedBlock, UnsavedReorgedBlock};
pub use chains::{Chain, ChainId, ChainKind};
pub use config::{Config, ConfigError, HealthConfig, RetryPolicy};
pub use errors::{ChainsyncError, SyncError};
pub use event_stream::{BroadcastStream, EventStream, StreamError, StreamEvent, StreamEventKind, Topic};
pub use ingester::{IngestOutcome, IngestionPipeline};
pub use crate::metrics::Metrics;
pub use orchestrator::{HealthMonitor, HealthTransition, SyncLoop, SyncOrchestrator};
pub use plugins::{EnabledChains, PluginDescriptor, PluginRegistry};
pub use repos::*;
pub use retries::with_retries;
pub use sync_states::{SyncMode, SyncStateError, SyncStates, SyncStatus};

#[cfg(feature = "postgres")]
pub use event_stream::{PostgresStream, StreamLogEntry};

#[cfg(feature = "postgres")]
pub type ChainsyncRepo = PostgresRepo;

#[cfg(feature = "postgres")]
pub type ChainsyncRepoPool = PostgresRepoPool;

#[cfg(feature = "postgres")]
pub type ChainsyncRepoConn<'a> = PostgresRepoConn<'a>;

#[cfg(feature = "postgres")]
pub type ChainsyncRepoRawQueryClient = PostgresRepoRawQueryClient;

/// Builds an orchestrator from `config` and starts syncing every enabled chain.
///
/// # Example
/// ```no_run
/// use chainsync::{Chain, ChainKind, Config, MemoryRepo};
///
/// # async fn run() -> Result<(), chainsync::ChainsyncError> {
/// let config = Config::new(MemoryRepo::new())
///     .add_chain(Chain::new("ethereum", ChainKind::Evm, "https://eth.example.com"));
///
/// let orchestrator = chainsync::sync_chains(config).await?;
/// orchestrator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub async fn sync_chains<R: Repo>(config: Config<R>) -> Result<SyncOrchestrator<R>, ChainsyncError> {
    let orchestrator = SyncOrchestrator::new(config).await?;
    orchestrator.start().await?;

    Ok(orchestrator)
}
