//! Chain adapters turn a network's native RPC into canonical blocks.
mod block_stream;
mod evm;
mod factories;
mod reassembly;
mod utxo;

pub use block_stream::BlockStream;
pub use evm::{AbiRegistry, EvmAdapter, EvmJsonRpc};
pub use factories::{factory_for, AdapterFactory, EvmAdapterFactory, UtxoAdapterFactory};
pub use reassembly::fetch_in_order;
pub use utxo::{UtxoAdapter, UtxoJsonRpc};

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use crate::blocks::Block;
use crate::ChainId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Timeouts, dropped connections, rate limits. Retryable.
    #[error("transient RPC failure: {0}")]
    Transient(String),
    /// Malformed endpoint or configuration. Never retried.
    #[error("invalid chain configuration: {0}")]
    FatalConfig(String),
}

/// Bounds an adapter call. An elapsed timeout is transient.
pub async fn with_rpc_timeout<T>(
    rpc_timeout: Duration,
    call: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::time::timeout(rpc_timeout, call).await.map_err(|_elapsed| {
        AdapterError::Transient(format!("RPC call timed out after {}ms", rpc_timeout.as_millis()))
    })?
}

#[async_trait::async_trait]
pub trait ChainAdapter: Debug + Send + Sync {
    fn chain_id(&self) -> &ChainId;

    /// Upper bound of concurrent block fetches in `fetch_block_range`.
    fn max_concurrent_fetches(&self) -> usize;

    async fn latest_height(&self) -> Result<u64, AdapterError>;

    async fn fetch_block(&self, height: u64) -> Result<Block, AdapterError>;

    /// Blocks `from..=to` in ascending order, regardless of the order fetches complete in.
    async fn fetch_block_range(&self, from: u64, to: u64) -> Result<Vec<Block>, AdapterError> {
        fetch_in_order(from, to, self.max_concurrent_fetches(), |height| {
            self.fetch_block(height)
        })
        .await
    }

    /// Infinite stream of blocks starting at `from`.
    fn subscribe_new_blocks(&self, from: u64) -> BlockStream;
}
