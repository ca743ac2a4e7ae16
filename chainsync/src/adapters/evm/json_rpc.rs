use std::fmt::Debug;

use ethers::prelude::Middleware;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::{Block, BlockNumber, Transaction, TransactionReceipt, H256, U64};

use crate::adapters::AdapterError;

/// The slice of EVM JSON-RPC the adapter needs.
#[async_trait::async_trait]
pub trait EvmJsonRpc: Debug + Send + Sync {
    async fn get_block_number(&self) -> Result<U64, ProviderError>;

    async fn get_block_with_txs(
        &self,
        number: u64,
    ) -> Result<Option<Block<Transaction>>, ProviderError>;

    async fn get_block_receipts(&self, number: u64) -> Result<Vec<TransactionReceipt>, ProviderError>;

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ProviderError>;
}

#[async_trait::async_trait]
impl EvmJsonRpc for Provider<Http> {
    async fn get_block_number(&self) -> Result<U64, ProviderError> {
        Middleware::get_block_number(self).await
    }

    async fn get_block_with_txs(
        &self,
        number: u64,
    ) -> Result<Option<Block<Transaction>>, ProviderError> {
        Middleware::get_block_with_txs(self, BlockNumber::Number(number.into())).await
    }

    async fn get_block_receipts(&self, number: u64) -> Result<Vec<TransactionReceipt>, ProviderError> {
        Middleware::get_block_receipts(self, BlockNumber::Number(number.into())).await
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ProviderError> {
        Middleware::get_transaction_receipt(self, hash).await
    }
}

impl From<ProviderError> for AdapterError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::UnsupportedRPC | ProviderError::EnsError(_) => {
                AdapterError::FatalConfig(error.to_string())
            }
            _ => AdapterError::Transient(error.to_string()),
        }
    }
}
