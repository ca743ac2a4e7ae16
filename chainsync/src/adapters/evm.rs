mod abi_registry;
mod json_rpc;

pub use abi_registry::AbiRegistry;
pub use json_rpc::EvmJsonRpc;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Block as EthersBlock, Log, Transaction as EthersTransaction, TransactionReceipt, H256, U64};
use futures_util::future::try_join_all;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::blocks::{Block, Event, Transaction, TransactionStatus};
use crate::hashes::{h160_to_string, h256_to_string};
use crate::{Chain, ChainId};

use super::{AdapterError, BlockStream, ChainAdapter};

const NEW_HEADS_CAPACITY: usize = 16;

/// Adapter for EVM compatible chains.
#[derive(Clone, Debug)]
pub struct EvmAdapter {
    chain_id: ChainId,
    json_rpc: Arc<dyn EvmJsonRpc>,
    abi_registry: Arc<AbiRegistry>,
    ws_url: Option<String>,
    cadence: Duration,
    max_concurrent_fetches: usize,
}

impl EvmAdapter {
    pub fn new(chain: &Chain, json_rpc: Arc<dyn EvmJsonRpc>) -> Result<Self, AdapterError> {
        Ok(Self {
            chain_id: chain.id.clone(),
            json_rpc,
            abi_registry: Arc::new(AbiRegistry::new(&chain.event_abis)?),
            ws_url: chain.ws_url.clone(),
            cadence: Duration::from_millis(chain.block_cadence_ms),
            max_concurrent_fetches: chain.max_concurrent_fetches,
        })
    }

    async fn fetch_receipts(
        &self,
        height: u64,
        transaction_hashes: Vec<H256>,
    ) -> Result<Vec<TransactionReceipt>, AdapterError> {
        match self.json_rpc.get_block_receipts(height).await {
            Ok(receipts) => Ok(receipts),
            Err(error) if !transaction_hashes.is_empty() => {
                debug!(
                    chain_id = %self.chain_id,
                    height,
                    %error,
                    "block receipts unavailable, fetching receipts one by one"
                );

                let receipts = try_join_all(
                    transaction_hashes.into_iter().map(|hash| self.json_rpc.get_transaction_receipt(hash)),
                )
                .await?;

                Ok(receipts.into_iter().flatten().collect())
            }
            Err(_) => Ok(vec![]),
        }
    }

    fn normalize(
        &self,
        block: EthersBlock<EthersTransaction>,
        receipts: Vec<TransactionReceipt>,
    ) -> Result<Block, AdapterError> {
        let number = block
            .number
            .ok_or_else(|| AdapterError::Transient("received a pending block".to_string()))?
            .as_u64();
        let hash = block
            .hash
            .ok_or_else(|| AdapterError::Transient(format!("block {number} has no hash")))?;
        let hash = h256_to_string(&hash);

        let mut receipts_by_hash: HashMap<_, _> =
            receipts.into_iter().map(|r| (r.transaction_hash, r)).collect();

        let transactions = block
            .transactions
            .into_iter()
            .enumerate()
            .map(|(index, transaction)| {
                let receipt = receipts_by_hash.remove(&transaction.hash);
                self.normalize_transaction(number, &hash, index, transaction, receipt)
            })
            .collect();

        Ok(Block {
            chain_id: self.chain_id.clone(),
            number,
            parent_hash: h256_to_string(&block.parent_hash),
            hash,
            timestamp: block.timestamp.low_u64() as i64,
            gas_used: Some(block.gas_used.low_u64()),
            gas_limit: Some(block.gas_limit.low_u64()),
            producer: block.author.as_ref().map(h160_to_string),
            transactions,
        })
    }

    fn normalize_transaction(
        &self,
        block_number: u64,
        block_hash: &str,
        index: usize,
        transaction: EthersTransaction,
        receipt: Option<TransactionReceipt>,
    ) -> Transaction {
        let transaction_hash = h256_to_string(&transaction.hash);

        let (status, fee, events) = match receipt {
            Some(receipt) => {
                let status = match receipt.status {
                    Some(status) if status == U64::zero() => TransactionStatus::Failed,
                    _ => TransactionStatus::Confirmed,
                };
                let fee = receipt
                    .effective_gas_price
                    .zip(receipt.gas_used)
                    .map(|(gas_price, gas_used)| (gas_price * gas_used).to_string());
                let events = receipt
                    .logs
                    .iter()
                    .enumerate()
                    .map(|(log_index, log)| {
                        self.normalize_log(block_number, &transaction_hash, log_index as u32, log)
                    })
                    .collect();

                (status, fee, events)
            }
            None => (TransactionStatus::Pending, None, vec![]),
        };

        Transaction {
            hash: transaction_hash,
            block_hash: Some(block_hash.to_string()),
            block_number: Some(block_number),
            index: transaction.transaction_index.map(|i| i.as_u32()).unwrap_or(index as u32),
            sender: Some(h160_to_string(&transaction.from)),
            receiver: transaction.to.as_ref().map(h160_to_string),
            value: transaction.value.to_string(),
            fee,
            payload: transaction.input.to_string(),
            status,
            events,
            balance_deltas: vec![],
        }
    }

    fn normalize_log(&self, block_number: u64, transaction_hash: &str, log_index: u32, log: &Log) -> Event {
        let decoded = self.abi_registry.decode(&log.topics, &log.data);
        let (name, params) = match decoded {
            Some((name, params)) => (Some(name), params),
            None => (None, vec![]),
        };

        Event {
            transaction_hash: transaction_hash.to_string(),
            block_number,
            log_index,
            block_log_index: log.log_index.map(|i| i.low_u32()),
            contract_address: h160_to_string(&log.address),
            signature: log.topics.first().map(h256_to_string).unwrap_or_default(),
            name,
            params,
            topics: log.topics.iter().map(h256_to_string).collect(),
            data: log.data.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches
    }

    async fn latest_height(&self) -> Result<u64, AdapterError> {
        Ok(self.json_rpc.get_block_number().await?.as_u64())
    }

    async fn fetch_block(&self, height: u64) -> Result<Block, AdapterError> {
        let block = self
            .json_rpc
            .get_block_with_txs(height)
            .await?
            .ok_or_else(|| AdapterError::Transient(format!("block {height} is not available yet")))?;

        let transaction_hashes = block.transactions.iter().map(|tx| tx.hash).collect();
        let receipts = self.fetch_receipts(height, transaction_hashes).await?;

        self.normalize(block, receipts)
    }

    fn subscribe_new_blocks(&self, from: u64) -> BlockStream {
        let block_stream = BlockStream::new(Arc::new(self.clone()), from, self.cadence);

        match &self.ws_url {
            Some(ws_url) => block_stream.with_heads(spawn_new_heads(&self.chain_id, ws_url)),
            None => block_stream,
        }
    }
}

/// Forwards the heights of pushed new heads until the receiver is dropped.
fn spawn_new_heads(chain_id: &ChainId, ws_url: &str) -> mpsc::Receiver<u64> {
    let (sender, receiver) = mpsc::channel(NEW_HEADS_CAPACITY);
    let chain_id = chain_id.clone();
    let ws_url = ws_url.to_string();

    tokio::spawn(async move {
        let provider = match ethers::providers::Provider::<ethers::providers::Ws>::connect(&ws_url).await {
            Ok(provider) => provider,
            Err(error) => {
                warn!(%chain_id, %error, "could not connect to websocket endpoint");
                return;
            }
        };

        let mut heads = match ethers::providers::Middleware::subscribe_blocks(&provider).await {
            Ok(heads) => heads,
            Err(error) => {
                warn!(%chain_id, %error, "could not subscribe to new heads");
                return;
            }
        };

        while let Some(head) = heads.next().await {
            let Some(number) = head.number else { continue };

            if sender.send(number.as_u64()).await.is_err() {
                break;
            }
        }
    });

    receiver
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use ethers::abi::{encode, HumanReadableParser, Token};
    use ethers::providers::ProviderError;
    use ethers::types::{Bytes, H160, U256};

    use super::*;
    use crate::ChainKind;

    const TRANSFER: &str = "event Transfer(address indexed from, address indexed to, uint256 value)";

    #[derive(Debug)]
    struct FixedJsonRpc {
        block: EthersBlock<EthersTransaction>,
        receipts: Vec<TransactionReceipt>,
        serves_block_receipts: bool,
        receipt_calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl EvmJsonRpc for FixedJsonRpc {
        async fn get_block_number(&self) -> Result<U64, ProviderError> {
            Ok(self.block.number.unwrap_or_default())
        }

        async fn get_block_with_txs(
            &self,
            number: u64,
        ) -> Result<Option<EthersBlock<EthersTransaction>>, ProviderError> {
            Ok(Some(self.block.clone()).filter(|block| block.number == Some(number.into())))
        }

        async fn get_block_receipts(&self, _number: u64) -> Result<Vec<TransactionReceipt>, ProviderError> {
            if !self.serves_block_receipts {
                return Err(ProviderError::CustomError("method not found".to_string()));
            }

            Ok(self.receipts.clone())
        }

        async fn get_transaction_receipt(
            &self,
            hash: H256,
        ) -> Result<Option<TransactionReceipt>, ProviderError> {
            self.receipt_calls.fetch_add(1, Ordering::SeqCst);

            Ok(self.receipts.iter().find(|receipt| receipt.transaction_hash == hash).cloned())
        }
    }

    fn transaction(index: u64) -> EthersTransaction {
        EthersTransaction {
            hash: H256::from_low_u64_be(0xa0 + index),
            transaction_index: Some(index.into()),
            from: H160::from_low_u64_be(1),
            to: Some(H160::from_low_u64_be(2)),
            value: U256::from(1_000u64),
            input: Bytes::from(vec![0xde, 0xad]),
            ..Default::default()
        }
    }

    fn transfer_log(block_log_index: u64) -> Log {
        Log {
            address: H160::from_low_u64_be(0xc0),
            topics: vec![
                HumanReadableParser::parse_event(TRANSFER).unwrap().signature(),
                H256::from(H160::from_low_u64_be(1)),
                H256::from(H160::from_low_u64_be(2)),
            ],
            data: Bytes::from(encode(&[Token::Uint(U256::from(1_000u64))])),
            log_index: Some(block_log_index.into()),
            ..Default::default()
        }
    }

    fn unknown_log(block_log_index: u64) -> Log {
        Log {
            address: H160::from_low_u64_be(0xc1),
            topics: vec![H256::from_low_u64_be(0xff)],
            log_index: Some(block_log_index.into()),
            ..Default::default()
        }
    }

    /// Block 100 with a succeeded, a failed and a receipt-less transaction.
    fn json_rpc(serves_block_receipts: bool) -> FixedJsonRpc {
        let block = EthersBlock {
            number: Some(100u64.into()),
            hash: Some(H256::from_low_u64_be(100)),
            parent_hash: H256::from_low_u64_be(99),
            timestamp: U256::from(1_700_000_000u64),
            gas_used: U256::from(71_000u64),
            gas_limit: U256::from(30_000_000u64),
            author: Some(H160::from_low_u64_be(0xbe)),
            transactions: vec![transaction(0), transaction(1), transaction(2)],
            ..Default::default()
        };

        let receipts = vec![
            TransactionReceipt {
                transaction_hash: transaction(0).hash,
                status: Some(1u64.into()),
                effective_gas_price: Some(U256::from(2_000_000_000u64)),
                gas_used: Some(U256::from(21_000u64)),
                logs: vec![transfer_log(5), unknown_log(6)],
                ..Default::default()
            },
            TransactionReceipt {
                transaction_hash: transaction(1).hash,
                status: Some(0u64.into()),
                effective_gas_price: Some(U256::from(1_000_000_000u64)),
                gas_used: Some(U256::from(50_000u64)),
                ..Default::default()
            },
        ];

        FixedJsonRpc {
            block,
            receipts,
            serves_block_receipts,
            receipt_calls: AtomicU32::new(0),
        }
    }

    fn adapter(json_rpc: Arc<FixedJsonRpc>) -> EvmAdapter {
        let chain = Chain::new("ethereum", ChainKind::Evm, "http://localhost:8545").add_event_abi(TRANSFER);

        EvmAdapter::new(&chain, json_rpc).unwrap()
    }

    #[tokio::test]
    async fn normalizes_block_headers() {
        let block = adapter(Arc::new(json_rpc(true))).fetch_block(100).await.unwrap();

        assert_eq!(block.chain_id, ChainId::new("ethereum"));
        assert_eq!(block.number, 100);
        assert_eq!(block.hash, h256_to_string(&H256::from_low_u64_be(100)));
        assert_eq!(block.parent_hash, h256_to_string(&H256::from_low_u64_be(99)));
        assert_eq!(block.timestamp, 1_700_000_000);
        assert_eq!(block.gas_used, Some(71_000));
        assert_eq!(block.gas_limit, Some(30_000_000));
        assert_eq!(block.producer, Some(h160_to_string(&H160::from_low_u64_be(0xbe))));
        assert_eq!(block.transactions.len(), 3);
        assert!(block.transactions.iter().all(|tx| tx.belongs_to(&block.hash)));
    }

    #[tokio::test]
    async fn maps_receipt_statuses_and_fees() {
        let block = adapter(Arc::new(json_rpc(true))).fetch_block(100).await.unwrap();
        let [succeeded, failed, pending] = &block.transactions[..] else {
            panic!("expected three transactions");
        };

        assert_eq!(succeeded.status, TransactionStatus::Confirmed);
        assert_eq!(succeeded.fee.as_deref(), Some("42000000000000"));
        assert_eq!(succeeded.value, "1000");
        assert_eq!(succeeded.payload, "0xdead");

        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(failed.fee.as_deref(), Some("50000000000000"));
        assert_eq!(failed.index, 1);

        assert_eq!(pending.status, TransactionStatus::Pending);
        assert_eq!(pending.fee, None);
        assert!(pending.events.is_empty());
    }

    #[tokio::test]
    async fn decodes_registered_logs_and_keeps_both_log_indexes() {
        let block = adapter(Arc::new(json_rpc(true))).fetch_block(100).await.unwrap();
        let events = &block.transactions[0].events;

        assert_eq!(events.len(), 2);

        assert_eq!(events[0].log_index, 0);
        assert_eq!(events[0].block_log_index, Some(5));
        assert_eq!(events[0].name.as_deref(), Some("Transfer"));
        assert_eq!(
            events[0].params.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["from", "to", "value"]
        );
        assert_eq!(events[0].params[2].value, "1000");
        assert_eq!(events[0].contract_address, h160_to_string(&H160::from_low_u64_be(0xc0)));

        assert_eq!(events[1].log_index, 1);
        assert_eq!(events[1].block_log_index, Some(6));
        assert_eq!(events[1].name, None);
        assert!(events[1].params.is_empty());
        assert_eq!(events[1].signature, h256_to_string(&H256::from_low_u64_be(0xff)));
    }

    #[tokio::test]
    async fn falls_back_to_transaction_receipts() {
        let json_rpc = Arc::new(json_rpc(false));
        let block = adapter(json_rpc.clone()).fetch_block(100).await.unwrap();

        assert_eq!(json_rpc.receipt_calls.load(Ordering::SeqCst), 3);
        assert_eq!(block.transactions[0].status, TransactionStatus::Confirmed);
        assert_eq!(block.transactions[0].events.len(), 2);
        assert_eq!(block.transactions[1].status, TransactionStatus::Failed);
        assert_eq!(block.transactions[2].status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn waits_for_blocks_not_produced_yet() {
        let adapter = adapter(Arc::new(json_rpc(true)));

        assert_eq!(adapter.latest_height().await.unwrap(), 100);
        assert!(matches!(adapter.fetch_block(101).await, Err(AdapterError::Transient(_))));
    }
}
