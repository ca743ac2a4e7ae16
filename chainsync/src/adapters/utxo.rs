use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{Http, Provider, ProviderError};
use serde::Deserialize;
use serde_json::json;

use crate::blocks::{BalanceDelta, Block, Transaction, TransactionStatus};
use crate::{Chain, ChainId};

use super::{AdapterError, BlockStream, ChainAdapter};

const GET_BLOCK_COUNT: &str = "getblockcount";
const GET_BLOCK_HASH: &str = "getblockhash";
const GET_BLOCK: &str = "getblock";
/// Includes every transaction along with the outputs its inputs spend.
const GET_BLOCK_VERBOSITY: u8 = 3;
const SATOSHIS_PER_COIN: f64 = 100_000_000.0;

/// Generic JSON-RPC requests, as spoken by bitcoind and its forks.
#[async_trait::async_trait]
pub trait UtxoJsonRpc: Debug + Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;
}

#[async_trait::async_trait]
impl UtxoJsonRpc for Provider<Http> {
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        Provider::request(self, method, params).await
    }
}

#[derive(Debug, Deserialize)]
struct UtxoBlock {
    hash: String,
    height: u64,
    #[serde(default)]
    previousblockhash: Option<String>,
    time: i64,
    tx: Vec<UtxoTransaction>,
}

#[derive(Debug, Deserialize)]
struct UtxoTransaction {
    txid: String,
    #[serde(default)]
    fee: Option<f64>,
    #[serde(default)]
    hex: Option<String>,
    vin: Vec<UtxoInput>,
    vout: Vec<UtxoOutput>,
}

#[derive(Debug, Deserialize)]
struct UtxoInput {
    #[serde(default)]
    coinbase: Option<String>,
    #[serde(default)]
    prevout: Option<UtxoPrevout>,
}

#[derive(Debug, Deserialize)]
struct UtxoPrevout {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct UtxoOutput {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct ScriptPubKey {
    #[serde(default)]
    address: Option<String>,
    /// Older nodes list addresses instead.
    #[serde(default)]
    addresses: Vec<String>,
}

impl ScriptPubKey {
    fn address(&self) -> Option<&str> {
        self.address.as_deref().or_else(|| self.addresses.first().map(String::as_str))
    }
}

fn to_satoshis(value: f64) -> i64 {
    (value * SATOSHIS_PER_COIN).round() as i64
}

/// Adapter for UTXO chains (bitcoin and its forks).
#[derive(Clone, Debug)]
pub struct UtxoAdapter {
    chain_id: ChainId,
    json_rpc: Arc<dyn UtxoJsonRpc>,
    get_block_count: String,
    get_block_hash: String,
    get_block: String,
    cadence: Duration,
    max_concurrent_fetches: usize,
}

impl UtxoAdapter {
    pub fn new(chain: &Chain, json_rpc: Arc<dyn UtxoJsonRpc>) -> Self {
        Self {
            chain_id: chain.id.clone(),
            json_rpc,
            get_block_count: chain.rpc_method(GET_BLOCK_COUNT).to_string(),
            get_block_hash: chain.rpc_method(GET_BLOCK_HASH).to_string(),
            get_block: chain.rpc_method(GET_BLOCK).to_string(),
            cadence: Duration::from_millis(chain.block_cadence_ms),
            max_concurrent_fetches: chain.max_concurrent_fetches,
        }
    }

    fn normalize(&self, block: UtxoBlock) -> Block {
        let producer = block
            .tx
            .first()
            .and_then(|coinbase| coinbase.vout.iter().find_map(|o| o.script_pub_key.address()))
            .map(str::to_string);

        let transactions = block
            .tx
            .into_iter()
            .enumerate()
            .map(|(index, transaction)| {
                self.normalize_transaction(block.height, &block.hash, index as u32, transaction)
            })
            .collect();

        Block {
            chain_id: self.chain_id.clone(),
            number: block.height,
            hash: block.hash,
            parent_hash: block.previousblockhash.unwrap_or_default(),
            timestamp: block.time,
            gas_used: None,
            gas_limit: None,
            producer,
            transactions,
        }
    }

    fn normalize_transaction(
        &self,
        block_number: u64,
        block_hash: &str,
        index: u32,
        transaction: UtxoTransaction,
    ) -> Transaction {
        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();

        let mut spent = 0;
        let mut has_every_prevout = true;
        for input in transaction.vin.iter() {
            match (&input.coinbase, &input.prevout) {
                (Some(_), _) => {}
                (None, Some(prevout)) => {
                    let value = to_satoshis(prevout.value);
                    spent += value;

                    if let Some(address) = prevout.script_pub_key.address() {
                        *deltas.entry(address.to_string()).or_default() -= value;
                    }
                }
                (None, None) => has_every_prevout = false,
            }
        }

        let mut received = 0;
        for output in transaction.vout.iter() {
            let value = to_satoshis(output.value);
            received += value;

            if let Some(address) = output.script_pub_key.address() {
                *deltas.entry(address.to_string()).or_default() += value;
            }
        }

        let is_coinbase = transaction.vin.iter().any(|input| input.coinbase.is_some());
        let fee = match transaction.fee {
            Some(fee) => Some(to_satoshis(fee)),
            None if !is_coinbase && has_every_prevout => Some(spent - received),
            None => None,
        };

        let sender = transaction
            .vin
            .iter()
            .find_map(|input| input.prevout.as_ref().and_then(|p| p.script_pub_key.address()))
            .map(str::to_string);
        let receiver = transaction
            .vout
            .iter()
            .find_map(|output| output.script_pub_key.address())
            .map(str::to_string);

        Transaction {
            hash: transaction.txid,
            block_hash: Some(block_hash.to_string()),
            block_number: Some(block_number),
            index,
            sender,
            receiver,
            value: received.to_string(),
            fee: fee.map(|fee| fee.to_string()),
            payload: transaction.hex.unwrap_or_default(),
            status: TransactionStatus::Confirmed,
            events: vec![],
            balance_deltas: deltas
                .into_iter()
                .filter(|(_, delta)| *delta != 0)
                .map(|(address, delta)| BalanceDelta { address, delta })
                .collect(),
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, AdapterError> {
        let response = self.json_rpc.request(method, params).await?;

        serde_json::from_value(response)
            .map_err(|e| AdapterError::Transient(format!("malformed {method} response: {e}")))
    }
}

#[async_trait::async_trait]
impl ChainAdapter for UtxoAdapter {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches
    }

    async fn latest_height(&self) -> Result<u64, AdapterError> {
        self.request(&self.get_block_count, json!([])).await
    }

    async fn fetch_block(&self, height: u64) -> Result<Block, AdapterError> {
        let hash: String = self.request(&self.get_block_hash, json!([height])).await?;
        let block: UtxoBlock =
            self.request(&self.get_block, json!([hash, GET_BLOCK_VERBOSITY])).await?;

        if block.height != height {
            return Err(AdapterError::Transient(format!(
                "requested block {height} but received {}",
                block.height
            )));
        }

        Ok(self.normalize(block))
    }

    fn subscribe_new_blocks(&self, from: u64) -> BlockStream {
        BlockStream::new(Arc::new(self.clone()), from, self.cadence)
    }
}
