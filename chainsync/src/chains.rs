use std::collections::HashMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::chain_reorg::FinalityDepth;

/// Identifies a chain network, e.g. `ethereum`, `polygon` or `bitcoin`.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: &str) -> Self {
        Self(id.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChainId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChainId {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<ChainId> for String {
    fn from(chain_id: ChainId) -> Self {
        chain_id.0
    }
}

/// Family of RPC protocol spoken by a chain's nodes.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    #[display("evm")]
    Evm,
    #[display("utxo")]
    Utxo,
}

/// Represents a chain network and how to sync it.
///
/// Entries are read once at startup and again on every enable/disable call.
/// They are never mutated while a batch is in flight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chain {
    pub id: ChainId,
    pub kind: ChainKind,
    pub json_rpc_url: String,
    /// Websocket endpoint for push notification of new heads.
    /// Polling at `block_cadence_ms` is used when absent.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "defaults::block_cadence_ms")]
    pub block_cadence_ms: u64,
    #[serde(default = "defaults::blocks_per_batch")]
    pub blocks_per_batch: u64,
    #[serde(default = "defaults::max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Explicit start point. Genesis when zero.
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub finality_depth: FinalityDepth,
    #[serde(default = "defaults::safety_margin")]
    pub safety_margin: u64,
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    /// Human readable event signatures used to decode EVM logs,
    /// e.g. `event Transfer(address indexed from, address indexed to, uint256 value)`
    #[serde(default)]
    pub event_abis: Vec<String>,
    /// Overrides of RPC method names keyed by their default name.
    #[serde(default)]
    pub rpc_methods: HashMap<String, String>,
}

impl Chain {
    /// Builds the chain network
    ///
    /// # Example
    /// ```
    /// use chainsync::{Chain, ChainKind};
    ///
    /// Chain::new("ethereum", ChainKind::Evm, "https://eth-mainnet.g.alchemy.com/v2/...")
    ///     .with_start_block(18_000_000)
    ///     .with_blocks_per_batch(50);
    /// ```
    pub fn new(id: &str, kind: ChainKind, json_rpc_url: &str) -> Self {
        Self {
            id: ChainId::new(id),
            kind,
            json_rpc_url: json_rpc_url.to_string(),
            ws_url: None,
            block_cadence_ms: defaults::block_cadence_ms(),
            blocks_per_batch: defaults::blocks_per_batch(),
            max_concurrent_fetches: defaults::max_concurrent_fetches(),
            start_block: 0,
            finality_depth: FinalityDepth::default(),
            safety_margin: defaults::safety_margin(),
            enabled: defaults::enabled(),
            event_abis: vec![],
            rpc_methods: HashMap::new(),
        }
    }

    pub fn with_ws_url(mut self, ws_url: &str) -> Self {
        self.ws_url = Some(ws_url.to_string());

        self
    }

    pub fn with_block_cadence_ms(mut self, block_cadence_ms: u64) -> Self {
        self.block_cadence_ms = block_cadence_ms;

        self
    }

    pub fn with_blocks_per_batch(mut self, blocks_per_batch: u64) -> Self {
        self.blocks_per_batch = blocks_per_batch;

        self
    }

    pub fn with_max_concurrent_fetches(mut self, max_concurrent_fetches: usize) -> Self {
        self.max_concurrent_fetches = max_concurrent_fetches;

        self
    }

    pub fn with_start_block(mut self, start_block: u64) -> Self {
        self.start_block = start_block;

        self
    }

    pub fn with_finality_depth(mut self, finality_depth: u64) -> Self {
        self.finality_depth = FinalityDepth::new(finality_depth);

        self
    }

    pub fn with_safety_margin(mut self, safety_margin: u64) -> Self {
        self.safety_margin = safety_margin;

        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;

        self
    }

    pub fn add_event_abi(mut self, abi: &str) -> Self {
        self.event_abis.push(abi.to_string());

        self
    }

    pub fn with_rpc_method(mut self, default_name: &str, name: &str) -> Self {
        self.rpc_methods.insert(default_name.to_string(), name.to_string());

        self
    }

    /// Resolves the configured name of an RPC method.
    pub fn rpc_method<'a>(&'a self, default_name: &'a str) -> &'a str {
        self.rpc_methods.get(default_name).map(String::as_str).unwrap_or(default_name)
    }
}

mod defaults {
    pub fn block_cadence_ms() -> u64 {
        12_000
    }
    pub fn blocks_per_batch() -> u64 {
        20
    }
    pub fn max_concurrent_fetches() -> usize {
        4
    }
    pub fn safety_margin() -> u64 {
        2
    }
    pub fn enabled() -> bool {
        true
    }
}
