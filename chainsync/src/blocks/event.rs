use serde::{Deserialize, Serialize};

/// Contract/log event emitted by a transaction.
///
/// `(chain_id, transaction_hash, log_index)` is unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub transaction_hash: String,
    pub block_number: u64,
    /// Index within the originating transaction.
    pub log_index: u32,
    /// Index within the block, as reported by the node.
    pub block_log_index: Option<u32>,
    pub contract_address: String,
    /// Topic0 of the log.
    pub signature: String,
    /// Name of the event when its ABI is registered.
    pub name: Option<String>,
    pub params: Vec<EventParam>,
    pub topics: Vec<String>,
    pub data: String,
}

impl Event {
    pub fn key(&self) -> String {
        format!("{}:{}", self.transaction_hash, self.log_index)
    }
}

/// Decoded parameter. Values are kept loosely typed, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventParam {
    pub name: String,
    pub value: serde_json::Value,
}
