use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::Event;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[display("pending")]
    Pending,
    #[display("confirmed")]
    Confirmed,
    #[display("failed")]
    Failed,
}

impl TransactionStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Net change of an address balance caused by one UTXO transaction.
/// Unit is the chain's smallest denomination, e.g. satoshis.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub address: String,
    pub delta: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    /// Owning block. Once set it never changes; a different block claiming
    /// the same transaction signals a reorg.
    pub block_hash: Option<String>,
    pub block_number: Option<u64>,
    pub index: u32,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    /// Decimal string so 256-bit values survive intact.
    pub value: String,
    pub fee: Option<String>,
    /// Hex encoded input data or script.
    pub payload: String,
    pub status: TransactionStatus,
    pub events: Vec<Event>,
    pub balance_deltas: Vec<BalanceDelta>,
}

impl Transaction {
    pub fn belongs_to(&self, block_hash: &str) -> bool {
        self.block_hash.as_deref() == Some(block_hash)
    }
}
