use serde::{Deserialize, Serialize};

use crate::ChainId;

use super::{Event, Transaction};

/// Canonical block, shared by every chain family.
///
/// `(chain_id, number)` and `(chain_id, hash)` are each unique once persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub chain_id: ChainId,
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Seconds since the unix epoch.
    pub timestamp: i64,
    pub gas_used: Option<u64>,
    pub gas_limit: Option<u64>,
    /// Miner, validator or coinbase recipient.
    pub producer: Option<String>,
    pub transactions: Vec<Transaction>,
}

/// Just enough of a persisted block to verify linear history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
}

impl From<&Block> for BlockRef {
    fn from(block: &Block) -> Self {
        Self {
            number: block.number,
            hash: block.hash.clone(),
            parent_hash: block.parent_hash.clone(),
        }
    }
}

impl Block {
    pub fn is_child_of(&self, parent: &BlockRef) -> bool {
        self.number == parent.number + 1
            && self.parent_hash == parent.hash
    }

    pub fn transaction_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.hash.clone()).collect()
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.transactions.iter().flat_map(|tx| tx.events.iter())
    }

    /// Blocks without any linear history to verify against, e.g. genesis.
    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }
}
