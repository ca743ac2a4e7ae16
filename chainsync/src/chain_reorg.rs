use serde::{Deserialize, Serialize};

use crate::ChainId;

/// Number of confirmations after which a block is assumed immutable.
/// Bounds how far back a fork point may be searched for and rolled back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalityDepth {
    value: u64,
}

impl Default for FinalityDepth {
    fn default() -> Self {
        Self::new(64)
    }
}

impl FinalityDepth {
    pub fn new(value: u64) -> Self {
        Self { value }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn covers(&self, block_number: u64, fork_point: u64) -> bool {
        block_number.saturating_sub(fork_point) <= self.value
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsavedReorgedBlock {
    pub chain_id: ChainId,
    /// Every block at or above this number was rolled back.
    pub fork_point: u64,
    /// Height of the block whose arrival revealed the reorg.
    pub detected_at: u64,
}

impl UnsavedReorgedBlock {
    pub fn new(chain_id: &ChainId, fork_point: u64, detected_at: u64) -> Self {
        Self {
            chain_id: chain_id.clone(),
            fork_point,
            detected_at,
        }
    }

    pub fn depth(&self) -> u64 {
        self.detected_at.saturating_sub(self.fork_point) + 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgedBlock {
    pub id: i64,
    pub chain_id: ChainId,
    pub fork_point: u64,
    pub depth: u64,
    pub inserted_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_forks_within_depth_only() {
        let finality_depth = FinalityDepth::new(2);

        assert!(finality_depth.covers(10, 8));
        assert!(!finality_depth.covers(10, 7));
    }
}
