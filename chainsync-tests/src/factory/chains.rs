use chainsync::{Chain, ChainKind};
use rand::Rng;

pub const START_BLOCK: u64 = 1_000;

/// EVM chain polled every 10ms, starting at [START_BLOCK].
pub fn chain(id: &str) -> Chain {
    Chain::new(id, ChainKind::Evm, "http://localhost:8545")
        .with_block_cadence_ms(10)
        .with_start_block(START_BLOCK)
}

/// Chain id that no other test run uses, for tests sharing a database.
pub fn unique_chain_id(prefix: &str) -> String {
    format!("{prefix}-{}", rand::thread_rng().gen::<u32>())
}
