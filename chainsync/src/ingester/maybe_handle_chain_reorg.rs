use std::time::Duration;

use tracing::{debug, warn};

use crate::adapters::{with_rpc_timeout, ChainAdapter};
use crate::blocks::{Block, BlockRef};
use crate::chain_reorg::UnsavedReorgedBlock;
use crate::config::RetryPolicy;
use crate::errors::SyncError;
use crate::event_stream::StreamEvent;
use crate::metrics::Metrics;
use crate::repos::Repo;
use crate::retries::with_retries;
use crate::Chain;

/// Rolls back every persisted block from the fork point when `block` conflicts
/// with persisted history that is no longer canonical. Returns the fork point
/// of a handled reorg.
///
/// Persisted blocks the adapter still serves as canonical are never rolled back.
/// A transaction already owned by one of them is a repeated hash, and a `block`
/// that does not fit on top of them is stale: it fails transiently so that it
/// gets fetched again.
pub async fn run<R: Repo>(
    repo: &R,
    adapter: &dyn ChainAdapter,
    chain: &Chain,
    block: &Block,
    retry_policy: &RetryPolicy,
    rpc_timeout: Duration,
) -> Result<Option<u64>, SyncError> {
    let Some(conflicting_height) = get_conflicting_height(repo, adapter, block, rpc_timeout).await?
    else {
        return Ok(None);
    };

    let fork_point = find_fork_point(repo, adapter, chain, block, conflicting_height, rpc_timeout)
        .await?;

    handle_chain_reorg(repo, chain, block, fork_point, retry_policy).await?;

    Ok(Some(fork_point))
}

/// Lowest persisted height that disagrees with `block` and is no longer canonical.
async fn get_conflicting_height<R: Repo>(
    repo: &R,
    adapter: &dyn ChainAdapter,
    block: &Block,
    rpc_timeout: Duration,
) -> Result<Option<u64>, SyncError> {
    let chain_id = &block.chain_id;

    // An identical block was skipped before getting here
    if let Some(persisted) = repo.get_block_ref_by_number(chain_id, block.number).await? {
        return confirm_lineage_conflict(adapter, block, &persisted, rpc_timeout).await.map(Some);
    }

    if !block.is_genesis() {
        if let Some(parent) = repo.get_block_ref_by_number(chain_id, block.number - 1).await? {
            if !block.is_child_of(&parent) {
                return confirm_lineage_conflict(adapter, block, &parent, rpc_timeout).await.map(Some);
            }
        }
    }

    let transaction_refs = repo.get_transaction_refs(chain_id, &block.transaction_hashes()).await?;
    let mut owners: Vec<_> = transaction_refs
        .into_iter()
        .filter(|transaction_ref| transaction_ref.block_hash != block.hash)
        .map(|transaction_ref| (transaction_ref.block_number, transaction_ref.block_hash))
        .collect();
    owners.sort();
    owners.dedup();

    for (owner_number, owner_hash) in owners {
        if is_canonical(adapter, owner_number, &owner_hash, rpc_timeout).await? {
            debug!(
                %chain_id,
                height = block.number,
                owner_height = owner_number,
                "transactions repeated from a canonical block"
            );
            continue;
        }

        return Ok(Some(owner_number));
    }

    Ok(None)
}

/// Height of `persisted` when the adapter no longer serves it as canonical.
/// Fails transiently when it still does, since `block` cannot fit on it.
async fn confirm_lineage_conflict(
    adapter: &dyn ChainAdapter,
    block: &Block,
    persisted: &BlockRef,
    rpc_timeout: Duration,
) -> Result<u64, SyncError> {
    if is_canonical(adapter, persisted.number, &persisted.hash, rpc_timeout).await? {
        return Err(SyncError::TransientRpc(format!(
            "block {} {} of {} is off the canonical chain",
            block.number, block.hash, block.chain_id
        )));
    }

    Ok(persisted.number)
}

async fn is_canonical(
    adapter: &dyn ChainAdapter,
    height: u64,
    hash: &str,
    rpc_timeout: Duration,
) -> Result<bool, SyncError> {
    let canonical = fetch_canonical_block(adapter, height, rpc_timeout).await?;

    Ok(canonical.hash == hash)
}

async fn fetch_canonical_block(
    adapter: &dyn ChainAdapter,
    height: u64,
    rpc_timeout: Duration,
) -> Result<Block, SyncError> {
    let block = Metrics::observe_rpc(
        adapter.chain_id(),
        "fetch_block",
        with_rpc_timeout(rpc_timeout, adapter.fetch_block(height)),
    )
    .await?;

    Ok(block)
}

/// Walks back from a height known to have diverged while persisted hashes
/// disagree with the adapter's canonical ones, never past the chain's finality depth.
async fn find_fork_point<R: Repo>(
    repo: &R,
    adapter: &dyn ChainAdapter,
    chain: &Chain,
    block: &Block,
    conflicting_height: u64,
    rpc_timeout: Duration,
) -> Result<u64, SyncError> {
    let beyond_finality = || SyncError::ReorgBeyondFinality {
        detected_at: block.number,
        finality_depth: chain.finality_depth.value(),
    };

    let mut fork_point = conflicting_height;

    loop {
        if !chain.finality_depth.covers(block.number, fork_point) {
            return Err(beyond_finality());
        }
        if fork_point == 0 {
            break;
        }

        let Some(persisted) = repo.get_block_ref_by_number(&chain.id, fork_point - 1).await? else {
            break;
        };
        let canonical = fetch_canonical_block(adapter, fork_point - 1, rpc_timeout).await?;

        if persisted.hash == canonical.hash {
            break;
        }

        fork_point -= 1;
    }

    Ok(fork_point)
}

async fn handle_chain_reorg<R: Repo>(
    repo: &R,
    chain: &Chain,
    block: &Block,
    fork_point: u64,
    retry_policy: &RetryPolicy,
) -> Result<(), SyncError> {
    let reorged_blocks = repo.get_blocks(&chain.id, fork_point, None).await?;
    let retractions = StreamEvent::for_retracted_blocks(&reorged_blocks)?;
    let reorged_block = UnsavedReorgedBlock::new(&chain.id, fork_point, block.number);

    warn!(
        chain_id = %chain.id,
        fork_point,
        detected_at = block.number,
        depth = reorged_block.depth(),
        retracted_blocks = reorged_blocks.len(),
        "rolling back chain reorg"
    );

    Metrics::observe_db(
        &chain.id,
        "delete_blocks_from",
        with_retries(retry_policy, "rolling back reorged blocks", || {
            repo.delete_blocks_from(&reorged_block, &retractions)
        }),
    )
    .await?;

    Ok(())
}
