use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chainsync::{
    Block, BlockRef, ChainId, MemoryRepo, OutboxEntry, ReorgedBlock, Repo, RepoError, StreamEvent,
    SyncStatus, SyncStatusWrite, TransactionRef, UnsavedReorgedBlock,
};

/// [MemoryRepo] whose block writes can be made to fail.
#[derive(Clone, Debug, Default)]
pub struct FlakyRepo {
    repo: MemoryRepo,
    failing_writes: Arc<AtomicU32>,
}

impl FlakyRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` block writes.
    pub fn fail_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryRepo {
        &self.repo
    }

    fn take_failure(&self) -> Result<(), RepoError> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));

        match failed {
            Ok(_) => Err(RepoError::NotConnected("connection pool timed out".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Repo for FlakyRepo {
    async fn migrate(&self) -> Result<(), RepoError> {
        self.repo.migrate().await
    }

    async fn get_block_ref_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<BlockRef>, RepoError> {
        self.repo.get_block_ref_by_number(chain_id, number).await
    }

    async fn get_block_ref_by_hash(
        &self,
        chain_id: &ChainId,
        hash: &str,
    ) -> Result<Option<BlockRef>, RepoError> {
        self.repo.get_block_ref_by_hash(chain_id, hash).await
    }

    async fn get_transaction_refs(
        &self,
        chain_id: &ChainId,
        hashes: &[String],
    ) -> Result<Vec<TransactionRef>, RepoError> {
        self.repo.get_transaction_refs(chain_id, hashes).await
    }

    async fn get_blocks(
        &self,
        chain_id: &ChainId,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Block>, RepoError> {
        self.repo.get_blocks(chain_id, from, to).await
    }

    async fn create_block(&self, block: &Block, outbox: &[StreamEvent]) -> Result<bool, RepoError> {
        self.take_failure()?;

        self.repo.create_block(block, outbox).await
    }

    async fn delete_blocks_from(
        &self,
        reorged_block: &UnsavedReorgedBlock,
        retractions: &[StreamEvent],
    ) -> Result<(), RepoError> {
        self.take_failure()?;

        self.repo.delete_blocks_from(reorged_block, retractions).await
    }

    async fn get_reorged_blocks(&self, chain_id: &ChainId) -> Result<Vec<ReorgedBlock>, RepoError> {
        self.repo.get_reorged_blocks(chain_id).await
    }

    async fn load_sync_status(&self, chain_id: &ChainId) -> Result<Option<SyncStatus>, RepoError> {
        self.repo.load_sync_status(chain_id).await
    }

    async fn load_sync_statuses(&self) -> Result<Vec<SyncStatus>, RepoError> {
        self.repo.load_sync_statuses().await
    }

    async fn save_sync_status(
        &self,
        sync_status: &SyncStatus,
        write: SyncStatusWrite,
    ) -> Result<(), RepoError> {
        self.repo.save_sync_status(sync_status, write).await
    }

    async fn load_unpublished(
        &self,
        chain_id: &ChainId,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, RepoError> {
        self.repo.load_unpublished(chain_id, limit).await
    }

    async fn mark_published(&self, chain_id: &ChainId, ids: &[i64]) -> Result<(), RepoError> {
        self.repo.mark_published(chain_id, ids).await
    }
}
