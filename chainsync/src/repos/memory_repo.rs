use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::blocks::Block;
use crate::chain_reorg::{ReorgedBlock, UnsavedReorgedBlock};
use crate::event_stream::StreamEvent;
use crate::sync_states::SyncStatus;
use crate::ChainId;

use super::repo::{
    verify_sync_status_write, BlockRef, OutboxEntry, Repo, RepoError, SyncStatusWrite,
    TransactionRef,
};

#[derive(Debug, Default)]
struct Partition {
    blocks: BTreeMap<u64, Block>,
    numbers_by_hash: HashMap<String, u64>,
    transaction_refs: HashMap<String, TransactionRef>,
    sync_status: Option<SyncStatus>,
    outbox: Vec<OutboxEntry>,
    reorged_blocks: Vec<ReorgedBlock>,
    /// Last id handed out to an outbox entry or reorged block of this chain.
    last_id: i64,
}

impl Partition {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn push_outbox(&mut self, events: &[StreamEvent]) {
        for event in events {
            let id = self.next_id();
            self.outbox.push(OutboxEntry {
                id,
                event: event.clone(),
            });
        }
    }
}

/// Repo kept in process memory, partitioned by chain id.
///
/// Each partition sits behind its own lock, so chains never contend with each other.
/// Every operation holds its partition's lock for its whole duration, which makes
/// each one atomic. Ids are only ordered within a chain.
#[derive(Clone, Debug, Default)]
pub struct MemoryRepo {
    partitions: Arc<RwLock<HashMap<ChainId, Arc<Mutex<Partition>>>>>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    async fn partition(&self, chain_id: &ChainId) -> Arc<Mutex<Partition>> {
        if let Some(partition) = self.partitions.read().await.get(chain_id) {
            return partition.clone();
        }

        self.partitions.write().await.entry(chain_id.clone()).or_default().clone()
    }
}

#[async_trait::async_trait]
impl Repo for MemoryRepo {
    async fn migrate(&self) -> Result<(), RepoError> {
        Ok(())
    }

    async fn get_block_ref_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<BlockRef>, RepoError> {
        let partition = self.partition(chain_id).await;
        let partition = partition.lock().await;

        Ok(partition.blocks.get(&number).map(BlockRef::from))
    }

    async fn get_block_ref_by_hash(
        &self,
        chain_id: &ChainId,
        hash: &str,
    ) -> Result<Option<BlockRef>, RepoError> {
        let partition = self.partition(chain_id).await;
        let partition = partition.lock().await;

        Ok(partition
            .numbers_by_hash
            .get(hash)
            .and_then(|number| partition.blocks.get(number))
            .map(BlockRef::from))
    }

    async fn get_transaction_refs(
        &self,
        chain_id: &ChainId,
        hashes: &[String],
    ) -> Result<Vec<TransactionRef>, RepoError> {
        let partition = self.partition(chain_id).await;
        let partition = partition.lock().await;

        Ok(hashes.iter().filter_map(|hash| partition.transaction_refs.get(hash).cloned()).collect())
    }

    async fn get_blocks(
        &self,
        chain_id: &ChainId,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Block>, RepoError> {
        let partition = self.partition(chain_id).await;
        let partition = partition.lock().await;

        let to = to.unwrap_or(u64::MAX);
        if from > to {
            return Ok(vec![]);
        }

        Ok(partition.blocks.range(from..=to).map(|(_, block)| block.clone()).collect())
    }

    async fn create_block(&self, block: &Block, outbox: &[StreamEvent]) -> Result<bool, RepoError> {
        let partition = self.partition(&block.chain_id).await;
        let mut partition = partition.lock().await;

        if partition.numbers_by_hash.contains_key(&block.hash) {
            return Ok(false);
        }
        if partition.blocks.contains_key(&block.number) {
            return Err(RepoError::Unknown(format!(
                "block {} of {} is already persisted under another hash",
                block.number, block.chain_id
            )));
        }

        for transaction in block.transactions.iter() {
            partition.transaction_refs.entry(transaction.hash.clone()).or_insert(TransactionRef {
                hash: transaction.hash.clone(),
                block_hash: block.hash.clone(),
                block_number: block.number,
            });
        }
        partition.numbers_by_hash.insert(block.hash.clone(), block.number);
        partition.blocks.insert(block.number, block.clone());

        partition.push_outbox(outbox);

        Ok(true)
    }

    async fn delete_blocks_from(
        &self,
        reorged_block: &UnsavedReorgedBlock,
        retractions: &[StreamEvent],
    ) -> Result<(), RepoError> {
        let partition = self.partition(&reorged_block.chain_id).await;
        let mut partition = partition.lock().await;

        let removed = partition.blocks.split_off(&reorged_block.fork_point);
        for block in removed.values() {
            partition.numbers_by_hash.remove(&block.hash);
            for transaction in block.transactions.iter() {
                partition.transaction_refs.remove(&transaction.hash);
            }
        }

        let id = partition.next_id();
        partition.reorged_blocks.push(ReorgedBlock {
            id,
            chain_id: reorged_block.chain_id.clone(),
            fork_point: reorged_block.fork_point,
            depth: reorged_block.depth(),
            inserted_at: Utc::now().timestamp(),
        });
        partition.push_outbox(retractions);

        Ok(())
    }

    async fn get_reorged_blocks(&self, chain_id: &ChainId) -> Result<Vec<ReorgedBlock>, RepoError> {
        let partition = self.partition(chain_id).await;
        let partition = partition.lock().await;

        Ok(partition.reorged_blocks.clone())
    }

    async fn load_sync_status(&self, chain_id: &ChainId) -> Result<Option<SyncStatus>, RepoError> {
        let partition = self.partition(chain_id).await;
        let partition = partition.lock().await;

        Ok(partition.sync_status.clone())
    }

    async fn load_sync_statuses(&self) -> Result<Vec<SyncStatus>, RepoError> {
        let partitions: Vec<_> = self.partitions.read().await.values().cloned().collect();

        let mut sync_statuses = vec![];
        for partition in partitions {
            if let Some(sync_status) = partition.lock().await.sync_status.clone() {
                sync_statuses.push(sync_status);
            }
        }
        sync_statuses.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));

        Ok(sync_statuses)
    }

    async fn save_sync_status(
        &self,
        sync_status: &SyncStatus,
        write: SyncStatusWrite,
    ) -> Result<(), RepoError> {
        let partition = self.partition(&sync_status.chain_id).await;
        let mut partition = partition.lock().await;

        verify_sync_status_write(partition.sync_status.as_ref(), sync_status, write)?;
        partition.sync_status = Some(sync_status.clone());

        Ok(())
    }

    async fn load_unpublished(
        &self,
        chain_id: &ChainId,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, RepoError> {
        let partition = self.partition(chain_id).await;
        let partition = partition.lock().await;

        Ok(partition.outbox.iter().take(limit as usize).cloned().collect())
    }

    async fn mark_published(&self, chain_id: &ChainId, ids: &[i64]) -> Result<(), RepoError> {
        let partition = self.partition(chain_id).await;
        let mut partition = partition.lock().await;

        partition.outbox.retain(|entry| !ids.contains(&entry.id));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{Transaction, TransactionStatus};

    fn block(number: u64, hash: &str, parent_hash: &str) -> Block {
        Block {
            chain_id: ChainId::new("ethereum"),
            number,
            hash: hash.to_string(),
            parent_hash: parent_hash.to_string(),
            timestamp: 1_700_000_000,
            gas_used: None,
            gas_limit: None,
            producer: None,
            transactions: vec![Transaction {
                hash: format!("{hash}-tx"),
                block_hash: Some(hash.to_string()),
                block_number: Some(number),
                index: 0,
                sender: None,
                receiver: None,
                value: "0".to_string(),
                fee: None,
                payload: "0x".to_string(),
                status: TransactionStatus::Confirmed,
                events: vec![],
                balance_deltas: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn skips_blocks_already_persisted() {
        let repo = MemoryRepo::new();
        let block = block(1, "0x01", "0x00");
        let outbox = StreamEvent::for_committed_block(&block).unwrap();

        assert!(repo.create_block(&block, &outbox).await.unwrap());
        assert!(!repo.create_block(&block, &outbox).await.unwrap());

        let chain_id = ChainId::new("ethereum");
        assert_eq!(repo.get_blocks(&chain_id, 0, None).await.unwrap().len(), 1);
        assert_eq!(repo.load_unpublished(&chain_id, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_a_second_block_at_the_same_height() {
        let repo = MemoryRepo::new();

        repo.create_block(&block(1, "0x01", "0x00"), &[]).await.unwrap();

        assert!(repo.create_block(&block(1, "0x01b", "0x00"), &[]).await.is_err());
    }

    #[tokio::test]
    async fn deletes_every_block_from_the_fork_point() {
        let repo = MemoryRepo::new();
        let chain_id = ChainId::new("ethereum");
        for (number, hash, parent_hash) in [(1, "0x01", "0x00"), (2, "0x02", "0x01"), (3, "0x03", "0x02")] {
            repo.create_block(&block(number, hash, parent_hash), &[]).await.unwrap();
        }

        repo.delete_blocks_from(&UnsavedReorgedBlock::new(&chain_id, 2, 3), &[])
            .await
            .unwrap();

        let blocks = repo.get_blocks(&chain_id, 0, None).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(repo.get_block_ref_by_hash(&chain_id, "0x02").await.unwrap().is_none());
        assert!(repo
            .get_transaction_refs(&chain_id, &["0x03-tx".to_string()])
            .await
            .unwrap()
            .is_empty());

        let reorged_blocks = repo.get_reorged_blocks(&chain_id).await.unwrap();
        assert_eq!(reorged_blocks.len(), 1);
        assert_eq!(reorged_blocks[0].depth, 2);
    }

    #[tokio::test]
    async fn drains_published_outbox_entries() {
        let repo = MemoryRepo::new();
        let chain_id = ChainId::new("ethereum");
        let block = block(1, "0x01", "0x00");
        repo.create_block(&block, &StreamEvent::for_committed_block(&block).unwrap())
            .await
            .unwrap();

        let entries = repo.load_unpublished(&chain_id, 1).await.unwrap();
        assert_eq!(entries.len(), 1);
        repo.mark_published(&chain_id, &[entries[0].id]).await.unwrap();

        let remaining = repo.load_unpublished(&chain_id, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].id > entries[0].id);
    }

    #[tokio::test]
    async fn numbers_outbox_entries_per_chain() {
        let repo = MemoryRepo::new();
        let ethereum = block(1, "0x01", "0x00");
        let mut bitcoin = block(1, "0x01", "0x00");
        bitcoin.chain_id = ChainId::new("bitcoin");

        for block in [&ethereum, &bitcoin] {
            repo.create_block(block, &StreamEvent::for_committed_block(block).unwrap())
                .await
                .unwrap();
        }

        for chain_id in [&ethereum.chain_id, &bitcoin.chain_id] {
            let ids: Vec<_> = repo
                .load_unpublished(chain_id, 10)
                .await
                .unwrap()
                .into_iter()
                .map(|entry| entry.id)
                .collect();
            assert_eq!(ids, vec![1, 2]);
        }

        repo.mark_published(&ethereum.chain_id, &[1, 2]).await.unwrap();
        assert!(repo.load_unpublished(&ethereum.chain_id, 10).await.unwrap().is_empty());
        assert_eq!(repo.load_unpublished(&bitcoin.chain_id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn guards_sync_status_advances() {
        let repo = MemoryRepo::new();
        let chain_id = ChainId::new("ethereum");
        let mut sync_status = SyncStatus::new(&chain_id, 0);
        sync_status.last_confirmed_block = Some(10);
        repo.save_sync_status(&sync_status, SyncStatusWrite::Advance).await.unwrap();

        sync_status.last_confirmed_block = Some(9);
        let advance = repo.save_sync_status(&sync_status, SyncStatusWrite::Advance).await;
        assert!(matches!(advance, Err(RepoError::NonMonotonic { .. })));

        repo.save_sync_status(&sync_status, SyncStatusWrite::Rewind).await.unwrap();
        let loaded = repo.load_sync_status(&chain_id).await.unwrap().unwrap();
        assert_eq!(loaded.last_confirmed_block, Some(9));
    }
}
