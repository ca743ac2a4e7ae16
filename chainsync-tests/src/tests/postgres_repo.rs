#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chainsync::{
        ChainId, ChainsyncRepo, PostgresStream, Repo, RepoError, StreamEvent, StreamEventKind,
        SyncMode, SyncStatus, SyncStatusWrite, Topic, UnsavedReorgedBlock,
    };

    use crate::factory::{block, block_hash, chain, unique_chain_id, MockAdapter};
    use crate::test_runner::{self, config, orchestrator, SYNC_TIMEOUT};
    use crate::wait_for;

    async fn create_blocks(repo: &ChainsyncRepo, chain_id: &ChainId, from: u64, to: u64) {
        for number in from..=to {
            let block = block(
                chain_id,
                number,
                &block_hash(number, ""),
                &block_hash(number - 1, ""),
            );
            let outbox = StreamEvent::for_committed_block(&block).unwrap();

            assert!(repo.create_block(&block, &outbox).await.unwrap());
        }
    }

    #[tokio::test]
    pub async fn persists_each_block_once() {
        test_runner::run_test(|repo| async move {
            let chain_id = ChainId::new(&unique_chain_id("ethereum"));
            let block = block(&chain_id, 7, &block_hash(7, ""), &block_hash(6, ""));
            let outbox = StreamEvent::for_committed_block(&block).unwrap();

            assert!(repo.create_block(&block, &outbox).await.unwrap());
            assert!(!repo.create_block(&block, &outbox).await.unwrap());

            let block_ref = repo.get_block_ref_by_number(&chain_id, 7).await.unwrap().unwrap();
            assert_eq!(block_ref.hash, block.hash);
            assert_eq!(block_ref.parent_hash, block.parent_hash);
            assert_eq!(
                repo.get_block_ref_by_hash(&chain_id, &block.hash).await.unwrap(),
                Some(block_ref)
            );

            let persisted = repo.get_blocks(&chain_id, 0, None).await.unwrap();
            assert_eq!(persisted.len(), 1);
            assert_eq!(persisted[0].hash, block.hash);
            assert_eq!(persisted[0].transactions.len(), 1);
            assert_eq!(persisted[0].transactions[0].events.len(), 1);

            let transaction_refs = repo
                .get_transaction_refs(&chain_id, &[block.transactions[0].hash.clone()])
                .await
                .unwrap();
            assert_eq!(transaction_refs.len(), 1);
            assert_eq!(transaction_refs[0].block_number, 7);

            let unpublished = repo.load_unpublished(&chain_id, 100).await.unwrap();
            assert_eq!(unpublished.len(), outbox.len());
        })
        .await;
    }

    #[tokio::test]
    pub async fn deletes_every_block_from_the_fork_point() {
        test_runner::run_test(|repo| async move {
            let chain_id = ChainId::new(&unique_chain_id("ethereum"));
            create_blocks(&repo, &chain_id, 1, 5).await;

            let rolled_back = repo.get_blocks(&chain_id, 3, None).await.unwrap();
            let retractions = StreamEvent::for_retracted_blocks(&rolled_back).unwrap();
            repo.delete_blocks_from(&UnsavedReorgedBlock::new(&chain_id, 3, 5), &retractions)
                .await
                .unwrap();

            let remaining: Vec<_> = repo
                .get_blocks(&chain_id, 0, None)
                .await
                .unwrap()
                .into_iter()
                .map(|block| block.number)
                .collect();
            assert_eq!(remaining, vec![1, 2]);
            assert!(repo.get_block_ref_by_hash(&chain_id, &block_hash(4, "")).await.unwrap().is_none());
            assert!(repo
                .get_transaction_refs(&chain_id, &[format!("{}-tx", block_hash(4, ""))])
                .await
                .unwrap()
                .is_empty());

            let reorged_blocks = repo.get_reorged_blocks(&chain_id).await.unwrap();
            assert_eq!(reorged_blocks.len(), 1);
            assert_eq!(reorged_blocks[0].fork_point, 3);
            assert_eq!(reorged_blocks[0].depth, 3);

            let retracted_keys: Vec<_> = repo
                .load_unpublished(&chain_id, 1_000)
                .await
                .unwrap()
                .into_iter()
                .filter(|entry| {
                    entry.event.topic == Topic::Blocks
                        && entry.event.kind == StreamEventKind::Retracted
                })
                .map(|entry| entry.event.key)
                .collect();
            assert_eq!(
                retracted_keys,
                vec![block_hash(5, ""), block_hash(4, ""), block_hash(3, "")]
            );
        })
        .await;
    }

    #[tokio::test]
    pub async fn only_rewinds_sync_statuses_on_request() {
        test_runner::run_test(|repo| async move {
            let chain_id = ChainId::new(&unique_chain_id("bitcoin"));
            let mut sync_status = SyncStatus::new(&chain_id, 800_000);
            sync_status.mode = SyncMode::Backfilling;
            sync_status.last_confirmed_block = Some(800_010);
            sync_status.highest_known_block = 800_020;
            repo.save_sync_status(&sync_status, SyncStatusWrite::Advance).await.unwrap();

            let mut rewound = sync_status.clone();
            rewound.last_confirmed_block = Some(800_005);

            let advanced = repo.save_sync_status(&rewound, SyncStatusWrite::Advance).await;
            assert!(matches!(advanced, Err(RepoError::NonMonotonic { .. })));
            assert_eq!(
                repo.load_sync_status(&chain_id).await.unwrap(),
                Some(sync_status)
            );

            repo.save_sync_status(&rewound, SyncStatusWrite::Rewind).await.unwrap();
            assert_eq!(repo.load_sync_status(&chain_id).await.unwrap(), Some(rewound));
        })
        .await;
    }

    #[tokio::test]
    pub async fn drains_the_outbox_in_persist_order() {
        test_runner::run_test(|repo| async move {
            let chain_id = ChainId::new(&unique_chain_id("ethereum"));
            create_blocks(&repo, &chain_id, 1, 3).await;

            let first_batch = repo.load_unpublished(&chain_id, 2).await.unwrap();
            assert_eq!(first_batch.len(), 2);
            assert_eq!(first_batch[0].event.key, block_hash(1, ""));
            assert!(first_batch[0].id < first_batch[1].id);

            let ids: Vec<_> = first_batch.iter().map(|entry| entry.id).collect();
            repo.mark_published(&chain_id, &ids).await.unwrap();

            let remaining = repo.load_unpublished(&chain_id, 100).await.unwrap();
            assert_eq!(remaining.len(), 9 - 2);
            assert!(remaining.iter().all(|entry| entry.id > ids[1]));
        })
        .await;
    }

    #[tokio::test]
    pub async fn syncs_a_chain_into_postgres() {
        test_runner::run_test(|repo| async move {
            let chain = chain(&unique_chain_id("ethereum"));
            let adapter = MockAdapter::new(&chain, 1_000, 1_020);
            let stream = PostgresStream::new(repo.clone()).await.unwrap();
            let orchestrator = orchestrator(
                config(repo.clone(), Arc::new(stream.clone())),
                &[(chain.clone(), adapter)],
            )
            .await;

            orchestrator.start().await.unwrap();

            let orchestrator = &orchestrator;
            let chain_id = &chain.id;
            let caught_up = wait_for(SYNC_TIMEOUT, || async move {
                orchestrator
                    .sync_status(chain_id)
                    .await
                    .ok()
                    .filter(|s| s.mode == SyncMode::RealTime && s.last_confirmed_block == Some(1_020))
            })
            .await;
            assert!(caught_up.is_some());
            orchestrator.shutdown().await;

            assert_eq!(repo.get_blocks(chain_id, 0, None).await.unwrap().len(), 21);
            assert!(repo.load_unpublished(chain_id, 100).await.unwrap().is_empty());

            let committed: Vec<_> = stream
                .read(Topic::Blocks, 0, 100_000)
                .await
                .unwrap()
                .into_iter()
                .filter(|entry| &entry.chain_id == chain_id)
                .map(|entry| entry.key)
                .collect();
            assert_eq!(
                committed,
                (1_000..=1_020).map(|n| block_hash(n, "")).collect::<Vec<_>>()
            );
        })
        .await;
    }
}
