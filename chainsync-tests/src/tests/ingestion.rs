#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chainsync::{
        ChainAdapter, IngestOutcome, IngestionPipeline, MemoryRepo, Repo, StreamEventKind, Topic,
    };

    use crate::factory::{block_hash, chain, MockAdapter, RecordingStream};
    use crate::test_runner::{config, init_tracing};

    fn pipeline(repo: &MemoryRepo, stream: &RecordingStream) -> IngestionPipeline<MemoryRepo> {
        IngestionPipeline::new(&config(repo.clone(), Arc::new(stream.clone())))
    }

    fn hashes(from: u64, to: u64, branch: &str) -> Vec<String> {
        (from..=to).map(|number| block_hash(number, branch)).collect()
    }

    #[tokio::test]
    pub async fn persists_out_of_order_fetches_in_ascending_order() {
        init_tracing();

        let chain = chain("ethereum").with_start_block(100);
        let adapter = MockAdapter::new(&chain, 90, 110).with_max_concurrent_fetches(11);
        for height in 100..=110 {
            adapter.delay_fetch(height, Duration::from_millis((111 - height) * 10));
        }

        let repo = MemoryRepo::new();
        let stream = RecordingStream::new();
        let pipeline = pipeline(&repo, &stream);

        let blocks = adapter.fetch_block_range(100, 110).await.unwrap();
        let fetched = adapter.fetched();
        let mut fetched_in_order = fetched.clone();
        fetched_in_order.sort();
        assert_ne!(fetched, fetched_in_order);

        let outcome = pipeline.ingest(&adapter, &chain, &blocks).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Committed {
                highest_committed: Some(110)
            }
        );
        pipeline.publish_pending(&chain.id).await.unwrap();

        let persisted: Vec<_> = repo
            .get_blocks(&chain.id, 100, None)
            .await
            .unwrap()
            .into_iter()
            .map(|block| block.number)
            .collect();
        assert_eq!(persisted, (100..=110).collect::<Vec<_>>());
        assert_eq!(
            stream.keys(&chain.id, Topic::Blocks, StreamEventKind::Committed),
            hashes(100, 110, "")
        );
    }

    #[tokio::test]
    pub async fn reingesting_a_batch_changes_nothing() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 1_000, 1_010);
        let repo = MemoryRepo::new();
        let stream = RecordingStream::new();
        let pipeline = pipeline(&repo, &stream);

        let blocks = adapter.fetch_block_range(1_000, 1_010).await.unwrap();
        for _ in 0..2 {
            let outcome = pipeline.ingest(&adapter, &chain, &blocks).await.unwrap();
            assert_eq!(
                outcome,
                IngestOutcome::Committed {
                    highest_committed: Some(1_010)
                }
            );
            pipeline.publish_pending(&chain.id).await.unwrap();
        }

        assert_eq!(repo.get_blocks(&chain.id, 0, None).await.unwrap().len(), 11);
        assert_eq!(
            stream.keys(&chain.id, Topic::Blocks, StreamEventKind::Committed),
            hashes(1_000, 1_010, "")
        );
        assert_eq!(stream.events(&chain.id, Topic::Events).len(), 11);
    }

    #[tokio::test]
    pub async fn rolls_back_reorged_blocks_and_retracts_their_events() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 1_000, 1_010);
        let repo = MemoryRepo::new();
        let stream = RecordingStream::new();
        let pipeline = pipeline(&repo, &stream);

        let blocks = adapter.fetch_block_range(1_000, 1_010).await.unwrap();
        pipeline.ingest(&adapter, &chain, &blocks).await.unwrap();

        adapter.fork_from(1_006, "b", 1_011);
        let new_tip = adapter.canonical_block(1_011).unwrap();

        let outcome = pipeline.ingest(&adapter, &chain, &[new_tip]).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Reorged { fork_point: 1_006 });
        pipeline.publish_pending(&chain.id).await.unwrap();

        let mut retracted = hashes(1_006, 1_010, "");
        retracted.reverse();
        assert_eq!(
            stream.keys(&chain.id, Topic::Blocks, StreamEventKind::Retracted),
            retracted
        );

        let reorged_blocks = repo.get_reorged_blocks(&chain.id).await.unwrap();
        assert_eq!(reorged_blocks.len(), 1);
        assert_eq!(reorged_blocks[0].fork_point, 1_006);
        assert_eq!(reorged_blocks[0].depth, 6);

        let blocks = adapter.fetch_block_range(1_006, 1_011).await.unwrap();
        let outcome = pipeline.ingest(&adapter, &chain, &blocks).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Committed {
                highest_committed: Some(1_011)
            }
        );

        let persisted: Vec<_> = repo
            .get_blocks(&chain.id, 1_000, None)
            .await
            .unwrap()
            .into_iter()
            .map(|block| block.hash)
            .collect();
        assert_eq!(
            persisted,
            [hashes(1_000, 1_005, ""), hashes(1_006, 1_011, "b")].concat()
        );
    }

    #[tokio::test]
    pub async fn keeps_chains_apart() {
        init_tracing();

        let ethereum = chain("ethereum");
        let polygon = chain("polygon");
        let ethereum_adapter = MockAdapter::new(&ethereum, 1_000, 1_005);
        let polygon_adapter = MockAdapter::new(&polygon, 1_000, 1_002);

        let repo = MemoryRepo::new();
        let stream = RecordingStream::new();
        let pipeline = pipeline(&repo, &stream);

        let blocks = ethereum_adapter.fetch_block_range(1_000, 1_005).await.unwrap();
        pipeline.ingest(&ethereum_adapter, &ethereum, &blocks).await.unwrap();
        let blocks = polygon_adapter.fetch_block_range(1_000, 1_002).await.unwrap();
        pipeline.ingest(&polygon_adapter, &polygon, &blocks).await.unwrap();

        assert_eq!(repo.get_blocks(&ethereum.id, 0, None).await.unwrap().len(), 6);
        assert_eq!(repo.get_blocks(&polygon.id, 0, None).await.unwrap().len(), 3);

        let ethereum_blocks = ethereum_adapter.fetch_block_range(1_000, 1_001).await.unwrap();
        assert!(pipeline.ingest(&polygon_adapter, &polygon, &ethereum_blocks).await.is_err());
    }
}
