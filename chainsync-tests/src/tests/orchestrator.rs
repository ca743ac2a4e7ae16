#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chainsync::{
        Chain, ChainId, ChainKind, ChainsyncError, Config, MemoryRepo, Repo, StreamEventKind,
        SyncMode, SyncOrchestrator, SyncStatus, Topic,
    };

    use crate::factory::{block_hash, chain, FlakyRepo, MockAdapter, RecordingStream};
    use crate::test_runner::{config, init_tracing, orchestrator, SYNC_TIMEOUT};
    use crate::wait_for;

    async fn wait_for_status<R: Repo>(
        orchestrator: &SyncOrchestrator<R>,
        chain_id: &ChainId,
        predicate: impl Fn(&SyncStatus) -> bool,
    ) -> SyncStatus {
        let predicate = &predicate;
        let sync_status = wait_for(SYNC_TIMEOUT, || async move {
            orchestrator.sync_status(chain_id).await.ok().filter(|s| predicate(s))
        })
        .await;

        match sync_status {
            Some(sync_status) => sync_status,
            None => panic!(
                "{chain_id} never reached the expected status, last seen: {:?}",
                orchestrator.sync_status(chain_id).await
            ),
        }
    }

    fn is_caught_up_at(height: u64) -> impl Fn(&SyncStatus) -> bool {
        move |s| s.mode == SyncMode::RealTime && s.last_confirmed_block == Some(height)
    }

    #[tokio::test]
    pub async fn backfills_then_follows_new_blocks() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 990, 1_050);
        let stream = RecordingStream::new();
        let orchestrator = orchestrator(
            config(MemoryRepo::new(), Arc::new(stream.clone())),
            &[(chain.clone(), adapter.clone())],
        )
        .await;

        orchestrator.start().await.unwrap();

        let sync_status = wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_050)).await;
        assert_eq!(sync_status.lag(), 0);
        assert_eq!(sync_status.highest_known_block, 1_050);

        adapter.extend_to(1_051);
        wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_051)).await;

        let modes = stream.modes(&chain.id);
        assert!(modes.contains(&SyncMode::Backfilling));
        assert_eq!(modes.last(), Some(&SyncMode::RealTime));

        orchestrator.shutdown().await;
        let sync_status = orchestrator.sync_status(&chain.id).await.unwrap();
        assert_eq!(sync_status.mode, SyncMode::Idle);
        assert_eq!(sync_status.last_confirmed_block, Some(1_051));
    }

    #[tokio::test]
    pub async fn degrades_after_repeated_failures_and_recovers() {
        init_tracing();

        let chain = chain("polygon");
        let adapter = MockAdapter::new(&chain, 1_000, 1_100);
        adapter.fail_next(3);
        let stream = RecordingStream::new();
        let orchestrator = orchestrator(
            config(MemoryRepo::new(), Arc::new(stream.clone())),
            &[(chain.clone(), adapter.clone())],
        )
        .await;

        orchestrator.enable_chain(&chain.id).await.unwrap();

        let sync_status = wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_100)).await;
        assert_eq!(sync_status.last_error, None);
        assert!(stream.modes(&chain.id).contains(&SyncMode::Degraded));

        let degraded_report = stream
            .events(&chain.id, Topic::SyncStatus)
            .into_iter()
            .find(|event| event.payload["mode"] == "degraded")
            .unwrap();
        assert!(degraded_report.payload["last_error"]
            .as_str()
            .unwrap()
            .contains("connection reset by peer"));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    pub async fn clears_the_last_error_after_a_single_failure() {
        init_tracing();

        let chain = chain("gnosis");
        let adapter = MockAdapter::new(&chain, 1_000, 1_020);
        adapter.fail_next(1);
        let stream = RecordingStream::new();
        let orchestrator = orchestrator(
            config(MemoryRepo::new(), Arc::new(stream.clone())),
            &[(chain.clone(), adapter.clone())],
        )
        .await;

        orchestrator.enable_chain(&chain.id).await.unwrap();

        let sync_status = wait_for_status(&orchestrator, &chain.id, |s| {
            is_caught_up_at(1_020)(s) && s.last_error.is_none()
        })
        .await;
        assert!(!sync_status.is_degraded());
        assert!(!stream.modes(&chain.id).contains(&SyncMode::Degraded));

        let failure_reported = stream
            .events(&chain.id, Topic::SyncStatus)
            .into_iter()
            .any(|event| event.payload["last_error"].is_string());
        assert!(failure_reported);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    pub async fn isolates_a_failing_chain() {
        init_tracing();

        let broken = chain("broken");
        let broken_adapter = MockAdapter::new(&broken, 1_000, 1_050);
        broken_adapter.fail_next(u32::MAX);
        let healthy = chain("healthy");
        let healthy_adapter = MockAdapter::new(&healthy, 1_000, 1_050);

        let repo = MemoryRepo::new();
        let orchestrator = orchestrator(
            config(repo.clone(), Arc::new(RecordingStream::new())),
            &[(broken.clone(), broken_adapter), (healthy.clone(), healthy_adapter)],
        )
        .await;

        orchestrator.start().await.unwrap();

        wait_for_status(&orchestrator, &healthy.id, is_caught_up_at(1_050)).await;
        let broken_status =
            wait_for_status(&orchestrator, &broken.id, |s| s.mode == SyncMode::Degraded).await;
        assert_eq!(broken_status.last_confirmed_block, None);
        assert!(broken_status.last_error.is_some());

        assert_eq!(repo.get_blocks(&healthy.id, 0, None).await.unwrap().len(), 51);
        assert!(repo.get_blocks(&broken.id, 0, None).await.unwrap().is_empty());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    pub async fn follows_a_reorg_while_in_real_time() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 1_000, 1_050);
        let repo = MemoryRepo::new();
        let stream = RecordingStream::new();
        let orchestrator = orchestrator(
            config(repo.clone(), Arc::new(stream.clone())),
            &[(chain.clone(), adapter.clone())],
        )
        .await;

        orchestrator.enable_chain(&chain.id).await.unwrap();
        wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_050)).await;

        adapter.fork_from(1_045, "b", 1_052);
        wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_052)).await;

        let persisted = repo.get_block_ref_by_number(&chain.id, 1_045).await.unwrap().unwrap();
        assert_eq!(persisted.hash, block_hash(1_045, "b"));

        let retracted: Vec<_> = (1_045..=1_050).rev().map(|n| block_hash(n, "")).collect();
        assert_eq!(
            stream.keys(&chain.id, Topic::Blocks, StreamEventKind::Retracted),
            retracted
        );

        let confirmed_heights = stream.confirmed_heights(&chain.id);
        let rewinds: Vec<_> = confirmed_heights
            .windows(2)
            .filter(|heights| heights[1] < heights[0])
            .map(|heights| heights[1])
            .collect();
        assert_eq!(rewinds, vec![Some(1_044)]);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    pub async fn runs_one_loop_however_often_a_chain_is_enabled() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 1_000, 1_050);
        let orchestrator = orchestrator(
            config(MemoryRepo::new(), Arc::new(RecordingStream::new())),
            &[(chain.clone(), adapter.clone())],
        )
        .await;

        let (first, second, third) = tokio::join!(
            orchestrator.enable_chain(&chain.id),
            orchestrator.enable_chain(&chain.id),
            orchestrator.enable_chain(&chain.id)
        );
        assert!(first.is_ok() && second.is_ok() && third.is_ok());

        wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_050)).await;
        orchestrator.enable_chain(&chain.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(adapter.subscriptions(), 1);
        assert_eq!(orchestrator.sync_statuses().await.unwrap().len(), 1);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    pub async fn stops_syncing_disabled_chains() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 1_000, 1_050);
        let orchestrator = orchestrator(
            config(MemoryRepo::new(), Arc::new(RecordingStream::new())),
            &[(chain.clone(), adapter.clone())],
        )
        .await;

        orchestrator.start().await.unwrap();
        wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_050)).await;

        orchestrator.disable_chain(&chain.id).await.unwrap();
        assert!(!orchestrator.registry().is_enabled(&chain.id).await);
        assert_eq!(
            orchestrator.sync_status(&chain.id).await.unwrap().mode,
            SyncMode::Idle
        );

        adapter.extend_to(1_055);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sync_status = orchestrator.sync_status(&chain.id).await.unwrap();
        assert_eq!(sync_status.mode, SyncMode::Idle);
        assert_eq!(sync_status.last_confirmed_block, Some(1_050));

        orchestrator.enable_chain(&chain.id).await.unwrap();
        wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_055)).await;

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    pub async fn resyncs_reset_chains_from_the_given_block() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 1_000, 1_050);
        let repo = MemoryRepo::new();
        let orchestrator = orchestrator(
            config(repo.clone(), Arc::new(RecordingStream::new())),
            &[(chain.clone(), adapter)],
        )
        .await;

        orchestrator.enable_chain(&chain.id).await.unwrap();
        wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_050)).await;

        let sync_status = orchestrator.reset_chain(&chain.id, 1_040).await.unwrap();
        assert_eq!(sync_status.start_block, 1_040);
        assert_eq!(sync_status.last_confirmed_block, None);

        wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_050)).await;
        assert_eq!(repo.get_blocks(&chain.id, 0, None).await.unwrap().len(), 51);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    pub async fn reports_unreachable_adapters_as_fatal() {
        init_tracing();

        let chain = Chain::new("zksync", ChainKind::Evm, "ftp://node.example.com");
        let config = Config::new(MemoryRepo::new())
            .with_stream(Arc::new(RecordingStream::new()))
            .add_chain(chain.clone());
        let orchestrator = SyncOrchestrator::new(config).await.unwrap();

        let enabled = orchestrator.enable_chain(&chain.id).await;
        assert!(matches!(enabled, Err(ChainsyncError::FatalConfig { .. })));
        assert!(!orchestrator.registry().is_enabled(&chain.id).await);
        assert!(matches!(
            orchestrator.sync_status(&chain.id).await,
            Err(ChainsyncError::UnknownChain(_))
        ));

        let unknown = ChainId::new("solana");
        assert!(matches!(
            orchestrator.enable_chain(&unknown).await,
            Err(ChainsyncError::UnknownChain(_))
        ));
    }

    #[tokio::test]
    pub async fn retries_batches_parked_by_persistence_failures() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 1_000, 1_030);
        let repo = FlakyRepo::new();
        repo.fail_writes(2);
        let stream = RecordingStream::new();
        let orchestrator = orchestrator(
            config(repo.clone(), Arc::new(stream.clone())),
            &[(chain.clone(), adapter)],
        )
        .await;

        orchestrator.enable_chain(&chain.id).await.unwrap();

        let sync_status = wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_030)).await;
        assert_eq!(sync_status.last_error, None);
        assert!(stream.modes(&chain.id).contains(&SyncMode::Degraded));

        let persisted: Vec<_> = repo
            .inner()
            .get_blocks(&chain.id, 0, None)
            .await
            .unwrap()
            .into_iter()
            .map(|block| block.number)
            .collect();
        assert_eq!(persisted, (1_000..=1_030).collect::<Vec<_>>());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    pub async fn delivers_every_event_once_the_stream_is_back() {
        init_tracing();

        let chain = chain("ethereum");
        let adapter = MockAdapter::new(&chain, 1_000, 1_030);
        let stream = RecordingStream::new();
        stream.set_unavailable(true);
        let orchestrator = orchestrator(
            config(MemoryRepo::new(), Arc::new(stream.clone())),
            &[(chain.clone(), adapter)],
        )
        .await;

        orchestrator.enable_chain(&chain.id).await.unwrap();
        wait_for_status(&orchestrator, &chain.id, |s| s.mode == SyncMode::Degraded).await;

        stream.set_unavailable(false);
        let sync_status = wait_for_status(&orchestrator, &chain.id, is_caught_up_at(1_030)).await;
        assert_eq!(sync_status.last_error, None);

        let committed: Vec<_> = (1_000..=1_030).map(|n| block_hash(n, "")).collect();
        assert_eq!(
            stream.keys(&chain.id, Topic::Blocks, StreamEventKind::Committed),
            committed
        );

        orchestrator.shutdown().await;
    }
}
