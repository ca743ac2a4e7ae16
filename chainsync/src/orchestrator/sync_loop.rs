use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::adapters::{with_rpc_timeout, AdapterError, BlockStream, ChainAdapter};
use crate::blocks::Block;
use crate::config::{Config, RetryPolicy};
use crate::errors::SyncError;
use crate::ingester::{IngestOutcome, IngestionPipeline};
use crate::metrics::Metrics;
use crate::repos::Repo;
use crate::sync_states::{SyncMode, SyncStateError, SyncStates, SyncStatus};
use crate::Chain;

use super::health::{HealthMonitor, HealthTransition};

/// New blocks forwarded from a [BlockStream] through a bounded channel.
struct Feed {
    blocks: mpsc::Receiver<Result<Block, AdapterError>>,
    task: JoinHandle<()>,
}

impl Feed {
    fn spawn(mut block_stream: BlockStream, capacity: usize) -> Self {
        let (sender, blocks) = mpsc::channel(capacity.max(1));

        let task = tokio::spawn(async move {
            while let Some(block) = block_stream.next().await {
                if sender.send(block).await.is_err() {
                    break;
                }
            }
        });

        Self { blocks, task }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Batch whose persistence retries ran out. Re-driven before anything new is fetched.
struct ParkedBatch {
    blocks: Vec<Block>,
    latest_height: u64,
}

/// Drives one chain from its resume height to the tip and then follows new blocks.
pub struct SyncLoop<R: Repo> {
    chain: Chain,
    adapter: Arc<dyn ChainAdapter>,
    pipeline: IngestionPipeline<R>,
    sync_states: SyncStates<R>,
    health: HealthMonitor,
    adapter_retry_policy: RetryPolicy,
    rpc_timeout: Duration,
    feed_capacity: usize,
    feed: Option<Feed>,
    parked_batch: Option<ParkedBatch>,
    /// Set after a failed publication. Cleared once the outbox drains.
    outbox_pending: bool,
    stopped: watch::Receiver<bool>,
}

impl<R: Repo> SyncLoop<R> {
    pub fn new(
        chain: Chain,
        adapter: Arc<dyn ChainAdapter>,
        config: &Config<R>,
        pipeline: IngestionPipeline<R>,
        sync_states: SyncStates<R>,
        stopped: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chain,
            adapter,
            pipeline,
            sync_states,
            health: HealthMonitor::new(config.health, false),
            adapter_retry_policy: config.adapter_retry_policy,
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
            feed_capacity: config.feed_capacity,
            feed: None,
            parked_batch: None,
            outbox_pending: false,
            stopped,
        }
    }

    /// Runs until stopped. Stops are only observed between steps, so an
    /// in-flight batch always commits first.
    pub async fn run(mut self) {
        let chain_id = self.chain.id.clone();
        info!(%chain_id, "sync loop started");

        while !self.is_stopped() {
            match self.resume().await {
                Ok(()) => break,
                Err(error) => {
                    warn!(%chain_id, %error, "could not resume sync");
                    self.pause(self.backoff()).await;
                }
            }
        }

        while !self.is_stopped() {
            let result = self.step().await;
            self.handle_step_result(result).await;
        }

        info!(%chain_id, "sync loop stopped");
    }

    async fn resume(&mut self) -> Result<(), SyncError> {
        let sync_status = self.sync_states.transition(&self.chain.id, SyncMode::Backfilling).await?;
        self.health = HealthMonitor::new(self.health.config(), sync_status.is_degraded());

        info!(
            chain_id = %self.chain.id,
            next_block = sync_status.next_block(),
            degraded = sync_status.is_degraded(),
            "resuming sync"
        );

        // Entries left behind by an earlier run
        self.pipeline.publish_pending(&self.chain.id).await?;

        Ok(())
    }

    async fn step(&mut self) -> Result<(), SyncError> {
        if self.outbox_pending {
            self.pipeline.publish_pending(&self.chain.id).await?;
            self.outbox_pending = false;
        }

        if let Some(ParkedBatch {
            blocks,
            latest_height,
        }) = self.parked_batch.take()
        {
            debug!(chain_id = %self.chain.id, blocks = blocks.len(), "re-driving parked batch");
            return self.ingest(blocks, latest_height).await;
        }

        let sync_status = self.sync_status().await?;

        match active_mode(&sync_status) {
            SyncMode::RealTime => self.follow_new_blocks(&sync_status).await,
            _ => self.backfill().await,
        }
    }

    async fn backfill(&mut self) -> Result<(), SyncError> {
        let chain_id = &self.chain.id;

        let latest_height = Metrics::observe_rpc(
            chain_id,
            "latest_height",
            with_rpc_timeout(self.rpc_timeout, self.adapter.latest_height()),
        )
        .await?;
        let sync_status = self.sync_states.observe_highest(chain_id, latest_height).await?;

        if sync_status.is_caught_up(latest_height, self.chain.safety_margin) {
            info!(%chain_id, latest_height, "caught up, following new blocks");
            self.sync_states.transition(chain_id, SyncMode::RealTime).await?;

            return Ok(());
        }

        let from = sync_status.next_block();
        let to = from.saturating_add(self.chain.blocks_per_batch - 1).min(latest_height);
        debug!(%chain_id, from, to, latest_height, "backfilling");

        let fetch_rounds = (to - from + 1).div_ceil(self.adapter.max_concurrent_fetches().max(1) as u64);
        let fetch_timeout = self.rpc_timeout.saturating_mul(fetch_rounds as u32);
        let blocks = Metrics::observe_rpc(
            chain_id,
            "fetch_block_range",
            with_rpc_timeout(fetch_timeout, self.adapter.fetch_block_range(from, to)),
        )
        .await?;

        self.ingest(blocks, latest_height).await?;

        if self.health.is_degraded() {
            self.pause(self.cadence()).await;
        }

        Ok(())
    }

    async fn follow_new_blocks(&mut self, sync_status: &SyncStatus) -> Result<(), SyncError> {
        let next_block = sync_status.next_block();

        if self.feed.is_none() {
            let mut block_stream = self.adapter.subscribe_new_blocks(next_block);
            if self.health.is_degraded() {
                block_stream = block_stream.slowed_down();
            }

            debug!(chain_id = %self.chain.id, next_block, "following new blocks");
            self.feed = Some(Feed::spawn(block_stream, self.feed_capacity));
        }

        let Some(feed) = self.feed.as_mut() else {
            return Ok(());
        };

        let block = tokio::select! {
            block = feed.blocks.recv() => block,
            _ = self.stopped.changed() => return Ok(()),
        };

        match block {
            None => Err(SyncError::TransientRpc("new blocks feed ended".to_string())),
            Some(Err(error)) => Err(error.into()),
            Some(Ok(block)) if block.number != next_block => {
                debug!(
                    chain_id = %self.chain.id,
                    height = block.number,
                    next_block,
                    "new blocks feed is out of step, restarting it"
                );
                self.feed = None;

                Ok(())
            }
            Some(Ok(block)) => {
                let height = block.number;

                self.ingest(vec![block], height).await
            }
        }
    }

    async fn ingest(&mut self, blocks: Vec<Block>, latest_height: u64) -> Result<(), SyncError> {
        let pipeline = if self.health.is_degraded() {
            self.pipeline.slowed_down()
        } else {
            self.pipeline.clone()
        };

        let result = self.commit(&pipeline, &blocks, latest_height).await;

        if let Err(error) = &result {
            if error.is_persistence() {
                warn!(chain_id = %self.chain.id, blocks = blocks.len(), "parking batch");
                self.parked_batch = Some(ParkedBatch {
                    blocks,
                    latest_height,
                });
            }
        }

        result?;

        pipeline.publish_pending(&self.chain.id).await?;

        Ok(())
    }

    async fn commit(
        &mut self,
        pipeline: &IngestionPipeline<R>,
        blocks: &[Block],
        latest_height: u64,
    ) -> Result<(), SyncError> {
        let chain_id = &self.chain.id;

        match pipeline.ingest(self.adapter.as_ref(), &self.chain, blocks).await? {
            IngestOutcome::Committed {
                highest_committed: Some(highest_committed),
            } => {
                let sync_status = self.sync_status().await?;

                if sync_status.last_confirmed_block.map_or(true, |c| highest_committed > c) {
                    self.sync_states.advance(chain_id, highest_committed, latest_height).await?;
                }
            }
            IngestOutcome::Committed {
                highest_committed: None,
            } => {}
            IngestOutcome::Reorged { fork_point } => {
                let sync_status = self.sync_status().await?;

                if sync_status.last_confirmed_block.is_some_and(|c| fork_point <= c) {
                    self.sync_states.rewind(chain_id, fork_point).await?;
                }
                self.feed = None;
            }
        }

        Ok(())
    }

    async fn handle_step_result(&mut self, result: Result<(), SyncError>) {
        let chain_id = self.chain.id.clone();

        match result {
            Ok(()) => {
                if self.health.record_success() == Some(HealthTransition::Recover) {
                    info!(%chain_id, "chain recovered");
                    // Restarts the feed at the normal cadence
                    self.feed = None;

                    if let Err(error) = self.sync_states.recover(&chain_id).await {
                        error!(%chain_id, %error, "could not record recovery");
                    }
                } else if self.has_stale_error().await {
                    if let Err(error) = self.sync_states.clear_error(&chain_id).await {
                        error!(%chain_id, %error, "could not clear last error");
                    }
                }
            }
            Err(error) => {
                Metrics::record_processing_error(&chain_id, error.kind());
                self.feed = None;
                if matches!(error, SyncError::StreamPublish(_)) {
                    self.outbox_pending = true;
                }

                let degrade = if error.is_persistence() {
                    self.health.force_degrade()
                } else {
                    self.health.record_failure(Instant::now()) == Some(HealthTransition::Degrade)
                };

                let reason = error.to_string();
                let recorded = if degrade {
                    warn!(%chain_id, %error, "chain degraded");
                    self.sync_states.degrade(&chain_id, &reason).await
                } else {
                    warn!(
                        %chain_id,
                        %error,
                        consecutive_failures = self.health.consecutive_failures(),
                        "sync step failed"
                    );
                    self.sync_states.record_error(&chain_id, &reason).await
                };

                if let Err(error) = recorded {
                    error!(%chain_id, %error, "could not record sync failure");
                }

                self.pause(self.backoff()).await;
            }
        }
    }

    /// Error left by a failed step of a chain that is not degraded.
    async fn has_stale_error(&self) -> bool {
        self.sync_states
            .get(&self.chain.id)
            .await
            .is_some_and(|s| s.last_error.is_some() && !s.is_degraded())
    }

    async fn sync_status(&self) -> Result<SyncStatus, SyncError> {
        self.sync_states
            .get(&self.chain.id)
            .await
            .ok_or_else(|| SyncStateError::Untracked(self.chain.id.clone()).into())
    }

    fn backoff(&self) -> Duration {
        let retry_policy = if self.health.is_degraded() {
            self.adapter_retry_policy.slowed_down()
        } else {
            self.adapter_retry_policy
        };

        let attempt = self.health.consecutive_failures().saturating_sub(1);

        retry_policy.delay(attempt.min(retry_policy.max_retries))
    }

    fn cadence(&self) -> Duration {
        Duration::from_millis(self.chain.block_cadence_ms)
    }

    /// Sleeps unless stopped first.
    async fn pause(&mut self, duration: Duration) {
        if self.is_stopped() {
            return;
        }

        tokio::select! {
            _ = sleep(duration) => {},
            _ = self.stopped.changed() => {},
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.borrow() || self.stopped.has_changed().is_err()
    }
}

/// Mode the loop runs in. A degraded chain keeps doing what it was doing, only slower.
fn active_mode(sync_status: &SyncStatus) -> SyncMode {
    match sync_status.mode {
        SyncMode::Degraded => sync_status.degraded_from.unwrap_or(SyncMode::Backfilling),
        SyncMode::Idle => SyncMode::Backfilling,
        mode => mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChainId;

    fn sync_status(mode: SyncMode, degraded_from: Option<SyncMode>) -> SyncStatus {
        let mut sync_status = SyncStatus::new(&ChainId::new("ethereum"), 0);
        sync_status.mode = mode;
        sync_status.degraded_from = degraded_from;

        sync_status
    }

    #[test]
    fn degraded_chains_keep_their_prior_mode() {
        assert_eq!(
            active_mode(&sync_status(SyncMode::Degraded, Some(SyncMode::RealTime))),
            SyncMode::RealTime
        );
        assert_eq!(active_mode(&sync_status(SyncMode::Degraded, None)), SyncMode::Backfilling);
        assert_eq!(active_mode(&sync_status(SyncMode::Idle, None)), SyncMode::Backfilling);
    }
}
