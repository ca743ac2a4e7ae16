//! Turns ascending blocks of one chain into persisted rows and, through the
//! outbox, ordered stream events.
mod maybe_handle_chain_reorg;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::adapters::ChainAdapter;
use crate::blocks::Block;
use crate::config::{Config, RetryPolicy};
use crate::errors::SyncError;
use crate::event_stream::{EventStream, StreamEvent};
use crate::metrics::Metrics;
use crate::repos::Repo;
use crate::retries::with_retries;
use crate::{Chain, ChainId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Every block was persisted, or already was. `None` for an empty batch.
    Committed { highest_committed: Option<u64> },
    /// A reorg was rolled back. Blocks from the fork point on must be fetched again.
    Reorged { fork_point: u64 },
}

pub struct IngestionPipeline<R: Repo> {
    repo: R,
    stream: Arc<dyn EventStream>,
    persistence_retry_policy: RetryPolicy,
    publish_retry_policy: RetryPolicy,
    outbox_batch_size: u32,
    rpc_timeout: Duration,
}

impl<R: Repo> Clone for IngestionPipeline<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            stream: self.stream.clone(),
            persistence_retry_policy: self.persistence_retry_policy,
            publish_retry_policy: self.publish_retry_policy,
            outbox_batch_size: self.outbox_batch_size,
            rpc_timeout: self.rpc_timeout,
        }
    }
}

impl<R: Repo> IngestionPipeline<R> {
    pub fn new(config: &Config<R>) -> Self {
        Self {
            repo: config.repo.clone(),
            stream: config.stream.clone(),
            persistence_retry_policy: config.persistence_retry_policy,
            publish_retry_policy: config.publish_retry_policy,
            outbox_batch_size: config.outbox_batch_size.max(1),
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
        }
    }

    /// Same pipeline with slower persistence backoff, used while a chain is degraded.
    pub fn slowed_down(&self) -> Self {
        Self {
            persistence_retry_policy: self.persistence_retry_policy.slowed_down(),
            publish_retry_policy: self.publish_retry_policy.slowed_down(),
            ..self.clone()
        }
    }

    /// Persists `blocks`, which must be ascending and belong to `chain`.
    ///
    /// Blocks already persisted count as committed, so re-ingesting a batch after
    /// a crash still reports its height. Stops at the first reorg it rolls back.
    pub async fn ingest(
        &self,
        adapter: &dyn ChainAdapter,
        chain: &Chain,
        blocks: &[Block],
    ) -> Result<IngestOutcome, SyncError> {
        let mut highest_committed = None;

        for block in blocks {
            if block.chain_id != chain.id {
                return Err(SyncError::FatalConfig(format!(
                    "block {} of {} handed to the pipeline of {}",
                    block.number, block.chain_id, chain.id
                )));
            }

            if self.is_already_persisted(block).await? {
                debug!(chain_id = %chain.id, height = block.number, "skipping persisted block");
                highest_committed = Some(block.number);
                continue;
            }

            if let Some(fork_point) = maybe_handle_chain_reorg::run(
                &self.repo,
                adapter,
                chain,
                block,
                &self.persistence_retry_policy,
                self.rpc_timeout,
            )
            .await?
            {
                return Ok(IngestOutcome::Reorged { fork_point });
            }

            self.persist(block).await?;
            highest_committed = Some(block.number);
        }

        Ok(IngestOutcome::Committed { highest_committed })
    }

    /// Publishes unpublished outbox entries of a chain in persist order.
    ///
    /// Entries are only marked published once the stream accepted them, so a
    /// failure leaves the rest in the outbox for the next call.
    pub async fn publish_pending(&self, chain_id: &ChainId) -> Result<usize, SyncError> {
        let mut published_count = 0;

        loop {
            let entries = Metrics::observe_db(
                chain_id,
                "load_unpublished",
                self.repo.load_unpublished(chain_id, self.outbox_batch_size),
            )
            .await?;
            if entries.is_empty() {
                break;
            }

            let mut published_ids = Vec::with_capacity(entries.len());
            let mut publish_error = None;

            for entry in entries.iter() {
                let published = with_retries(&self.publish_retry_policy, "publishing stream event", || {
                    self.stream.publish(&entry.event)
                })
                .await;

                match published {
                    Ok(()) => published_ids.push(entry.id),
                    Err(error) => {
                        publish_error = Some(error);
                        break;
                    }
                }
            }

            self.mark_published(chain_id, &published_ids).await?;
            published_count += published_ids.len();

            if let Some(error) = publish_error {
                warn!(%chain_id, %error, published_count, "stream publication failed");
                return Err(error.into());
            }
            if entries.len() < self.outbox_batch_size as usize {
                break;
            }
        }

        if published_count > 0 {
            debug!(%chain_id, published_count, "published outbox entries");
        }

        Ok(published_count)
    }

    async fn is_already_persisted(&self, block: &Block) -> Result<bool, SyncError> {
        let persisted = self.repo.get_block_ref_by_hash(&block.chain_id, &block.hash).await?;

        Ok(persisted.is_some_and(|persisted| persisted.number == block.number))
    }

    async fn persist(&self, block: &Block) -> Result<(), SyncError> {
        let outbox = StreamEvent::for_committed_block(block)?;

        let created = Metrics::observe_db(
            &block.chain_id,
            "create_block",
            with_retries(&self.persistence_retry_policy, "persisting block", || {
                self.repo.create_block(block, &outbox)
            }),
        )
        .await?;

        if created {
            Metrics::record_block_processed(&block.chain_id, block.number);
            info!(
                chain_id = %block.chain_id,
                height = block.number,
                transactions = block.transactions.len(),
                "persisted block"
            );
        }

        Ok(())
    }

    async fn mark_published(&self, chain_id: &ChainId, ids: &[i64]) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }

        Metrics::observe_db(
            chain_id,
            "mark_published",
            with_retries(&self.persistence_retry_policy, "marking outbox entries published", || {
                self.repo.mark_published(chain_id, ids)
            }),
        )
        .await?;

        Ok(())
    }
}
