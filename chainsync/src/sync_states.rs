//! Durable per-chain sync progress. The single source of truth for where a
//! chain resumes from and how far behind it is.
mod sync_status;

pub use sync_status::{SyncMode, SyncStatus};

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::event_stream::{EventStream, StreamEvent};
use crate::repos::{Repo, RepoError, SyncStatusWrite};
use crate::{Chain, ChainId};

#[derive(Debug, thiserror::Error)]
pub enum SyncStateError {
    #[error("chain {0} is not tracked")]
    Untracked(ChainId),
    #[error("last confirmed block of {chain_id} cannot move from {current:?} to {proposed:?}")]
    NonMonotonic {
        chain_id: ChainId,
        current: Option<u64>,
        proposed: Option<u64>,
    },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

type SyncStatusHandle = Arc<Mutex<SyncStatus>>;

/// Arena of per-chain lockable status handles, backed by the repo.
///
/// Each update locks only its chain's handle, so chains never wait on each other.
/// Handles are cached after the first `track` and every write goes through the repo
/// before the cached copy is replaced.
pub struct SyncStates<R: Repo> {
    repo: R,
    stream: Arc<dyn EventStream>,
    handles: Arc<RwLock<HashMap<ChainId, SyncStatusHandle>>>,
}

impl<R: Repo> Clone for SyncStates<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            stream: self.stream.clone(),
            handles: self.handles.clone(),
        }
    }
}

impl<R: Repo> Debug for SyncStates<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStates").field("repo", &self.repo).finish()
    }
}

impl<R: Repo> SyncStates<R> {
    pub fn new(repo: R, stream: Arc<dyn EventStream>) -> Self {
        Self {
            repo,
            stream,
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Loads the persisted status of a chain, creating it on first enable.
    pub async fn track(&self, chain: &Chain) -> Result<SyncStatus, SyncStateError> {
        if let Some(handle) = self.handle(&chain.id).await {
            return Ok(handle.lock().await.clone());
        }

        let sync_status = match self.repo.load_sync_status(&chain.id).await? {
            Some(sync_status) => sync_status,
            None => {
                let sync_status = SyncStatus::new(&chain.id, chain.start_block);
                self.repo.save_sync_status(&sync_status, SyncStatusWrite::Rewind).await?;
                sync_status
            }
        };

        let mut handles = self.handles.write().await;
        let handle = handles
            .entry(chain.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(sync_status)));

        let sync_status = handle.lock().await.clone();
        Ok(sync_status)
    }

    pub async fn get(&self, chain_id: &ChainId) -> Option<SyncStatus> {
        match self.handle(chain_id).await {
            Some(handle) => Some(handle.lock().await.clone()),
            None => None,
        }
    }

    /// Every tracked status, including chains tracked by earlier runs.
    pub async fn all(&self) -> Result<Vec<SyncStatus>, SyncStateError> {
        let mut sync_statuses: HashMap<_, _> = self
            .repo
            .load_sync_statuses()
            .await?
            .into_iter()
            .map(|s| (s.chain_id.clone(), s))
            .collect();

        let handles: Vec<_> = self.handles.read().await.values().cloned().collect();
        for handle in handles {
            let sync_status = handle.lock().await.clone();
            sync_statuses.insert(sync_status.chain_id.clone(), sync_status);
        }

        let mut sync_statuses: Vec<_> = sync_statuses.into_values().collect();
        sync_statuses.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));

        Ok(sync_statuses)
    }

    pub async fn transition(
        &self,
        chain_id: &ChainId,
        mode: SyncMode,
    ) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Advance, |sync_status| {
            if sync_status.mode != SyncMode::Degraded || mode == SyncMode::Idle {
                sync_status.mode = mode;
                sync_status.degraded_from = None;
            } else {
                // Still degraded. Recovery decides when to leave.
                sync_status.degraded_from = Some(mode);
            }
        })
        .await
    }

    /// Records a committed height, along with the tip known at commit time.
    pub async fn advance(
        &self,
        chain_id: &ChainId,
        last_confirmed_block: u64,
        highest_known_block: u64,
    ) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Advance, |sync_status| {
            sync_status.last_confirmed_block = Some(last_confirmed_block);
            sync_status.highest_known_block = sync_status
                .highest_known_block
                .max(highest_known_block)
                .max(last_confirmed_block);
        })
        .await
    }

    pub async fn observe_highest(
        &self,
        chain_id: &ChainId,
        highest_known_block: u64,
    ) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Advance, |sync_status| {
            sync_status.highest_known_block = sync_status.highest_known_block.max(highest_known_block);
        })
        .await
    }

    /// Moves the confirmed height back below a fork point after a rollback.
    pub async fn rewind(
        &self,
        chain_id: &ChainId,
        fork_point: u64,
    ) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Rewind, |sync_status| {
            sync_status.last_confirmed_block = if fork_point > sync_status.start_block {
                Some(fork_point - 1)
            } else {
                None
            };
        })
        .await
    }

    pub async fn record_error(
        &self,
        chain_id: &ChainId,
        error: &str,
    ) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Advance, |sync_status| {
            sync_status.last_error = Some(error.to_string());
        })
        .await
    }

    /// Drops the last error once a chain makes progress again.
    /// A degraded chain keeps it until it recovers.
    pub async fn clear_error(&self, chain_id: &ChainId) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Advance, |sync_status| {
            if !sync_status.is_degraded() {
                sync_status.last_error = None;
            }
        })
        .await
    }

    pub async fn degrade(
        &self,
        chain_id: &ChainId,
        error: &str,
    ) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Advance, |sync_status| {
            if sync_status.mode != SyncMode::Degraded {
                sync_status.degraded_from = Some(sync_status.mode).filter(SyncMode::is_active);
                sync_status.mode = SyncMode::Degraded;
            }
            sync_status.last_error = Some(error.to_string());
        })
        .await
    }

    /// Returns a degraded chain to the mode it was degraded from, clearing its last error.
    pub async fn recover(&self, chain_id: &ChainId) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Advance, |sync_status| {
            if sync_status.mode == SyncMode::Degraded {
                sync_status.mode = sync_status.degraded_from.take().unwrap_or(SyncMode::Backfilling);
            }
            sync_status.last_error = None;
        })
        .await
    }

    /// Restarts a chain's progress from `start_block`.
    pub async fn reset(
        &self,
        chain_id: &ChainId,
        start_block: u64,
    ) -> Result<SyncStatus, SyncStateError> {
        self.update(chain_id, SyncStatusWrite::Rewind, |sync_status| {
            sync_status.start_block = start_block;
            sync_status.last_confirmed_block = None;
            sync_status.last_error = None;
            sync_status.degraded_from = None;
            sync_status.mode = SyncMode::Idle;
        })
        .await
    }

    async fn update<F>(
        &self,
        chain_id: &ChainId,
        write: SyncStatusWrite,
        apply: F,
    ) -> Result<SyncStatus, SyncStateError>
    where
        F: FnOnce(&mut SyncStatus),
    {
        let handle =
            self.handle(chain_id).await.ok_or_else(|| SyncStateError::Untracked(chain_id.clone()))?;
        let mut current = handle.lock().await;

        let mut next = current.clone();
        apply(&mut next);
        next.last_updated_at = Utc::now().timestamp_millis();

        if write == SyncStatusWrite::Advance
            && next.last_confirmed_block < current.last_confirmed_block
        {
            return Err(SyncStateError::NonMonotonic {
                chain_id: chain_id.clone(),
                current: current.last_confirmed_block,
                proposed: next.last_confirmed_block,
            });
        }

        self.repo.save_sync_status(&next, write).await?;
        *current = next.clone();
        drop(current);

        self.publish(&next).await;

        Ok(next)
    }

    async fn publish(&self, sync_status: &SyncStatus) {
        let published = match StreamEvent::for_sync_status(sync_status) {
            Ok(event) => self.stream.publish(&event).await,
            Err(error) => Err(error),
        };

        if let Err(error) = published {
            warn!(chain_id = %sync_status.chain_id, %error, "could not publish sync status");
        }
    }

    async fn handle(&self, chain_id: &ChainId) -> Option<SyncStatusHandle> {
        self.handles.read().await.get(chain_id).cloned()
    }
}
