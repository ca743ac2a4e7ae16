//! Control surface of the process: one supervised sync loop per enabled chain.
mod health;
mod sync_loop;

pub use health::{HealthMonitor, HealthTransition};
pub use sync_loop::SyncLoop;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::ChainsyncError;
use crate::ingester::IngestionPipeline;
use crate::metrics::Metrics;
use crate::plugins::PluginRegistry;
use crate::repos::Repo;
use crate::sync_states::{SyncMode, SyncStates, SyncStatus};
use crate::ChainId;

/// How often the supervisor restarts loops of enabled chains that ended.
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(1);

struct SyncLoopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Lets the in-flight step finish, aborting the loop once `deadline` passes.
    async fn stop(self, chain_id: &ChainId, deadline: Duration) {
        self.stop.send_replace(true);
        let abort_handle = self.task.abort_handle();

        match timeout(deadline, self.task).await {
            Ok(Ok(())) => debug!(%chain_id, "sync loop exited"),
            Ok(Err(error)) => warn!(%chain_id, %error, "sync loop ended abnormally"),
            Err(_elapsed) => {
                warn!(%chain_id, ?deadline, "sync loop missed the shutdown deadline, aborting");
                abort_handle.abort();
            }
        }
    }
}

pub struct SyncOrchestrator<R: Repo> {
    config: Config<R>,
    registry: PluginRegistry,
    sync_states: SyncStates<R>,
    pipeline: IngestionPipeline<R>,
    sync_loops: Arc<Mutex<HashMap<ChainId, SyncLoopHandle>>>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Serializes control operations.
    control: Arc<Mutex<()>>,
}

impl<R: Repo> Clone for SyncOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            sync_states: self.sync_states.clone(),
            pipeline: self.pipeline.clone(),
            sync_loops: self.sync_loops.clone(),
            supervisor: self.supervisor.clone(),
            control: self.control.clone(),
        }
    }
}

impl<R: Repo> SyncOrchestrator<R> {
    /// Validates the config and registers its chains with the compiled-in
    /// adapter factories. Nothing syncs until [SyncOrchestrator::start].
    pub async fn new(config: Config<R>) -> Result<Self, ChainsyncError> {
        config.validate()?;
        Metrics::describe();

        let registry = match &config.chains_source {
            Some(chains_source) => PluginRegistry::new().with_chains_source(chains_source),
            None => PluginRegistry::new(),
        };
        for chain in config.chains.iter() {
            registry.register_chain(chain.clone()).await?;
        }

        Ok(Self {
            sync_states: SyncStates::new(config.repo.clone(), config.stream.clone()),
            pipeline: IngestionPipeline::new(&config),
            registry,
            config,
            sync_loops: Arc::new(Mutex::new(HashMap::new())),
            supervisor: Arc::new(Mutex::new(None)),
            control: Arc::new(Mutex::new(())),
        })
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Migrates the repo, starts supervising and enables every chain configured
    /// as enabled. Returns the first enable failure after trying every chain.
    pub async fn start(&self) -> Result<(), ChainsyncError> {
        self.config.repo.migrate().await?;
        self.registry.reload().await?;
        self.spawn_supervisor().await;

        let mut first_error = None;
        for chain in self.registry.chains().await.into_iter().filter(|chain| chain.enabled) {
            if let Err(error) = self.enable_chain(&chain.id).await {
                error!(chain_id = %chain.id, %error, "could not enable chain");
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Starts syncing a chain. A no-op for chains already syncing.
    pub async fn enable_chain(&self, chain_id: &ChainId) -> Result<SyncStatus, ChainsyncError> {
        let _control = self.control.lock().await;

        self.registry.enable(chain_id).await?;
        self.start_sync_loop(chain_id).await
    }

    /// Stops syncing a chain once its in-flight batch has committed.
    pub async fn disable_chain(&self, chain_id: &ChainId) -> Result<(), ChainsyncError> {
        let _control = self.control.lock().await;

        self.registry.disable(chain_id).await?;
        self.stop_sync_loop(chain_id).await
    }

    /// Restarts a chain's progress from `start_block`. Persisted blocks stay;
    /// re-ingesting them is a no-op.
    pub async fn reset_chain(
        &self,
        chain_id: &ChainId,
        start_block: u64,
    ) -> Result<SyncStatus, ChainsyncError> {
        let _control = self.control.lock().await;

        let chain = self
            .registry
            .chain(chain_id)
            .await
            .ok_or_else(|| ChainsyncError::UnknownChain(chain_id.clone()))?;

        self.stop_sync_loop(chain_id).await?;
        self.sync_states.track(&chain).await?;
        let sync_status = self.sync_states.reset(chain_id, start_block).await?;
        info!(%chain_id, start_block, "reset chain");

        if self.registry.is_enabled(chain_id).await {
            return self.start_sync_loop(chain_id).await;
        }

        Ok(sync_status)
    }

    pub async fn sync_status(&self, chain_id: &ChainId) -> Result<SyncStatus, ChainsyncError> {
        if let Some(sync_status) = self.sync_states.get(chain_id).await {
            return Ok(sync_status);
        }

        self.config
            .repo
            .load_sync_status(chain_id)
            .await?
            .ok_or_else(|| ChainsyncError::UnknownChain(chain_id.clone()))
    }

    pub async fn sync_statuses(&self) -> Result<Vec<SyncStatus>, ChainsyncError> {
        Ok(self.sync_states.all().await?)
    }

    /// Stops supervising and stops every loop, each bounded by the shutdown deadline.
    pub async fn shutdown(&self) {
        let _control = self.control.lock().await;

        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.abort();
        }

        let sync_loops: Vec<_> = self.sync_loops.lock().await.drain().collect();
        let deadline = self.shutdown_deadline();

        join_all(sync_loops.into_iter().map(|(chain_id, sync_loop)| async move {
            sync_loop.stop(&chain_id, deadline).await;
            self.idle(&chain_id).await;
        }))
        .await;

        info!("sync orchestrator shut down");
    }

    async fn start_sync_loop(&self, chain_id: &ChainId) -> Result<SyncStatus, ChainsyncError> {
        let chain = self
            .registry
            .chain(chain_id)
            .await
            .ok_or_else(|| ChainsyncError::UnknownChain(chain_id.clone()))?;
        let adapter = self
            .registry
            .adapter(chain_id)
            .await
            .ok_or_else(|| ChainsyncError::Disabled(chain_id.clone()))?;

        let mut sync_loops = self.sync_loops.lock().await;
        let sync_status = self.sync_states.track(&chain).await?;

        if sync_loops.get(chain_id).is_some_and(SyncLoopHandle::is_running) {
            debug!(%chain_id, "chain is already syncing");
            return Ok(sync_status);
        }

        let (stop, stopped) = watch::channel(false);
        let sync_loop = SyncLoop::new(
            chain,
            adapter,
            &self.config,
            self.pipeline.clone(),
            self.sync_states.clone(),
            stopped,
        );

        sync_loops.insert(
            chain_id.clone(),
            SyncLoopHandle {
                stop,
                task: tokio::spawn(sync_loop.run()),
            },
        );

        Ok(sync_status)
    }

    async fn stop_sync_loop(&self, chain_id: &ChainId) -> Result<(), ChainsyncError> {
        let sync_loop = self.sync_loops.lock().await.remove(chain_id);

        if let Some(sync_loop) = sync_loop {
            sync_loop.stop(chain_id, self.shutdown_deadline()).await;
        }
        self.idle(chain_id).await;

        Ok(())
    }

    async fn idle(&self, chain_id: &ChainId) {
        if self.sync_states.get(chain_id).await.is_none() {
            return;
        }

        if let Err(error) = self.sync_states.transition(chain_id, SyncMode::Idle).await {
            error!(%chain_id, %error, "could not mark chain idle");
        }
    }

    async fn spawn_supervisor(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return;
        }

        let orchestrator = self.clone();
        let mut changes = self.registry.subscribe();

        *supervisor = Some(tokio::spawn(async move {
            let mut interval = interval(SUPERVISION_INTERVAL);

            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = interval.tick() => {}
                }

                orchestrator.reconcile().await;
            }
        }));
    }

    /// Runs exactly one loop for every enabled chain and none for the rest.
    async fn reconcile(&self) {
        let _control = self.control.lock().await;

        for plugin in self.registry.list().await {
            let chain_id = &plugin.chain_id;
            let is_running = self
                .sync_loops
                .lock()
                .await
                .get(chain_id)
                .is_some_and(SyncLoopHandle::is_running);

            let reconciled = match (plugin.enabled, is_running) {
                (true, false) => {
                    info!(%chain_id, "starting sync loop of enabled chain");
                    self.start_sync_loop(chain_id).await.map(|_| ())
                }
                (false, true) => self.stop_sync_loop(chain_id).await,
                _ => Ok(()),
            };

            if let Err(error) = reconciled {
                warn!(%chain_id, %error, "could not reconcile sync loop");
            }
        }
    }

    fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.config.shutdown_deadline_ms)
    }
}
