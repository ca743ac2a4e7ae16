use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chainsync::{
    Chain, ChainsyncRepo, Config, EventStream, HealthConfig, Repo, RetryPolicy, SyncOrchestrator,
};
use dotenvy::dotenv;
use std::env;
use tracing_subscriber::EnvFilter;

use crate::db;
use crate::factory::{MockAdapter, MockAdapterFactory};

/// Generous bound for a test chain to reach an expected state.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Installs a subscriber once, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runs `test_fn` against a migrated Postgres repo, or skips it when
/// `TEST_DATABASE_URL` is not set.
pub async fn run_test<TestFn, Fut>(test_fn: TestFn)
where
    TestFn: FnOnce(ChainsyncRepo) -> Fut,
    Fut: Future<Output = ()>,
{
    init_tracing();

    let Some(database_url) = db::database_url() else {
        eprintln!("skipping Postgres test: TEST_DATABASE_URL is not set");
        return;
    };

    if should_setup_test_db() {
        db::setup(&database_url);
    }

    let repo = ChainsyncRepo::new(&database_url, 4).await.unwrap();
    repo.migrate().await.unwrap();

    test_fn(repo).await;
}

/// Config with fast retries, suited to chains polled every few milliseconds.
pub fn config<R: Repo>(repo: R, stream: Arc<dyn EventStream>) -> Config<R> {
    Config::new(repo)
        .with_stream(stream)
        .with_adapter_retry_policy(RetryPolicy::new(3, 5, 20))
        .with_persistence_retry_policy(RetryPolicy::new(1, 1, 5))
        .with_publish_retry_policy(RetryPolicy::new(1, 1, 5))
        .with_health_config(HealthConfig::new(3, 60_000, 2))
        .with_rpc_timeout_ms(1_000)
        .with_shutdown_deadline_ms(1_000)
}

/// Orchestrator whose chains are served by the given mock adapters.
pub async fn orchestrator<R: Repo>(
    config: Config<R>,
    chains: &[(Chain, MockAdapter)],
) -> SyncOrchestrator<R> {
    let config = chains.iter().fold(config, |config, (chain, _)| config.add_chain(chain.clone()));
    let orchestrator = SyncOrchestrator::new(config).await.unwrap();

    for (chain, adapter) in chains {
        orchestrator
            .registry()
            .register(chain.clone(), MockAdapterFactory::new(adapter))
            .await
            .unwrap();
    }

    orchestrator
}

fn should_setup_test_db() -> bool {
    dotenv().ok();

    env::var("SETUP_TEST_DB").is_ok()
}
