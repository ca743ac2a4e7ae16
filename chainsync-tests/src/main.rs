use chainsync::{ChainsyncRepo, Repo};
use chainsync_tests::{db, test_runner};

#[tokio::main]
async fn main() {
    test_runner::init_tracing();

    let Some(database_url) = db::database_url() else {
        tracing::warn!("TEST_DATABASE_URL is not set, nothing to set up");
        return;
    };

    db::setup(&database_url);
    let repo = ChainsyncRepo::new(&database_url, 1).await.unwrap();
    repo.migrate().await.unwrap();

    tracing::info!("test database is ready");
}
