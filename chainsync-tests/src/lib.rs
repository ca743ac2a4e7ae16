pub mod db;
pub mod factory;
pub mod test_runner;

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Polls `check` until it returns a value or `timeout` elapses.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }

        sleep(Duration::from_millis(10)).await;
    }
}
