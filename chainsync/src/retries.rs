use std::fmt::Display;
use std::future::Future;

use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryPolicy;

/// Runs `operation` until it succeeds or the policy's retries are exhausted,
/// backing off exponentially between attempts. Returns the last error.
pub async fn with_retries<T, E, F, Fut>(
    retry_policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut retries_so_far = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if retries_so_far < retry_policy.max_retries => {
                warn!(retries_so_far, %error, "{operation_name} failed, retrying");

                sleep(retry_policy.delay(retries_so_far)).await;
                retries_so_far += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
