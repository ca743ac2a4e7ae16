use std::collections::BTreeMap;
use std::future::Future;

use futures_util::{stream, StreamExt};

use crate::blocks::Block;

use super::AdapterError;

/// Fetches `from..=to` with up to `max_concurrent` requests in flight and
/// buffers completed blocks until they can be handed over in ascending order.
///
/// A missing or mismatched height fails the whole range.
pub async fn fetch_in_order<F, Fut>(
    from: u64,
    to: u64,
    max_concurrent: usize,
    fetch: F,
) -> Result<Vec<Block>, AdapterError>
where
    F: Fn(u64) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Block, AdapterError>> + Send,
{
    if from > to {
        return Ok(vec![]);
    }

    let mut fetches = stream::iter(from..=to)
        .map(|height| {
            let fetched = fetch(height);
            async move { (height, fetched.await) }
        })
        .buffer_unordered(max_concurrent.max(1));

    let mut reorder_buffer = BTreeMap::new();
    while let Some((height, fetched)) = fetches.next().await {
        let block = fetched?;

        if block.number != height {
            return Err(AdapterError::Transient(format!(
                "requested block {height} but received {}",
                block.number
            )));
        }

        reorder_buffer.insert(height, block);
    }

    let expected = to - from + 1;
    if reorder_buffer.len() as u64 != expected {
        return Err(AdapterError::Transient(format!(
            "received {} of {expected} blocks in {from}..={to}",
            reorder_buffer.len()
        )));
    }

    Ok(reorder_buffer.into_values().collect())
}
