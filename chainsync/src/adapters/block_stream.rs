use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{FutureExt, Stream};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::{debug, warn};

use crate::blocks::Block;
use crate::metrics::Metrics;

use super::{AdapterError, ChainAdapter};

type LatestHeightFuture = Pin<Box<dyn Future<Output = Result<u64, AdapterError>> + Send>>;
type BlockFuture = Pin<Box<dyn Future<Output = Result<Block, AdapterError>> + Send>>;

enum BlockStreamState {
    GetLatestHeight,
    PollLatestHeight(LatestHeightFuture),
    Wait(Pin<Box<Sleep>>),
    FetchBlock(u64),
    PollBlock((BlockFuture, u64)),
}

pin_project!(
    /// Lazy, infinite stream of blocks from a starting height.
    ///
    /// New heights are discovered through pushed heads when available, by
    /// polling the latest height at the chain's cadence otherwise. Every height
    /// between the last block yielded and the newest head is fetched, so an error
    /// item never leaves a gap: the stream resumes from the last height it saw.
    pub struct BlockStream {
        adapter: Arc<dyn ChainAdapter>,
        next_height: u64,
        cadence: Duration,
        heads: Option<mpsc::Receiver<u64>>,
        state: BlockStreamState,
    }
);

impl BlockStream {
    pub fn new(adapter: Arc<dyn ChainAdapter>, from: u64, cadence: Duration) -> Self {
        Self {
            adapter,
            next_height: from,
            cadence,
            heads: None,
            state: BlockStreamState::GetLatestHeight,
        }
    }

    /// Wakes up on pushed head heights instead of polling.
    pub fn with_heads(mut self, heads: mpsc::Receiver<u64>) -> Self {
        self.heads = Some(heads);

        self
    }

    /// Polls at twice the cadence, used while a chain is degraded.
    pub fn slowed_down(mut self) -> Self {
        self.cadence = self.cadence.saturating_mul(2);

        self
    }
}

impl Stream for BlockStream {
    type Item = Result<Block, AdapterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let next_height = *this.next_height;

        match this.state {
            BlockStreamState::GetLatestHeight => {
                if let Some(heads) = this.heads.as_mut() {
                    match heads.poll_recv(cx) {
                        Poll::Ready(Some(head)) => {
                            *this.state = BlockStreamState::FetchBlock(head);
                        }
                        Poll::Ready(None) => {
                            warn!(
                                chain_id = %this.adapter.chain_id(),
                                "new heads subscription ended, polling instead"
                            );
                            *this.heads = None;
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                } else {
                    let adapter = this.adapter.clone();

                    *this.state = BlockStreamState::PollLatestHeight(
                        async move {
                            Metrics::observe_rpc(adapter.chain_id(), "latest_height", adapter.latest_height())
                                .await
                        }
                        .boxed(),
                    );
                }

                cx.waker().wake_by_ref();
                Poll::Pending
            }
            BlockStreamState::PollLatestHeight(latest_height_future) => {
                let latest_height = futures_util::ready!(latest_height_future.as_mut().poll(cx));

                match latest_height {
                    Ok(latest_height) if latest_height >= next_height => {
                        *this.state = BlockStreamState::FetchBlock(latest_height);

                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                    Ok(_) => {
                        *this.state = BlockStreamState::Wait(Box::pin(tokio::time::sleep(*this.cadence)));

                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                    Err(error) => {
                        *this.state = BlockStreamState::Wait(Box::pin(tokio::time::sleep(*this.cadence)));

                        Poll::Ready(Some(Err(error)))
                    }
                }
            }
            BlockStreamState::Wait(sleep) => {
                futures_util::ready!(sleep.as_mut().poll(cx));

                *this.state = BlockStreamState::GetLatestHeight;

                cx.waker().wake_by_ref();
                Poll::Pending
            }
            BlockStreamState::FetchBlock(latest_height) => {
                let latest_height = *latest_height;

                if next_height > latest_height {
                    *this.state = BlockStreamState::GetLatestHeight;
                } else {
                    let adapter = this.adapter.clone();
                    debug!(chain_id = %adapter.chain_id(), height = next_height, "fetching new block");

                    *this.state = BlockStreamState::PollBlock((
                        async move {
                            Metrics::observe_rpc(adapter.chain_id(), "fetch_block", adapter.fetch_block(next_height))
                                .await
                        }
                        .boxed(),
                        latest_height,
                    ));
                }

                cx.waker().wake_by_ref();
                Poll::Pending
            }
            BlockStreamState::PollBlock((block_future, latest_height)) => {
                let block = futures_util::ready!(block_future.as_mut().poll(cx));

                match block {
                    Ok(block) => {
                        *this.next_height = block.number + 1;
                        *this.state = BlockStreamState::FetchBlock(*latest_height);

                        Poll::Ready(Some(Ok(block)))
                    }
                    Err(error) => {
                        *this.state = BlockStreamState::Wait(Box::pin(tokio::time::sleep(*this.cadence)));

                        Poll::Ready(Some(Err(error)))
                    }
                }
            }
        }
    }
}
