//! Append-only, multi-consumer stream of normalized events.
//! Consumers (analytics, metrics, ...) subscribe per topic.
mod broadcast_stream;
#[cfg(feature = "postgres")]
mod postgres_stream;
mod stream_event;

pub use broadcast_stream::BroadcastStream;
#[cfg(feature = "postgres")]
pub use postgres_stream::{PostgresStream, StreamLogEntry};
pub use stream_event::{StreamEvent, StreamEventKind, Topic};

use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream broker unavailable: {0}")]
    Unavailable(String),
    #[error("could not encode stream event: {0}")]
    Encoding(String),
}

#[async_trait::async_trait]
pub trait EventStream: Debug + Send + Sync {
    async fn publish(&self, event: &StreamEvent) -> Result<(), StreamError>;
}
