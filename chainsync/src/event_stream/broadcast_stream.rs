use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use super::{EventStream, StreamError, StreamEvent, Topic};

const DEFAULT_CAPACITY: usize = 1_024;

/// In-process stream with one broadcast channel per topic.
#[derive(Clone, Debug)]
pub struct BroadcastStream {
    senders: Arc<HashMap<Topic, broadcast::Sender<StreamEvent>>>,
}

impl Default for BroadcastStream {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastStream {
    pub fn new(capacity: usize) -> Self {
        let senders = Topic::ALL
            .into_iter()
            .map(|topic| (topic, broadcast::channel(capacity).0))
            .collect();

        Self {
            senders: Arc::new(senders),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<StreamEvent> {
        self.sender(topic).subscribe()
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<StreamEvent> {
        // Every topic gets a sender in `new`
        &self.senders[&topic]
    }
}

#[async_trait::async_trait]
impl EventStream for BroadcastStream {
    async fn publish(&self, event: &StreamEvent) -> Result<(), StreamError> {
        // No receivers only means nobody is listening on this topic yet
        let _ = self.sender(event.topic).send(event.clone());

        Ok(())
    }
}
