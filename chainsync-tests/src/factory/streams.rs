use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chainsync::{
    ChainId, EventStream, StreamError, StreamEvent, StreamEventKind, SyncMode, Topic,
};

/// Keeps every published event, in publish order.
#[derive(Clone, Debug, Default)]
pub struct RecordingStream {
    events: Arc<Mutex<Vec<StreamEvent>>>,
    unavailable: Arc<AtomicBool>,
}

impl RecordingStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn events(&self, chain_id: &ChainId, topic: Topic) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| &event.chain_id == chain_id && event.topic == topic)
            .cloned()
            .collect()
    }

    pub fn keys(&self, chain_id: &ChainId, topic: Topic, kind: StreamEventKind) -> Vec<String> {
        self.events(chain_id, topic)
            .into_iter()
            .filter(|event| event.kind == kind)
            .map(|event| event.key)
            .collect()
    }

    /// Every mode a chain reported, collapsing repeats.
    pub fn modes(&self, chain_id: &ChainId) -> Vec<SyncMode> {
        let mut modes: Vec<SyncMode> = vec![];

        for event in self.events(chain_id, Topic::SyncStatus) {
            let mode = event.payload["mode"].as_str().and_then(SyncMode::parse);

            if let Some(mode) = mode {
                if modes.last() != Some(&mode) {
                    modes.push(mode);
                }
            }
        }

        modes
    }

    /// Every `last_confirmed_block` a chain reported, collapsing repeats.
    pub fn confirmed_heights(&self, chain_id: &ChainId) -> Vec<Option<u64>> {
        let mut heights: Vec<Option<u64>> = vec![];

        for event in self.events(chain_id, Topic::SyncStatus) {
            let height = event.payload["last_confirmed_block"].as_u64();

            if heights.last() != Some(&height) {
                heights.push(height);
            }
        }

        heights
    }
}

#[async_trait::async_trait]
impl EventStream for RecordingStream {
    async fn publish(&self, event: &StreamEvent) -> Result<(), StreamError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StreamError::Unavailable("broker is down".to_string()));
        }

        self.events.lock().unwrap().push(event.clone());

        Ok(())
    }
}
