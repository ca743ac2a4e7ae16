use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chainsync::{
    AdapterError, AdapterFactory, Block, BlockStream, Chain, ChainAdapter, ChainId, ChainKind,
};

use super::{block, block_hash};

#[derive(Debug, Default)]
struct MockChain {
    blocks: BTreeMap<u64, Block>,
    branch: String,
    failures_left: u32,
    fetch_delays: HashMap<u64, Duration>,
    fetched: Vec<u64>,
}

impl MockChain {
    fn latest_height(&self) -> Option<u64> {
        self.blocks.keys().last().copied()
    }

    fn push(&mut self, chain_id: &ChainId, number: u64) {
        let hash = block_hash(number, &self.branch);
        let parent_hash = match self.blocks.get(&number.wrapping_sub(1)) {
            Some(parent) => parent.hash.clone(),
            None => block_hash(number.wrapping_sub(1), ""),
        };

        self.blocks.insert(number, block(chain_id, number, &hash, &parent_hash));
    }

    fn take_failure(&mut self) -> Result<(), AdapterError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(AdapterError::Transient("connection reset by peer".to_string()));
        }

        Ok(())
    }
}

/// In-memory chain whose canonical history tests can extend, fork and break.
#[derive(Clone, Debug)]
pub struct MockAdapter {
    chain_id: ChainId,
    cadence: Duration,
    max_concurrent_fetches: usize,
    mock_chain: Arc<Mutex<MockChain>>,
    subscriptions: Arc<AtomicU32>,
}

impl MockAdapter {
    /// Canonical blocks `from..=to`.
    pub fn new(chain: &Chain, from: u64, to: u64) -> Self {
        let adapter = Self {
            chain_id: chain.id.clone(),
            cadence: Duration::from_millis(chain.block_cadence_ms),
            max_concurrent_fetches: chain.max_concurrent_fetches,
            mock_chain: Arc::new(Mutex::new(MockChain::default())),
            subscriptions: Arc::new(AtomicU32::new(0)),
        };

        {
            let mut mock_chain = adapter.mock_chain.lock().unwrap();
            for number in from..=to {
                mock_chain.push(&adapter.chain_id, number);
            }
        }

        adapter
    }

    pub fn with_max_concurrent_fetches(mut self, max_concurrent_fetches: usize) -> Self {
        self.max_concurrent_fetches = max_concurrent_fetches;

        self
    }

    /// Produces canonical blocks up to `height`.
    pub fn extend_to(&self, height: u64) {
        let mut mock_chain = self.mock_chain.lock().unwrap();
        let from = mock_chain.latest_height().map_or(0, |latest| latest + 1);

        for number in from..=height {
            mock_chain.push(&self.chain_id, number);
        }
    }

    /// Replaces every block from `height` with a new branch reaching `new_tip`.
    pub fn fork_from(&self, height: u64, branch: &str, new_tip: u64) {
        let mut mock_chain = self.mock_chain.lock().unwrap();

        mock_chain.blocks.split_off(&height);
        mock_chain.branch = branch.to_string();
        for number in height..=new_tip {
            mock_chain.push(&self.chain_id, number);
        }
    }

    /// Fails the next `count` calls with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.mock_chain.lock().unwrap().failures_left = count;
    }

    pub fn delay_fetch(&self, height: u64, delay: Duration) {
        self.mock_chain.lock().unwrap().fetch_delays.insert(height, delay);
    }

    pub fn canonical_block(&self, height: u64) -> Option<Block> {
        self.mock_chain.lock().unwrap().blocks.get(&height).cloned()
    }

    /// Heights in the order their fetches completed.
    pub fn fetched(&self) -> Vec<u64> {
        self.mock_chain.lock().unwrap().fetched.clone()
    }

    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChainAdapter for MockAdapter {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches
    }

    async fn latest_height(&self) -> Result<u64, AdapterError> {
        let mut mock_chain = self.mock_chain.lock().unwrap();
        mock_chain.take_failure()?;

        mock_chain
            .latest_height()
            .ok_or_else(|| AdapterError::Transient("no blocks produced yet".to_string()))
    }

    async fn fetch_block(&self, height: u64) -> Result<Block, AdapterError> {
        let delay = {
            let mut mock_chain = self.mock_chain.lock().unwrap();
            mock_chain.take_failure()?;
            mock_chain.fetch_delays.get(&height).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut mock_chain = self.mock_chain.lock().unwrap();
        let block = mock_chain
            .blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| AdapterError::Transient(format!("block {height} not produced yet")))?;
        mock_chain.fetched.push(height);

        Ok(block)
    }

    fn subscribe_new_blocks(&self, from: u64) -> BlockStream {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        BlockStream::new(Arc::new(self.clone()), from, self.cadence)
    }
}

/// Hands out a prepared [MockAdapter] instead of connecting anywhere.
#[derive(Debug)]
pub struct MockAdapterFactory {
    adapter: MockAdapter,
}

impl MockAdapterFactory {
    pub fn new(adapter: &MockAdapter) -> Arc<Self> {
        Arc::new(Self {
            adapter: adapter.clone(),
        })
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn kind(&self) -> ChainKind {
        ChainKind::Evm
    }

    fn build(&self, chain: &Chain) -> Result<Arc<dyn ChainAdapter>, AdapterError> {
        if chain.id != self.adapter.chain_id {
            return Err(AdapterError::FatalConfig(format!(
                "mock adapter of {} cannot serve {}",
                self.adapter.chain_id, chain.id
            )));
        }

        Ok(Arc::new(self.adapter.clone()))
    }
}
