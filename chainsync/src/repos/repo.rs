use std::fmt::Debug;

use serde::{Deserialize, Serialize};

pub use crate::blocks::BlockRef;

use crate::blocks::Block;
use crate::chain_reorg::{ReorgedBlock, UnsavedReorgedBlock};
use crate::event_stream::StreamEvent;
use crate::sync_states::SyncStatus;
use crate::ChainId;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("repo is not connected: {0}")]
    NotConnected(String),
    #[error("sync status of {chain_id} cannot move from {current:?} to {proposed:?}")]
    NonMonotonic {
        chain_id: ChainId,
        current: Option<u64>,
        proposed: Option<u64>,
    },
    #[error("{0}")]
    Unknown(String),
}

/// Persisted owner of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    pub hash: String,
    pub block_hash: String,
    pub block_number: u64,
}

/// Stream event written atomically with the rows it describes and
/// kept until it has been published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub event: StreamEvent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatusWrite {
    /// `last_confirmed_block` may only stay or grow.
    Advance,
    /// Allowed after a reorg or an explicit reset.
    Rewind,
}

#[async_trait::async_trait]
pub trait Repo: Clone + Debug + Send + Sync + 'static {
    async fn migrate(&self) -> Result<(), RepoError>;

    async fn get_block_ref_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<BlockRef>, RepoError>;
    async fn get_block_ref_by_hash(
        &self,
        chain_id: &ChainId,
        hash: &str,
    ) -> Result<Option<BlockRef>, RepoError>;
    async fn get_transaction_refs(
        &self,
        chain_id: &ChainId,
        hashes: &[String],
    ) -> Result<Vec<TransactionRef>, RepoError>;
    /// Full blocks in ascending order, `to` inclusive.
    async fn get_blocks(
        &self,
        chain_id: &ChainId,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Block>, RepoError>;

    /// Persists the block, its transactions, its events and their outbox entries
    /// as one unit. Returns false when the block hash is already persisted.
    async fn create_block(&self, block: &Block, outbox: &[StreamEvent]) -> Result<bool, RepoError>;
    /// Removes every block at or above the fork point, with their transactions and
    /// events, recording the reorg and its retraction outbox entries in the same unit.
    async fn delete_blocks_from(
        &self,
        reorged_block: &UnsavedReorgedBlock,
        retractions: &[StreamEvent],
    ) -> Result<(), RepoError>;
    async fn get_reorged_blocks(&self, chain_id: &ChainId) -> Result<Vec<ReorgedBlock>, RepoError>;

    async fn load_sync_status(&self, chain_id: &ChainId) -> Result<Option<SyncStatus>, RepoError>;
    async fn load_sync_statuses(&self) -> Result<Vec<SyncStatus>, RepoError>;
    /// Atomic read-verify-write per chain.
    async fn save_sync_status(
        &self,
        sync_status: &SyncStatus,
        write: SyncStatusWrite,
    ) -> Result<(), RepoError>;

    async fn load_unpublished(
        &self,
        chain_id: &ChainId,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, RepoError>;
    async fn mark_published(&self, chain_id: &ChainId, ids: &[i64]) -> Result<(), RepoError>;
}

/// Shared verification of [SyncStatusWrite::Advance].
pub(crate) fn verify_sync_status_write(
    current: Option<&SyncStatus>,
    proposed: &SyncStatus,
    write: SyncStatusWrite,
) -> Result<(), RepoError> {
    match (current, write) {
        (Some(current), SyncStatusWrite::Advance)
            if current.last_confirmed_block > proposed.last_confirmed_block =>
        {
            Err(RepoError::NonMonotonic {
                chain_id: proposed.chain_id.clone(),
                current: current.last_confirmed_block,
                proposed: proposed.last_confirmed_block,
            })
        }
        _ => Ok(()),
    }
}

pub trait RepoMigrations: Migratable {
    fn create_blocks_migration() -> &'static [&'static str];
    fn create_transactions_migration() -> &'static [&'static str];
    fn create_events_migration() -> &'static [&'static str];
    fn create_sync_statuses_migration() -> &'static [&'static str];
    fn create_outbox_migration() -> &'static [&'static str];
    fn create_reorged_blocks_migration() -> &'static [&'static str];

    fn get_internal_migrations() -> Vec<&'static str> {
        [
            Self::create_blocks_migration(),
            Self::create_transactions_migration(),
            Self::create_events_migration(),
            Self::create_sync_statuses_migration(),
            Self::create_outbox_migration(),
            Self::create_reorged_blocks_migration(),
        ]
        .concat()
    }
}

#[async_trait::async_trait]
pub trait Migratable: Sync + Send {
    type RawQueryClient: Send + Sync;

    async fn execute_raw_query(client: &Self::RawQueryClient, query: &str) -> Result<(), RepoError>;

    async fn run_migrations(
        client: &Self::RawQueryClient,
        migrations: Vec<&'static str>,
    ) -> Result<(), RepoError>
    where
        Self: Sized,
    {
        for migration in migrations {
            Self::execute_raw_query(client, migration).await?;
        }

        Ok(())
    }
}

pub struct SQLikeMigrations;

impl SQLikeMigrations {
    pub fn create_blocks() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS chainsync_blocks (
                id BIGSERIAL PRIMARY KEY,
                chain_id VARCHAR NOT NULL,
                number BIGINT NOT NULL,
                hash VARCHAR NOT NULL,
                parent_hash VARCHAR NOT NULL,
                timestamp BIGINT NOT NULL,
                gas_used BIGINT,
                gas_limit BIGINT,
                producer VARCHAR,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS chainsync_blocks_chain_number_index
            ON chainsync_blocks(chain_id, number)",
            "CREATE UNIQUE INDEX IF NOT EXISTS chainsync_blocks_chain_hash_index
            ON chainsync_blocks(chain_id, hash)",
            "CREATE INDEX IF NOT EXISTS chainsync_blocks_chain_timestamp_index
            ON chainsync_blocks(chain_id, timestamp)",
        ]
    }

    pub fn create_transactions() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS chainsync_transactions (
                id BIGSERIAL PRIMARY KEY,
                chain_id VARCHAR NOT NULL,
                hash VARCHAR NOT NULL,
                block_hash VARCHAR,
                block_number BIGINT,
                transaction_index INTEGER NOT NULL,
                sender VARCHAR,
                receiver VARCHAR,
                value VARCHAR NOT NULL,
                fee VARCHAR,
                payload TEXT NOT NULL,
                status VARCHAR NOT NULL,
                balance_deltas JSON NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS chainsync_transactions_chain_hash_index
            ON chainsync_transactions(chain_id, hash)",
            "CREATE INDEX IF NOT EXISTS chainsync_transactions_chain_block_index
            ON chainsync_transactions(chain_id, block_number)",
            "CREATE INDEX IF NOT EXISTS chainsync_transactions_chain_sender_index
            ON chainsync_transactions(chain_id, sender)",
            "CREATE INDEX IF NOT EXISTS chainsync_transactions_chain_receiver_index
            ON chainsync_transactions(chain_id, receiver)",
        ]
    }

    pub fn create_events() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS chainsync_events (
                id BIGSERIAL PRIMARY KEY,
                chain_id VARCHAR NOT NULL,
                transaction_hash VARCHAR NOT NULL,
                block_number BIGINT NOT NULL,
                log_index INTEGER NOT NULL,
                block_log_index INTEGER,
                contract_address VARCHAR NOT NULL,
                signature VARCHAR NOT NULL,
                name VARCHAR,
                params JSON NOT NULL,
                topics JSON NOT NULL,
                data TEXT NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS chainsync_events_chain_transaction_log_index
            ON chainsync_events(chain_id, transaction_hash, log_index)",
            "CREATE INDEX IF NOT EXISTS chainsync_events_chain_block_index
            ON chainsync_events(chain_id, block_number)",
            "CREATE INDEX IF NOT EXISTS chainsync_events_chain_contract_index
            ON chainsync_events(chain_id, contract_address)",
        ]
    }

    pub fn create_sync_statuses() -> &'static [&'static str] {
        &["CREATE TABLE IF NOT EXISTS chainsync_sync_statuses (
                chain_id VARCHAR PRIMARY KEY,
                mode VARCHAR NOT NULL,
                degraded_from VARCHAR,
                start_block BIGINT NOT NULL,
                last_confirmed_block BIGINT,
                highest_known_block BIGINT NOT NULL,
                last_error TEXT,
                last_updated_at BIGINT NOT NULL
            )"]
    }

    pub fn create_outbox() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS chainsync_outbox (
                id BIGSERIAL PRIMARY KEY,
                chain_id VARCHAR NOT NULL,
                event JSON NOT NULL,
                published_at TIMESTAMPTZ,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE INDEX IF NOT EXISTS chainsync_outbox_unpublished_index
            ON chainsync_outbox(chain_id, id) WHERE published_at IS NULL",
        ]
    }

    pub fn create_reorged_blocks() -> &'static [&'static str] {
        &["CREATE TABLE IF NOT EXISTS chainsync_reorged_blocks (
                id BIGSERIAL PRIMARY KEY,
                chain_id VARCHAR NOT NULL,
                fork_point BIGINT NOT NULL,
                depth BIGINT NOT NULL,
                inserted_at BIGINT NOT NULL
            )"]
    }

    pub fn create_stream_log() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS chainsync_stream_log (
                id BIGSERIAL PRIMARY KEY,
                event_id UUID NOT NULL,
                topic VARCHAR NOT NULL,
                chain_id VARCHAR NOT NULL,
                key VARCHAR NOT NULL,
                kind VARCHAR NOT NULL,
                payload JSON NOT NULL,
                created_at BIGINT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS chainsync_stream_log_event_id_index
            ON chainsync_stream_log(event_id)",
            "CREATE INDEX IF NOT EXISTS chainsync_stream_log_topic_index
            ON chainsync_stream_log(topic, id)",
        ]
    }
}
