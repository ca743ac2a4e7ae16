mod migrations;
mod raw_queries;
mod rows;

pub use raw_queries::PostgresRepoRawQueryClient;

use std::collections::HashMap;
use std::fmt::Debug;

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::info;

use crate::blocks::{Block, Event, Transaction};
use crate::chain_reorg::{ReorgedBlock, UnsavedReorgedBlock};
use crate::diesels::schema::{
    chainsync_blocks, chainsync_events, chainsync_outbox, chainsync_reorged_blocks,
    chainsync_sync_statuses, chainsync_transactions,
};
use crate::event_stream::StreamEvent;
use crate::sync_states::SyncStatus;
use crate::ChainId;

use super::repo::{
    verify_sync_status_write, BlockRef, Migratable, OutboxEntry, Repo, RepoError, RepoMigrations,
    SyncStatusWrite, TransactionRef,
};
use rows::{
    from_json, BlockRow, EventRow, NewBlockRow, NewEventRow, NewOutboxRow, NewReorgedBlockRow,
    NewTransactionRow, SyncStatusRow, TransactionRow,
};

pub type Conn<'a> = bb8::PooledConnection<'a, AsyncDieselConnectionManager<AsyncPgConnection>>;
pub type Pool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

impl From<diesel::result::Error> for RepoError {
    fn from(error: diesel::result::Error) -> Self {
        RepoError::Unknown(error.to_string())
    }
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for RepoError {
    fn from(error: bb8::RunError<E>) -> Self {
        RepoError::NotConnected(error.to_string())
    }
}

impl From<tokio_postgres::Error> for RepoError {
    fn from(error: tokio_postgres::Error) -> Self {
        if error.is_closed() {
            RepoError::NotConnected(error.to_string())
        } else {
            RepoError::Unknown(error.to_string())
        }
    }
}

/// Repo for Postgres databases.
///
/// Typed reads and writes go through a pooled diesel-async connection.
/// Migrations and aggregate reads go through a raw tokio-postgres client.
#[derive(Clone)]
pub struct PostgresRepo {
    url: String,
    pool: Pool,
}

impl Debug for PostgresRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresRepo").finish_non_exhaustive()
    }
}

impl PostgresRepo {
    pub async fn new(url: &str, max_pool_size: u32) -> Result<Self, RepoError> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
        let pool = bb8::Pool::builder()
            .max_size(max_pool_size)
            .build(manager)
            .await
            .map_err(|e| RepoError::NotConnected(e.to_string()))?;

        Ok(Self {
            url: url.to_string(),
            pool,
        })
    }

    pub fn get_pool(&self) -> Pool {
        self.pool.clone()
    }

    pub async fn get_conn(&self) -> Result<Conn<'_>, RepoError> {
        Ok(self.pool.get().await?)
    }

    async fn get_transactions(
        conn: &mut Conn<'_>,
        chain_id: &ChainId,
        from: i64,
        to: i64,
    ) -> Result<HashMap<i64, Vec<Transaction>>, RepoError> {
        let transaction_rows: Vec<TransactionRow> = chainsync_transactions::table
            .filter(chainsync_transactions::chain_id.eq(chain_id.as_str()))
            .filter(chainsync_transactions::block_number.between(from, to))
            .order((
                chainsync_transactions::block_number.asc(),
                chainsync_transactions::transaction_index.asc(),
            ))
            .select(TransactionRow::as_select())
            .load(conn)
            .await?;

        let event_rows: Vec<EventRow> = chainsync_events::table
            .filter(chainsync_events::chain_id.eq(chain_id.as_str()))
            .filter(chainsync_events::block_number.between(from, to))
            .order((
                chainsync_events::block_number.asc(),
                chainsync_events::transaction_hash.asc(),
                chainsync_events::log_index.asc(),
            ))
            .select(EventRow::as_select())
            .load(conn)
            .await?;

        let mut events_by_transaction: HashMap<String, Vec<Event>> = HashMap::new();
        for event_row in event_rows {
            let event = Event::try_from(event_row)?;
            events_by_transaction.entry(event.transaction_hash.clone()).or_default().push(event);
        }

        let mut transactions_by_block: HashMap<i64, Vec<_>> = HashMap::new();
        for transaction_row in transaction_rows {
            let block_number = transaction_row.block_number.unwrap_or_default();
            let events = events_by_transaction.remove(&transaction_row.hash).unwrap_or_default();

            transactions_by_block
                .entry(block_number)
                .or_default()
                .push(transaction_row.into_transaction(events)?);
        }

        Ok(transactions_by_block)
    }
}

#[async_trait::async_trait]
impl Repo for PostgresRepo {
    async fn migrate(&self) -> Result<(), RepoError> {
        let client = self.get_raw_query_client().await?;

        Self::run_migrations(&client, Self::get_internal_migrations()).await?;
        info!("ran chainsync migrations");

        Ok(())
    }

    async fn get_block_ref_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<BlockRef>, RepoError> {
        let mut conn = self.get_conn().await?;

        let block_ref = chainsync_blocks::table
            .filter(chainsync_blocks::chain_id.eq(chain_id.as_str()))
            .filter(chainsync_blocks::number.eq(number as i64))
            .select((chainsync_blocks::hash, chainsync_blocks::parent_hash))
            .first::<(String, String)>(&mut conn)
            .await
            .optional()?;

        Ok(block_ref.map(|(hash, parent_hash)| BlockRef {
            number,
            hash,
            parent_hash,
        }))
    }

    async fn get_block_ref_by_hash(
        &self,
        chain_id: &ChainId,
        hash: &str,
    ) -> Result<Option<BlockRef>, RepoError> {
        let mut conn = self.get_conn().await?;

        let block_ref = chainsync_blocks::table
            .filter(chainsync_blocks::chain_id.eq(chain_id.as_str()))
            .filter(chainsync_blocks::hash.eq(hash))
            .select((chainsync_blocks::number, chainsync_blocks::parent_hash))
            .first::<(i64, String)>(&mut conn)
            .await
            .optional()?;

        Ok(block_ref.map(|(number, parent_hash)| BlockRef {
            number: number as u64,
            hash: hash.to_string(),
            parent_hash,
        }))
    }

    async fn get_transaction_refs(
        &self,
        chain_id: &ChainId,
        hashes: &[String],
    ) -> Result<Vec<TransactionRef>, RepoError> {
        let mut conn = self.get_conn().await?;

        let transaction_refs = chainsync_transactions::table
            .filter(chainsync_transactions::chain_id.eq(chain_id.as_str()))
            .filter(chainsync_transactions::hash.eq_any(hashes))
            .select((
                chainsync_transactions::hash,
                chainsync_transactions::block_hash,
                chainsync_transactions::block_number,
            ))
            .load::<(String, Option<String>, Option<i64>)>(&mut conn)
            .await?;

        Ok(transaction_refs
            .into_iter()
            .filter_map(|(hash, block_hash, block_number)| {
                Some(TransactionRef {
                    hash,
                    block_hash: block_hash?,
                    block_number: block_number? as u64,
                })
            })
            .collect())
    }

    async fn get_blocks(
        &self,
        chain_id: &ChainId,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Block>, RepoError> {
        let mut conn = self.get_conn().await?;

        let from = from as i64;
        let to = to.map(|to| to as i64).unwrap_or(i64::MAX);

        let block_rows: Vec<BlockRow> = chainsync_blocks::table
            .filter(chainsync_blocks::chain_id.eq(chain_id.as_str()))
            .filter(chainsync_blocks::number.between(from, to))
            .order(chainsync_blocks::number.asc())
            .select(BlockRow::as_select())
            .load(&mut conn)
            .await?;

        let mut transactions_by_block = Self::get_transactions(&mut conn, chain_id, from, to).await?;

        Ok(block_rows
            .into_iter()
            .map(|block_row| {
                let transactions =
                    transactions_by_block.remove(&block_row.number).unwrap_or_default();
                block_row.into_block(transactions)
            })
            .collect())
    }

    async fn create_block(&self, block: &Block, outbox: &[StreamEvent]) -> Result<bool, RepoError> {
        let mut conn = self.get_conn().await?;

        let block_row = NewBlockRow::from(block);
        let transaction_rows = block
            .transactions
            .iter()
            .map(|tx| NewTransactionRow::new(&block.chain_id, tx))
            .collect::<Result<Vec<_>, _>>()?;
        let event_rows =
            block.events().map(|e| NewEventRow::new(&block.chain_id, e)).collect::<Result<Vec<_>, _>>()?;
        let outbox_rows = NewOutboxRow::many(outbox)?;

        conn.transaction::<bool, RepoError, _>(|conn| {
            async move {
                let inserted = diesel::insert_into(chainsync_blocks::table)
                    .values(&block_row)
                    .on_conflict((chainsync_blocks::chain_id, chainsync_blocks::hash))
                    .do_nothing()
                    .execute(conn)
                    .await?;

                if inserted == 0 {
                    return Ok(false);
                }

                if !transaction_rows.is_empty() {
                    diesel::insert_into(chainsync_transactions::table)
                        .values(&transaction_rows)
                        .on_conflict((chainsync_transactions::chain_id, chainsync_transactions::hash))
                        .do_nothing()
                        .execute(conn)
                        .await?;
                }

                if !event_rows.is_empty() {
                    diesel::insert_into(chainsync_events::table)
                        .values(&event_rows)
                        .on_conflict((
                            chainsync_events::chain_id,
                            chainsync_events::transaction_hash,
                            chainsync_events::log_index,
                        ))
                        .do_nothing()
                        .execute(conn)
                        .await?;
                }

                if !outbox_rows.is_empty() {
                    diesel::insert_into(chainsync_outbox::table)
                        .values(&outbox_rows)
                        .execute(conn)
                        .await?;
                }

                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }

    async fn delete_blocks_from(
        &self,
        reorged_block: &UnsavedReorgedBlock,
        retractions: &[StreamEvent],
    ) -> Result<(), RepoError> {
        let mut conn = self.get_conn().await?;

        let chain_id = reorged_block.chain_id.as_str();
        let fork_point = reorged_block.fork_point as i64;
        let reorged_block_row = NewReorgedBlockRow::new(reorged_block, Utc::now().timestamp());
        let outbox_rows = NewOutboxRow::many(retractions)?;

        conn.transaction::<(), RepoError, _>(|conn| {
            async move {
                diesel::delete(chainsync_events::table)
                    .filter(chainsync_events::chain_id.eq(chain_id))
                    .filter(chainsync_events::block_number.ge(fork_point))
                    .execute(conn)
                    .await?;

                diesel::delete(chainsync_transactions::table)
                    .filter(chainsync_transactions::chain_id.eq(chain_id))
                    .filter(chainsync_transactions::block_number.ge(fork_point))
                    .execute(conn)
                    .await?;

                diesel::delete(chainsync_blocks::table)
                    .filter(chainsync_blocks::chain_id.eq(chain_id))
                    .filter(chainsync_blocks::number.ge(fork_point))
                    .execute(conn)
                    .await?;

                diesel::insert_into(chainsync_reorged_blocks::table)
                    .values(&reorged_block_row)
                    .execute(conn)
                    .await?;

                if !outbox_rows.is_empty() {
                    diesel::insert_into(chainsync_outbox::table)
                        .values(&outbox_rows)
                        .execute(conn)
                        .await?;
                }

                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn get_reorged_blocks(&self, chain_id: &ChainId) -> Result<Vec<ReorgedBlock>, RepoError> {
        let client = self.get_raw_query_client().await?;
        let query = "SELECT * FROM chainsync_reorged_blocks WHERE chain_id = $1 ORDER BY id";

        Self::load_data_list_from_raw_query(&client, query, &[&chain_id.as_str()]).await
    }

    async fn load_sync_status(&self, chain_id: &ChainId) -> Result<Option<SyncStatus>, RepoError> {
        let mut conn = self.get_conn().await?;

        let row = chainsync_sync_statuses::table
            .filter(chainsync_sync_statuses::chain_id.eq(chain_id.as_str()))
            .select(SyncStatusRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(SyncStatus::try_from).transpose()
    }

    async fn load_sync_statuses(&self) -> Result<Vec<SyncStatus>, RepoError> {
        let mut conn = self.get_conn().await?;

        let rows: Vec<SyncStatusRow> = chainsync_sync_statuses::table
            .order(chainsync_sync_statuses::chain_id.asc())
            .select(SyncStatusRow::as_select())
            .load(&mut conn)
            .await?;

        rows.into_iter().map(SyncStatus::try_from).collect()
    }

    async fn save_sync_status(
        &self,
        sync_status: &SyncStatus,
        write: SyncStatusWrite,
    ) -> Result<(), RepoError> {
        let mut conn = self.get_conn().await?;
        let row = SyncStatusRow::from(sync_status);

        conn.transaction::<(), RepoError, _>(|conn| {
            async move {
                let current = chainsync_sync_statuses::table
                    .filter(chainsync_sync_statuses::chain_id.eq(&row.chain_id))
                    .select(SyncStatusRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .map(SyncStatus::try_from)
                    .transpose()?;

                verify_sync_status_write(current.as_ref(), sync_status, write)?;

                diesel::insert_into(chainsync_sync_statuses::table)
                    .values(&row)
                    .on_conflict(chainsync_sync_statuses::chain_id)
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn load_unpublished(
        &self,
        chain_id: &ChainId,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, RepoError> {
        let mut conn = self.get_conn().await?;

        let rows = chainsync_outbox::table
            .filter(chainsync_outbox::chain_id.eq(chain_id.as_str()))
            .filter(chainsync_outbox::published_at.is_null())
            .order(chainsync_outbox::id.asc())
            .limit(limit as i64)
            .select((chainsync_outbox::id, chainsync_outbox::event))
            .load::<(i64, serde_json::Value)>(&mut conn)
            .await?;

        rows.into_iter()
            .map(|(id, event)| -> Result<OutboxEntry, RepoError> {
                Ok(OutboxEntry {
                    id,
                    event: from_json(event)?,
                })
            })
            .collect()
    }

    async fn mark_published(&self, chain_id: &ChainId, ids: &[i64]) -> Result<(), RepoError> {
        let mut conn = self.get_conn().await?;

        diesel::update(chainsync_outbox::table)
            .filter(chainsync_outbox::chain_id.eq(chain_id.as_str()))
            .filter(chainsync_outbox::id.eq_any(ids))
            .set(chainsync_outbox::published_at.eq(Some(Utc::now())))
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use diesel_async::pooled_connection::PoolError;

    use super::*;

    #[test]
    fn pool_failures_mean_the_repo_is_not_connected() {
        let timed_out = RepoError::from(bb8::RunError::<PoolError>::TimedOut);
        assert!(matches!(timed_out, RepoError::NotConnected(_)));

        let refused = RepoError::from(bb8::RunError::User(PoolError::ConnectionError(
            diesel::ConnectionError::BadConnection("connection refused".to_string()),
        )));
        assert!(matches!(refused, RepoError::NotConnected(message) if message.contains("connection refused")));
    }
}
