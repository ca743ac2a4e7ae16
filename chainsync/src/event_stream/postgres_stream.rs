use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diesels::schema::chainsync_stream_log;
use crate::repos::{Migratable, PostgresRepo, RepoError, SQLikeMigrations};
use crate::ChainId;

use super::{EventStream, StreamError, StreamEvent, StreamEventKind, Topic};

impl From<RepoError> for StreamError {
    fn from(error: RepoError) -> Self {
        StreamError::Unavailable(error.to_string())
    }
}

#[derive(Insertable)]
#[diesel(table_name = chainsync_stream_log)]
struct NewStreamLogRow<'a> {
    event_id: Uuid,
    topic: String,
    chain_id: &'a str,
    key: &'a str,
    kind: String,
    payload: &'a serde_json::Value,
    created_at: i64,
}

/// Published event read back from the log, with its offset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLogEntry {
    pub id: i64,
    pub event_id: Uuid,
    pub topic: Topic,
    pub chain_id: ChainId,
    pub key: String,
    pub kind: StreamEventKind,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// Durable stream kept as an append-only Postgres table.
/// Consumers track their own offset per topic. Redelivered events are dropped.
#[derive(Clone, Debug)]
pub struct PostgresStream {
    repo: PostgresRepo,
}

impl PostgresStream {
    pub async fn new(repo: PostgresRepo) -> Result<Self, StreamError> {
        let client = repo.get_raw_query_client().await?;
        PostgresRepo::run_migrations(&client, SQLikeMigrations::create_stream_log().to_vec()).await?;

        Ok(Self { repo })
    }

    /// Entries of a topic after `offset`, oldest first.
    pub async fn read(
        &self,
        topic: Topic,
        offset: i64,
        limit: u32,
    ) -> Result<Vec<StreamLogEntry>, StreamError> {
        let client = self.repo.get_raw_query_client().await?;
        let query = "SELECT * FROM chainsync_stream_log
            WHERE topic = $1 AND id > $2
            ORDER BY id
            LIMIT $3";

        let entries = PostgresRepo::load_data_list_from_raw_query(
            &client,
            query,
            &[&topic.to_string(), &offset, &(limit as i64)],
        )
        .await?;

        Ok(entries)
    }
}

#[async_trait::async_trait]
impl EventStream for PostgresStream {
    async fn publish(&self, event: &StreamEvent) -> Result<(), StreamError> {
        let mut conn = self.repo.get_conn().await?;

        diesel::insert_into(chainsync_stream_log::table)
            .values(NewStreamLogRow {
                event_id: event.id,
                topic: event.topic.to_string(),
                chain_id: event.chain_id.as_str(),
                key: &event.key,
                kind: event.kind.to_string(),
                payload: &event.payload,
                created_at: event.created_at,
            })
            .on_conflict(chainsync_stream_log::event_id)
            .do_nothing()
            .execute(&mut conn)
            .await
            .map_err(|e| StreamError::Unavailable(e.to_string()))?;

        Ok(())
    }
}
