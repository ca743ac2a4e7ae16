use crate::repos::{Migratable, RepoError, RepoMigrations, SQLikeMigrations};

use super::{PostgresRepo, PostgresRepoRawQueryClient};

impl RepoMigrations for PostgresRepo {
    fn create_blocks_migration() -> &'static [&'static str] {
        SQLikeMigrations::create_blocks()
    }

    fn create_transactions_migration() -> &'static [&'static str] {
        SQLikeMigrations::create_transactions()
    }

    fn create_events_migration() -> &'static [&'static str] {
        SQLikeMigrations::create_events()
    }

    fn create_sync_statuses_migration() -> &'static [&'static str] {
        SQLikeMigrations::create_sync_statuses()
    }

    fn create_outbox_migration() -> &'static [&'static str] {
        SQLikeMigrations::create_outbox()
    }

    fn create_reorged_blocks_migration() -> &'static [&'static str] {
        SQLikeMigrations::create_reorged_blocks()
    }
}

#[async_trait::async_trait]
impl Migratable for PostgresRepo {
    type RawQueryClient = PostgresRepoRawQueryClient;

    async fn execute_raw_query(client: &Self::RawQueryClient, query: &str) -> Result<(), RepoError> {
        client.batch_execute(query).await?;

        Ok(())
    }
}
