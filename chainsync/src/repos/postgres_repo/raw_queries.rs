use serde::de::DeserializeOwned;
use tokio_postgres::{types::ToSql, Client, NoTls};
use tracing::error;

use crate::repos::RepoError;

use super::PostgresRepo;

pub type PostgresRepoRawQueryClient = Client;

impl PostgresRepo {
    pub async fn get_raw_query_client(&self) -> Result<PostgresRepoRawQueryClient, RepoError> {
        let (client, conn) = tokio_postgres::connect(&self.url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                error!(error = %e, "raw query connection failed");
            }
        });

        Ok(client)
    }

    pub async fn load_data_list_from_raw_query<Data: DeserializeOwned>(
        client: &PostgresRepoRawQueryClient,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Data>, RepoError> {
        let rows = client.query(json_aggregate_query(query).as_str(), params).await?;
        let json_aggregate: serde_json::Value = match rows.first() {
            Some(row) => row.try_get(0)?,
            None => return Ok(vec![]),
        };

        if json_aggregate.is_array() {
            serde_json::from_value(json_aggregate).map_err(|e| RepoError::Unknown(e.to_string()))
        } else {
            Ok(vec![])
        }
    }
}

fn json_aggregate_query(query: &str) -> String {
    format!("WITH result AS ({query}) SELECT COALESCE(json_agg(result), '[]'::json) FROM result")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_queries_in_a_json_aggregate() {
        assert_eq!(
            json_aggregate_query("SELECT * FROM chainsync_reorged_blocks"),
            "WITH result AS (SELECT * FROM chainsync_reorged_blocks) SELECT COALESCE(json_agg(result), '[]'::json) FROM result"
        );
    }
}
