//! Per chain sync metrics, labelled by `chain_id`.
//!
//! Emitted through the `metrics` facade, so nothing is recorded until the
//! embedding application installs a recorder such as a Prometheus exporter.
use std::future::Future;
use std::time::Instant;

use crate::ChainId;

#[derive(Debug, Clone)]
pub struct Metrics;

impl Metrics {
    pub const BLOCKS_PROCESSED_TOTAL: &'static str = "chainsync_blocks_processed_total";
    pub const LAST_PROCESSED_BLOCK: &'static str = "chainsync_last_processed_block";
    pub const PROCESSING_ERRORS_TOTAL: &'static str = "chainsync_processing_errors_total";
    pub const RPC_REQUESTS_TOTAL: &'static str = "chainsync_rpc_requests_total";
    pub const RPC_REQUEST_DURATION_SECONDS: &'static str = "chainsync_rpc_request_duration_seconds";
    pub const DB_OPERATION_DURATION_SECONDS: &'static str = "chainsync_db_operation_duration_seconds";

    /// Describes every metric for recorders that export descriptions.
    pub fn describe() {
        metrics::describe_counter!(
            Self::BLOCKS_PROCESSED_TOTAL,
            metrics::Unit::Count,
            "Blocks persisted by a chain's sync loop",
        );

        metrics::describe_gauge!(
            Self::LAST_PROCESSED_BLOCK,
            metrics::Unit::Count,
            "Height of the last block a chain persisted",
        );

        metrics::describe_counter!(
            Self::PROCESSING_ERRORS_TOTAL,
            metrics::Unit::Count,
            "Failed sync steps, by error kind",
        );

        metrics::describe_counter!(
            Self::RPC_REQUESTS_TOTAL,
            metrics::Unit::Count,
            "Calls made to a chain's node, by method and status",
        );

        metrics::describe_histogram!(
            Self::RPC_REQUEST_DURATION_SECONDS,
            metrics::Unit::Seconds,
            "Latency of calls made to a chain's node",
        );

        metrics::describe_histogram!(
            Self::DB_OPERATION_DURATION_SECONDS,
            metrics::Unit::Seconds,
            "Latency of repo operations, by operation",
        );
    }

    pub fn record_block_processed(chain_id: &ChainId, height: u64) {
        metrics::counter!(Self::BLOCKS_PROCESSED_TOTAL, "chain_id" => chain_id.to_string()).increment(1);

        metrics::gauge!(Self::LAST_PROCESSED_BLOCK, "chain_id" => chain_id.to_string()).set(height as f64);
    }

    pub fn record_processing_error(chain_id: &ChainId, kind: &'static str) {
        metrics::counter!(
            Self::PROCESSING_ERRORS_TOTAL,
            "chain_id" => chain_id.to_string(),
            "kind" => kind,
        )
        .increment(1);
    }

    /// Counts and times a call to a chain's node.
    pub async fn observe_rpc<T, E>(
        chain_id: &ChainId,
        method: &'static str,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        let started_at = Instant::now();
        let result = call.await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            Self::RPC_REQUESTS_TOTAL,
            "chain_id" => chain_id.to_string(),
            "method" => method,
            "status" => status,
        )
        .increment(1);

        metrics::histogram!(
            Self::RPC_REQUEST_DURATION_SECONDS,
            "chain_id" => chain_id.to_string(),
            "method" => method,
        )
        .record(started_at.elapsed().as_secs_f64());

        result
    }

    /// Times a repo operation, failed attempts included.
    pub async fn observe_db<T, E>(
        chain_id: &ChainId,
        operation: &'static str,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        let started_at = Instant::now();
        let result = call.await;

        metrics::histogram!(
            Self::DB_OPERATION_DURATION_SECONDS,
            "chain_id" => chain_id.to_string(),
            "operation" => operation,
        )
        .record(started_at.elapsed().as_secs_f64());

        result
    }
}
