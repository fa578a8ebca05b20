//! Seams to the external Compute Engine.
//!
//! The engine never executes transforms or queries itself; it records
//! lifecycle facts while the Compute Engine does the data work. These traits
//! are the boundary: orchestration code talks to them, production wires in a
//! real client, tests wire in stubs. Run progress comes back through the
//! orchestrator's `record_start` / `record_completion` / `record_failure`.

use fluxline_core::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Advisory resource estimate for one pipeline run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub memory_mb: i64,
    pub cpu_percent: i64,
    pub duration_seconds: i64,
    pub row_count: i64,
}

/// Rows returned by a preview or proxied query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: i64,
    pub execution_time_ms: i64,
}

/// Client boundary to the Compute Engine.
///
/// Manual async (`Pin<Box<dyn Future>>`) rather than the async-trait crate,
/// matching the storage backend trait.
pub trait ComputeEngine: Send + Sync {
    /// Hand a queued execution to the Compute Engine. Fire-and-forget:
    /// returning Ok means the work was accepted, not finished.
    fn execute_pipeline(
        &self,
        pipeline_version_id: i64,
        execution_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Estimate the resources a pipeline version would need to run.
    fn estimate_resources(
        &self,
        pipeline_version_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<ResourceEstimate>> + Send + '_>>;

    /// Sample rows from a materialized dataset version table.
    fn preview_dataset(
        &self,
        storage_ref: &str,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<QueryOutput>> + Send + '_>>;

    /// Run a read-only query against a materialized dataset version table.
    fn run_query(
        &self,
        storage_ref: &str,
        sql: &str,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<QueryOutput>> + Send + '_>>;
}

/// Lookup for data-source credentials, resolved at execution time.
///
/// Blobs are opaque here; decryption happens on the Compute Engine side.
pub trait CredentialStore: Send + Sync {
    /// Fetch the connection secret for a data source, if one is registered.
    fn credential_for(
        &self,
        data_source_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;
}
