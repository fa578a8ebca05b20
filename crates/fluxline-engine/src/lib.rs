//! Fluxline Engine
//!
//! Lifecycle services over the engine store:
//!
//! - [`registry`]: pipeline definitions, append-only config versions, and
//!   the pipeline state machine
//! - [`orchestrator`]: execution attempts with the single-active-run guard
//! - [`datasets`]: dataset registry and monotonically versioned snapshots
//! - [`lineage`]: upstream-contributor edges per dataset version
//! - [`scheduler`]: due-run selection for scheduled pipelines
//! - [`compute`]: seams to the external Compute Engine
//!
//! All services are plain functions over a `rusqlite::Connection`; callers
//! own connection acquisition (see `fluxline-storage`) and never hold a
//! connection across await points.

pub mod compute;
pub mod datasets;
pub mod lineage;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;

pub use fluxline_core::{
    Dataset, DatasetVersion, DatasetVersionState, EngineError, ExecutionMetrics, ExecutionMode,
    ExecutionState, LineageKind, Pipeline, PipelineExecution, PipelineState, PipelineStep,
    PipelineVersion, QualityMetrics, Result, StepType, TriggerType, Visibility,
};

/// Wrap a parse/conversion failure so it can flow out of a rusqlite row
/// mapping closure.
pub(crate) fn column_parse_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

/// Parse a JSON TEXT column inside a row mapping closure.
pub(crate) fn json_column(idx: usize, raw: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw).map_err(|e| column_parse_error(idx, e))
}
