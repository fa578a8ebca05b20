//! Fluxline Engine Core
//!
//! Core types, error taxonomy, and SQLite schema for the Fluxline lifecycle
//! engine: versioned pipelines, tracked executions, monotonically versioned
//! datasets, and lineage edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod fingerprint;
pub mod migrations;
pub mod validation;

/// How a pipeline gets executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Runs only when a user triggers it
    Manual,
    /// Runs on a cron schedule
    Scheduled,
    /// Runs when requested through the API
    OnDemand,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Manual => "manual",
            ExecutionMode::Scheduled => "scheduled",
            ExecutionMode::OnDemand => "on_demand",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ExecutionMode::Manual),
            "scheduled" => Ok(ExecutionMode::Scheduled),
            "on_demand" => Ok(ExecutionMode::OnDemand),
            _ => Err(EngineError::Validation(format!(
                "Unknown execution mode: {}",
                s
            ))),
        }
    }
}

/// Lifecycle state of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Draft,
    Validating,
    Ready,
    Running,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Draft => "draft",
            PipelineState::Validating => "validating",
            PipelineState::Ready => "ready",
            PipelineState::Running => "running",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        }
    }

    /// States from which a new execution may be triggered.
    pub fn is_triggerable(&self) -> bool {
        matches!(
            self,
            PipelineState::Ready | PipelineState::Completed | PipelineState::Failed
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PipelineState {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PipelineState::Draft),
            "validating" => Ok(PipelineState::Validating),
            "ready" => Ok(PipelineState::Ready),
            "running" => Ok(PipelineState::Running),
            "completed" => Ok(PipelineState::Completed),
            "failed" => Ok(PipelineState::Failed),
            _ => Err(EngineError::Validation(format!(
                "Unknown pipeline state: {}",
                s
            ))),
        }
    }
}

/// State of one execution attempt.
///
/// `queued` and `running` are non-terminal; `completed`, `failed`, and
/// `cancelled` are terminal and the row is immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Queued => "queued",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ExecutionState::Queued),
            "running" => Ok(ExecutionState::Running),
            "completed" => Ok(ExecutionState::Completed),
            "failed" => Ok(ExecutionState::Failed),
            "cancelled" => Ok(ExecutionState::Cancelled),
            _ => Err(EngineError::Validation(format!(
                "Unknown execution state: {}",
                s
            ))),
        }
    }
}

/// What caused an execution to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Api,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Api => "api",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "scheduled" => Ok(TriggerType::Scheduled),
            "api" => Ok(TriggerType::Api),
            _ => Err(EngineError::Validation(format!(
                "Unknown trigger type: {}",
                s
            ))),
        }
    }
}

/// State of a dataset version snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetVersionState {
    Creating,
    Ready,
    Failed,
}

impl DatasetVersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetVersionState::Creating => "creating",
            DatasetVersionState::Ready => "ready",
            DatasetVersionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DatasetVersionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatasetVersionState {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "creating" => Ok(DatasetVersionState::Creating),
            "ready" => Ok(DatasetVersionState::Ready),
            "failed" => Ok(DatasetVersionState::Failed),
            _ => Err(EngineError::Validation(format!(
                "Unknown dataset version state: {}",
                s
            ))),
        }
    }
}

/// Who may see a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Project,
    Workspace,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Project => "project",
            Visibility::Workspace => "workspace",
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "private" => Ok(Visibility::Private),
            "project" => Ok(Visibility::Project),
            "workspace" => Ok(Visibility::Workspace),
            _ => Err(EngineError::Validation(format!(
                "Unknown visibility: {}",
                s
            ))),
        }
    }
}

/// Kind of transform step inside a pipeline version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    FilterRows,
    SelectColumns,
    RenameColumn,
    CastType,
    DropNulls,
    FillNulls,
    DropDuplicates,
    Join,
    Aggregate,
    CustomSql,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::FilterRows => "filter_rows",
            StepType::SelectColumns => "select_columns",
            StepType::RenameColumn => "rename_column",
            StepType::CastType => "cast_type",
            StepType::DropNulls => "drop_nulls",
            StepType::FillNulls => "fill_nulls",
            StepType::DropDuplicates => "drop_duplicates",
            StepType::Join => "join",
            StepType::Aggregate => "aggregate",
            StepType::CustomSql => "custom_sql",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "filter_rows" => Ok(StepType::FilterRows),
            "select_columns" => Ok(StepType::SelectColumns),
            "rename_column" => Ok(StepType::RenameColumn),
            "cast_type" => Ok(StepType::CastType),
            "drop_nulls" => Ok(StepType::DropNulls),
            "fill_nulls" => Ok(StepType::FillNulls),
            "drop_duplicates" => Ok(StepType::DropDuplicates),
            "join" => Ok(StepType::Join),
            "aggregate" => Ok(StepType::Aggregate),
            "custom_sql" => Ok(StepType::CustomSql),
            _ => Err(EngineError::Validation(format!("Unknown step type: {}", s))),
        }
    }
}

/// Kind of upstream contributor recorded in a lineage edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageKind {
    /// A raw external data source
    Source,
    /// A pipeline run produced the version
    Pipeline,
    /// Another dataset version was read
    Dataset,
}

impl LineageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineageKind::Source => "source",
            LineageKind::Pipeline => "pipeline",
            LineageKind::Dataset => "dataset",
        }
    }
}

impl std::fmt::Display for LineageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LineageKind {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "source" => Ok(LineageKind::Source),
            "pipeline" => Ok(LineageKind::Pipeline),
            "dataset" => Ok(LineageKind::Dataset),
            _ => Err(EngineError::Validation(format!(
                "Unknown lineage kind: {}",
                s
            ))),
        }
    }
}

// ============================================================================
// Entity Records
// ============================================================================

/// A versioned pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Opaque id (UUID string)
    pub id: String,
    pub name: String,
    pub description: String,
    /// Owning project reference
    pub project_id: String,
    /// Source the pipeline reads from
    pub data_source_id: String,
    /// Name of the dataset the pipeline materializes
    pub target_dataset_name: String,
    pub execution_mode: ExecutionMode,
    /// Cron expression; required when mode is `scheduled`
    pub schedule_expression: String,
    /// Current config (snapshotted into a version on every change)
    pub config: serde_json::Value,
    pub state: PipelineState,
    /// Points at the latest PipelineVersion; 0 before any version exists
    pub current_version: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: String,
    pub next_scheduled_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Immutable snapshot of a pipeline's config at one version number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineVersion {
    pub id: i64,
    pub pipeline_id: String,
    /// Starts at 1, strictly increasing per pipeline
    pub version_number: i64,
    pub config_snapshot: serde_json::Value,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub change_description: String,
}

/// One ordered transform operation within a pipeline version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: i64,
    pub pipeline_version_id: i64,
    /// Unique within the version
    pub step_order: i64,
    pub step_type: StepType,
    pub step_config: serde_json::Value,
    /// Disabled steps are retained but skipped at execution time
    pub is_enabled: bool,
}

/// Result metrics reported by the Compute Engine on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub rows_processed: Option<i64>,
    pub rows_failed: i64,
    pub bytes_processed: Option<i64>,
    pub peak_memory_mb: Option<i64>,
    pub peak_cpu_percent: Option<i64>,
}

/// One timed attempt to run a pipeline version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Opaque id (UUID string)
    pub id: String,
    pub pipeline_id: String,
    /// Version the run was bound to at trigger time
    pub pipeline_version_id: Option<i64>,
    pub state: ExecutionState,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metrics: ExecutionMetrics,
    pub execution_log: String,
    pub error_message: String,
    pub error_detail: String,
    /// Dataset version this run produced, once completed
    pub created_dataset_version_id: Option<String>,
}

impl PipelineExecution {
    /// Wall-clock duration, derived rather than stored.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// Logical dataset container; owns a monotonic version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Opaque id (UUID string)
    pub id: String,
    pub name: String,
    pub description: String,
    pub project_id: String,
    pub visibility: Visibility,
    pub tags: Vec<String>,
    /// Points at the promoted version; 0 until one is promoted
    pub current_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Quality metrics supplied by the Compute Engine when a version is finalized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Score 0-100 based on nulls, duplicates, outliers
    pub quality_score: Option<f64>,
    pub null_percentage: f64,
    pub duplicate_count: i64,
    pub outlier_count: i64,
    /// Per-column statistics, e.g. {"age": {"min": 18, "max": 65, ...}}
    pub column_profiles: serde_json::Value,
}

/// Immutable versioned snapshot of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetVersion {
    /// Opaque id (UUID string)
    pub id: String,
    pub dataset_id: String,
    /// Starts at 1, strictly increasing per dataset
    pub version_number: i64,
    pub state: DatasetVersionState,
    /// Schema definition, e.g. {"columns": [{"name": "id", "type": "INTEGER", ...}]}
    pub schema: serde_json::Value,
    /// SHA-256 of the canonicalized schema; bound at creation time
    pub schema_fingerprint: String,
    pub row_count: i64,
    pub column_count: i64,
    pub storage_size_bytes: i64,
    /// Compute Engine storage reference for this version's table
    pub storage_table_name: String,
    #[serde(flatten)]
    pub quality: QualityMetrics,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    /// Pipeline that produced this version, when applicable
    pub created_by_pipeline_id: Option<String>,
    pub change_description: String,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors produced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// True when a rusqlite error is a uniqueness-constraint violation.
///
/// Version slots and the single-active-execution guard are enforced by
/// unique indexes; callers map violations to `Conflict` and may retry after
/// reload.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Map an insert/update error, turning constraint violations into `Conflict`.
pub fn conflict_on_constraint(err: rusqlite::Error, what: &str) -> EngineError {
    if is_unique_violation(&err) {
        EngineError::Conflict(what.to_string())
    } else {
        EngineError::Sqlite(err)
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Initialize the SQLite schema for the engine.
///
/// Creates all tables if they don't exist:
/// - `engine_meta`: version counter for optimistic concurrency
/// - `pipelines`: pipeline definitions with lifecycle state
/// - `pipeline_versions`: append-only config snapshots
/// - `pipeline_steps`: ordered transform steps per version
/// - `pipeline_executions`: run attempts with the execution state machine
/// - `datasets`: dataset registry
/// - `dataset_versions`: append-only dataset snapshots
/// - `dataset_lineage`: upstream-contributor edges per dataset version
pub fn init_engine_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    -- Version control for optimistic concurrency
    CREATE TABLE IF NOT EXISTS engine_meta (
      id INTEGER PRIMARY KEY CHECK (id = 1),
      version INTEGER NOT NULL DEFAULT 1,
      last_modified TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    INSERT OR IGNORE INTO engine_meta (id, version, last_modified)
    VALUES (1, 1, datetime('now'));

    -- Pipeline definitions
    CREATE TABLE IF NOT EXISTS pipelines (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      description TEXT NOT NULL DEFAULT '',
      project_id TEXT NOT NULL,
      data_source_id TEXT NOT NULL,
      target_dataset_name TEXT NOT NULL,
      execution_mode TEXT NOT NULL DEFAULT 'manual',
      schedule_expression TEXT NOT NULL DEFAULT '',
      config TEXT NOT NULL DEFAULT '{}',
      state TEXT NOT NULL DEFAULT 'draft',
      current_version INTEGER NOT NULL DEFAULT 0,
      last_run_at TEXT,
      last_run_status TEXT NOT NULL DEFAULT '',
      next_scheduled_run TEXT,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      created_by TEXT,
      is_deleted INTEGER NOT NULL DEFAULT 0,
      deleted_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_pipelines_project ON pipelines(project_id);
    CREATE INDEX IF NOT EXISTS idx_pipelines_state ON pipelines(state);
    CREATE INDEX IF NOT EXISTS idx_pipelines_mode ON pipelines(execution_mode);
    CREATE INDEX IF NOT EXISTS idx_pipelines_next_run ON pipelines(next_scheduled_run);

    -- Append-only config snapshots
    CREATE TABLE IF NOT EXISTS pipeline_versions (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      pipeline_id TEXT NOT NULL,
      version_number INTEGER NOT NULL,
      config_snapshot TEXT NOT NULL,
      created_by TEXT,
      created_at TEXT NOT NULL,
      change_description TEXT NOT NULL DEFAULT '',
      FOREIGN KEY (pipeline_id) REFERENCES pipelines(id) ON DELETE CASCADE,
      UNIQUE (pipeline_id, version_number)
    );

    CREATE INDEX IF NOT EXISTS idx_pipeline_versions_pipeline
      ON pipeline_versions(pipeline_id, version_number);

    -- Ordered transform steps within a version
    CREATE TABLE IF NOT EXISTS pipeline_steps (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      pipeline_version_id INTEGER NOT NULL,
      step_order INTEGER NOT NULL,
      step_type TEXT NOT NULL,
      step_config TEXT NOT NULL DEFAULT '{}',
      is_enabled INTEGER NOT NULL DEFAULT 1,
      FOREIGN KEY (pipeline_version_id) REFERENCES pipeline_versions(id) ON DELETE CASCADE,
      UNIQUE (pipeline_version_id, step_order)
    );

    -- Execution state machine rows
    CREATE TABLE IF NOT EXISTS pipeline_executions (
      id TEXT PRIMARY KEY,
      pipeline_id TEXT NOT NULL,
      pipeline_version_id INTEGER,
      state TEXT NOT NULL DEFAULT 'queued',
      trigger_type TEXT NOT NULL,
      triggered_by TEXT,
      queued_at TEXT NOT NULL,
      started_at TEXT,
      completed_at TEXT,
      rows_processed INTEGER,
      rows_failed INTEGER NOT NULL DEFAULT 0,
      bytes_processed INTEGER,
      peak_memory_mb INTEGER,
      peak_cpu_percent INTEGER,
      execution_log TEXT NOT NULL DEFAULT '',
      error_message TEXT NOT NULL DEFAULT '',
      error_detail TEXT NOT NULL DEFAULT '',
      created_dataset_version_id TEXT,
      FOREIGN KEY (pipeline_id) REFERENCES pipelines(id) ON DELETE CASCADE
    );

    -- At most one non-terminal execution per pipeline
    CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_active
      ON pipeline_executions(pipeline_id) WHERE state IN ('queued', 'running');

    CREATE INDEX IF NOT EXISTS idx_executions_pipeline
      ON pipeline_executions(pipeline_id, queued_at);
    CREATE INDEX IF NOT EXISTS idx_executions_state ON pipeline_executions(state);

    -- Dataset registry
    CREATE TABLE IF NOT EXISTS datasets (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      description TEXT NOT NULL DEFAULT '',
      project_id TEXT NOT NULL,
      visibility TEXT NOT NULL DEFAULT 'private',
      tags TEXT NOT NULL DEFAULT '[]',
      current_version INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      created_by TEXT,
      is_deleted INTEGER NOT NULL DEFAULT 0,
      deleted_at TEXT
    );

    -- (project, name) unique among non-deleted datasets
    CREATE UNIQUE INDEX IF NOT EXISTS idx_datasets_project_name
      ON datasets(project_id, name) WHERE is_deleted = 0;

    CREATE INDEX IF NOT EXISTS idx_datasets_visibility ON datasets(visibility);

    -- Append-only dataset snapshots
    CREATE TABLE IF NOT EXISTS dataset_versions (
      id TEXT PRIMARY KEY,
      dataset_id TEXT NOT NULL,
      version_number INTEGER NOT NULL,
      state TEXT NOT NULL DEFAULT 'creating',
      schema TEXT NOT NULL,
      schema_fingerprint TEXT NOT NULL DEFAULT '',
      row_count INTEGER NOT NULL DEFAULT 0,
      column_count INTEGER NOT NULL DEFAULT 0,
      storage_size_bytes INTEGER NOT NULL DEFAULT 0,
      storage_table_name TEXT NOT NULL DEFAULT '',
      quality_score REAL,
      null_percentage REAL NOT NULL DEFAULT 0.0,
      duplicate_count INTEGER NOT NULL DEFAULT 0,
      outlier_count INTEGER NOT NULL DEFAULT 0,
      column_profiles TEXT NOT NULL DEFAULT '{}',
      created_at TEXT NOT NULL,
      created_by TEXT,
      created_by_pipeline_id TEXT,
      change_description TEXT NOT NULL DEFAULT '',
      FOREIGN KEY (dataset_id) REFERENCES datasets(id) ON DELETE CASCADE,
      UNIQUE (dataset_id, version_number)
    );

    CREATE INDEX IF NOT EXISTS idx_dataset_versions_dataset
      ON dataset_versions(dataset_id, version_number);
    CREATE INDEX IF NOT EXISTS idx_dataset_versions_state ON dataset_versions(state);

    -- Lineage edges: exactly one populated source reference per row
    CREATE TABLE IF NOT EXISTS dataset_lineage (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      dataset_version_id TEXT NOT NULL,
      source_type TEXT NOT NULL,
      source_data_source_id TEXT,
      source_pipeline_id TEXT,
      source_dataset_version_id TEXT,
      transformation_details TEXT NOT NULL DEFAULT '{}',
      created_at TEXT NOT NULL,
      FOREIGN KEY (dataset_version_id) REFERENCES dataset_versions(id) ON DELETE CASCADE,
      CHECK (
        (source_type = 'source' AND source_data_source_id IS NOT NULL
          AND source_pipeline_id IS NULL AND source_dataset_version_id IS NULL)
        OR (source_type = 'pipeline' AND source_pipeline_id IS NOT NULL
          AND source_data_source_id IS NULL AND source_dataset_version_id IS NULL)
        OR (source_type = 'dataset' AND source_dataset_version_id IS NOT NULL
          AND source_data_source_id IS NULL AND source_pipeline_id IS NULL)
      )
    );

    CREATE INDEX IF NOT EXISTS idx_lineage_version ON dataset_lineage(dataset_version_id);
    CREATE INDEX IF NOT EXISTS idx_lineage_source_pipeline ON dataset_lineage(source_pipeline_id);
    CREATE INDEX IF NOT EXISTS idx_lineage_source_version
      ON dataset_lineage(source_dataset_version_id);
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}

/// Initialize the engine store: base schema + migrations.
///
/// Idempotent; safe to call multiple times. Returns the number of
/// migrations applied (0 when already up to date).
pub fn init_engine(conn: &rusqlite::Connection, run_migrations_flag: bool) -> Result<usize> {
    init_engine_schema(conn)?;

    if run_migrations_flag {
        migrations::run_migrations(conn)
    } else {
        Ok(0)
    }
}

/// Get the current engine version for optimistic concurrency control.
pub fn get_engine_version(conn: &rusqlite::Connection) -> Result<i64> {
    let version: i64 =
        conn.query_row("SELECT version FROM engine_meta WHERE id = 1", [], |row| {
            row.get(0)
        })?;
    Ok(version)
}

/// Increment the engine version (call after a successful write batch).
pub fn increment_engine_version(conn: &rusqlite::Connection) -> Result<i64> {
    conn.execute(
        "UPDATE engine_meta SET version = version + 1, last_modified = datetime('now') WHERE id = 1",
        [],
    )?;
    get_engine_version(conn)
}

/// Conditionally advance the engine version (optimistic-locking validation).
pub fn set_engine_version(
    conn: &rusqlite::Connection,
    expected_version: i64,
    new_version: i64,
) -> Result<bool> {
    let rows_affected = conn.execute(
        "UPDATE engine_meta SET version = ?2, last_modified = datetime('now') WHERE id = 1 AND version = ?1",
        [expected_version, new_version],
    )?;
    Ok(rows_affected > 0)
}
