//! Pipeline Registry.
//!
//! Pipeline definitions with an append-only version history. Every config
//! change snapshots the full config into `pipeline_versions`; version
//! numbers start at 1 and allocation happens under the
//! `(pipeline_id, version_number)` unique constraint, so two writers racing
//! on the same pipeline cannot both claim a slot. Deletes are soft; the
//! version history outlives the definition.

use chrono::Utc;
use fluxline_core::fingerprint::canonical_string;
use fluxline_core::validation::{validate_identifier, validate_name, validate_schedule_expression};
use fluxline_core::{
    conflict_on_constraint, EngineError, ExecutionMode, Pipeline, PipelineState, PipelineStep,
    PipelineVersion, Result, StepType,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::compute::ResourceEstimate;
use crate::{column_parse_error, json_column};

/// Input for creating a pipeline.
#[derive(Debug, Clone)]
pub struct NewPipeline {
    pub name: String,
    pub description: String,
    pub project_id: String,
    pub data_source_id: String,
    pub target_dataset_name: String,
    pub execution_mode: ExecutionMode,
    pub schedule_expression: String,
    pub config: serde_json::Value,
    pub steps: Vec<NewStep>,
    pub created_by: Option<String>,
}

/// One transform step supplied with a config change.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub step_order: i64,
    pub step_type: StepType,
    pub step_config: serde_json::Value,
    pub is_enabled: bool,
}

const PIPELINE_COLUMNS: &str = "id, name, description, project_id, data_source_id, \
     target_dataset_name, execution_mode, schedule_expression, config, state, \
     current_version, last_run_at, last_run_status, next_scheduled_run, \
     created_at, updated_at, created_by, is_deleted, deleted_at";

pub(crate) fn pipeline_from_row(row: &Row) -> rusqlite::Result<Pipeline> {
    let mode: String = row.get(6)?;
    let state: String = row.get(9)?;
    Ok(Pipeline {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        project_id: row.get(3)?,
        data_source_id: row.get(4)?,
        target_dataset_name: row.get(5)?,
        execution_mode: mode.parse().map_err(|e| column_parse_error(6, e))?,
        schedule_expression: row.get(7)?,
        config: json_column(8, row.get(8)?)?,
        state: state.parse().map_err(|e| column_parse_error(9, e))?,
        current_version: row.get(10)?,
        last_run_at: row.get(11)?,
        last_run_status: row.get(12)?,
        next_scheduled_run: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        created_by: row.get(16)?,
        is_deleted: row.get(17)?,
        deleted_at: row.get(18)?,
    })
}

fn version_from_row(row: &Row) -> rusqlite::Result<PipelineVersion> {
    Ok(PipelineVersion {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        version_number: row.get(2)?,
        config_snapshot: json_column(3, row.get(3)?)?,
        created_by: row.get(4)?,
        created_at: row.get(5)?,
        change_description: row.get(6)?,
    })
}

fn step_from_row(row: &Row) -> rusqlite::Result<PipelineStep> {
    let step_type: String = row.get(3)?;
    Ok(PipelineStep {
        id: row.get(0)?,
        pipeline_version_id: row.get(1)?,
        step_order: row.get(2)?,
        step_type: step_type.parse().map_err(|e| column_parse_error(3, e))?,
        step_config: json_column(4, row.get(4)?)?,
        is_enabled: row.get(5)?,
    })
}

fn validate_new_pipeline(input: &NewPipeline) -> Result<()> {
    validate_name(&input.name, "Pipeline name")?;
    validate_identifier(&input.project_id, "project_id")?;
    validate_identifier(&input.data_source_id, "data_source_id")?;
    validate_name(&input.target_dataset_name, "Target dataset name")?;

    match input.execution_mode {
        ExecutionMode::Scheduled => validate_schedule_expression(&input.schedule_expression)?,
        _ => {
            if !input.schedule_expression.is_empty() {
                return Err(EngineError::Validation(
                    "Schedule expression is only valid for scheduled pipelines".to_string(),
                ));
            }
        }
    }

    validate_steps(&input.steps)
}

fn validate_steps(steps: &[NewStep]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for step in steps {
        if step.step_order < 0 {
            return Err(EngineError::Validation(format!(
                "Step order must be non-negative, got {}",
                step.step_order
            )));
        }
        if !seen.insert(step.step_order) {
            return Err(EngineError::Validation(format!(
                "Duplicate step order {}",
                step.step_order
            )));
        }
    }
    Ok(())
}

fn insert_steps(conn: &Connection, version_id: i64, steps: &[NewStep]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO pipeline_steps (pipeline_version_id, step_order, step_type, step_config, is_enabled)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for step in steps {
        stmt.execute(params![
            version_id,
            step.step_order,
            step.step_type.as_str(),
            step.step_config.to_string(),
            step.is_enabled,
        ])?;
    }
    Ok(())
}

/// Create a pipeline in `draft` state with config version 1.
///
/// The initial config is snapshotted immediately, so `current_version` is 1
/// from birth and the version history is never empty.
pub fn create_pipeline(conn: &Connection, input: &NewPipeline) -> Result<Pipeline> {
    validate_new_pipeline(input)?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();

    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO pipelines (id, name, description, project_id, data_source_id,
             target_dataset_name, execution_mode, schedule_expression, config, state,
             current_version, created_at, updated_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'draft', 1, ?10, ?10, ?11)",
        params![
            id,
            input.name,
            input.description,
            input.project_id,
            input.data_source_id,
            input.target_dataset_name,
            input.execution_mode.as_str(),
            input.schedule_expression,
            input.config.to_string(),
            now,
            input.created_by,
        ],
    )?;

    tx.execute(
        "INSERT INTO pipeline_versions (pipeline_id, version_number, config_snapshot,
             created_by, created_at, change_description)
         VALUES (?1, 1, ?2, ?3, ?4, 'Initial version')",
        params![id, input.config.to_string(), input.created_by, now],
    )?;

    let version_id = tx.last_insert_rowid();
    insert_steps(&tx, version_id, &input.steps)?;

    tx.commit()?;

    tracing::info!(pipeline_id = %id, name = %input.name, "Created pipeline");
    get_pipeline(conn, &id)
}

/// Fetch a pipeline. Soft-deleted pipelines are reported as not found.
pub fn get_pipeline(conn: &Connection, pipeline_id: &str) -> Result<Pipeline> {
    conn.query_row(
        &format!("SELECT {} FROM pipelines WHERE id = ?1 AND is_deleted = 0", PIPELINE_COLUMNS),
        [pipeline_id],
        pipeline_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("Pipeline {}", pipeline_id)))
}

/// List pipelines, optionally scoped to a project. Excludes soft-deleted.
pub fn list_pipelines(conn: &Connection, project_id: Option<&str>) -> Result<Vec<Pipeline>> {
    let sql = match project_id {
        Some(_) => format!(
            "SELECT {} FROM pipelines WHERE is_deleted = 0 AND project_id = ?1 ORDER BY created_at",
            PIPELINE_COLUMNS
        ),
        None => format!(
            "SELECT {} FROM pipelines WHERE is_deleted = 0 ORDER BY created_at",
            PIPELINE_COLUMNS
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = match project_id {
        Some(project) => stmt.query_map([project], pipeline_from_row)?,
        None => stmt.query_map([], pipeline_from_row)?,
    };
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Replace a pipeline's config, snapshotting the change as a new version.
///
/// If the new config is canonically identical to the current one, this is a
/// no-op: no version row is created and the pipeline is returned unchanged.
/// Otherwise the next version number is allocated as `MAX(version_number)+1`
/// under the unique constraint; a concurrent writer that claims the same
/// slot surfaces as `Conflict`.
pub fn update_config(
    conn: &Connection,
    pipeline_id: &str,
    new_config: &serde_json::Value,
    steps: &[NewStep],
    changed_by: Option<&str>,
    change_description: &str,
) -> Result<Pipeline> {
    validate_steps(steps)?;

    let pipeline = get_pipeline(conn, pipeline_id)?;

    if canonical_string(&pipeline.config) == canonical_string(new_config) {
        tracing::debug!(pipeline_id, "Config unchanged, skipping version");
        return Ok(pipeline);
    }

    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;

    let next_version: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM pipeline_versions WHERE pipeline_id = ?1",
        [pipeline_id],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO pipeline_versions (pipeline_id, version_number, config_snapshot,
             created_by, created_at, change_description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            pipeline_id,
            next_version,
            new_config.to_string(),
            changed_by,
            now,
            change_description,
        ],
    )
    .map_err(|e| conflict_on_constraint(e, "Concurrent config change on pipeline"))?;

    let version_id = tx.last_insert_rowid();
    insert_steps(&tx, version_id, steps)?;

    tx.execute(
        "UPDATE pipelines SET config = ?2, current_version = ?3, updated_at = ?4 WHERE id = ?1",
        params![pipeline_id, new_config.to_string(), next_version, now],
    )?;

    tx.commit()?;

    tracing::info!(pipeline_id, version = next_version, "Pipeline config updated");
    get_pipeline(conn, pipeline_id)
}

/// Move a pipeline into `validating`, from `draft` or from `failed`
/// (re-validating after a fix).
pub fn begin_validation(conn: &Connection, pipeline_id: &str) -> Result<Pipeline> {
    let rows = conn.execute(
        "UPDATE pipelines SET state = 'validating', updated_at = ?2
         WHERE id = ?1 AND is_deleted = 0 AND state IN ('draft', 'failed')",
        params![pipeline_id, Utc::now()],
    )?;

    if rows == 0 {
        let current = get_pipeline(conn, pipeline_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot validate pipeline in state {}",
            current.state
        )));
    }

    get_pipeline(conn, pipeline_id)
}

/// Finish validation: `validating -> ready` on success, `validating ->
/// failed` otherwise. A failed pipeline may re-enter validation via
/// [`begin_validation`].
pub fn complete_validation(conn: &Connection, pipeline_id: &str, success: bool) -> Result<Pipeline> {
    let target = if success {
        PipelineState::Ready
    } else {
        PipelineState::Failed
    };

    let rows = conn.execute(
        "UPDATE pipelines SET state = ?2, updated_at = ?3
         WHERE id = ?1 AND is_deleted = 0 AND state = 'validating'",
        params![pipeline_id, target.as_str(), Utc::now()],
    )?;

    if rows == 0 {
        let current = get_pipeline(conn, pipeline_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot complete validation for pipeline in state {}",
            current.state
        )));
    }

    tracing::info!(pipeline_id, success, "Validation completed");
    get_pipeline(conn, pipeline_id)
}

/// Store advisory resource estimates on a pipeline.
pub fn apply_resource_estimate(
    conn: &Connection,
    pipeline_id: &str,
    estimate: &ResourceEstimate,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE pipelines SET estimated_memory_mb = ?2, estimated_cpu_percent = ?3,
             estimated_duration_seconds = ?4, estimated_row_count = ?5, updated_at = ?6
         WHERE id = ?1 AND is_deleted = 0",
        params![
            pipeline_id,
            estimate.memory_mb,
            estimate.cpu_percent,
            estimate.duration_seconds,
            estimate.row_count,
            Utc::now(),
        ],
    )?;

    if rows == 0 {
        return Err(EngineError::NotFound(format!("Pipeline {}", pipeline_id)));
    }
    Ok(())
}

/// Soft-delete a pipeline.
///
/// Refused with `Conflict` while an execution is queued or running; the
/// orchestrator must finish or cancel it first.
pub fn soft_delete_pipeline(conn: &Connection, pipeline_id: &str) -> Result<()> {
    // Guard and delete share one transaction so a trigger racing this call
    // cannot slip an execution in between the check and the flag
    let tx = conn.unchecked_transaction()?;

    // Existence check first so a bad id is NotFound, not a silent no-op
    get_pipeline(&tx, pipeline_id)?;

    let active: i64 = tx.query_row(
        "SELECT COUNT(*) FROM pipeline_executions
         WHERE pipeline_id = ?1 AND state IN ('queued', 'running')",
        [pipeline_id],
        |row| row.get(0),
    )?;

    if active > 0 {
        return Err(EngineError::Conflict(format!(
            "Pipeline {} has an active execution",
            pipeline_id
        )));
    }

    tx.execute(
        "UPDATE pipelines SET is_deleted = 1, deleted_at = ?2, updated_at = ?2
         WHERE id = ?1 AND is_deleted = 0",
        params![pipeline_id, Utc::now()],
    )?;

    tx.commit()?;

    tracing::info!(pipeline_id, "Pipeline soft-deleted");
    Ok(())
}

/// List the full version history for a pipeline, oldest first.
pub fn list_versions(conn: &Connection, pipeline_id: &str) -> Result<Vec<PipelineVersion>> {
    let mut stmt = conn.prepare(
        "SELECT id, pipeline_id, version_number, config_snapshot, created_by, created_at,
                change_description
         FROM pipeline_versions WHERE pipeline_id = ?1 ORDER BY version_number",
    )?;
    let rows = stmt.query_map([pipeline_id], version_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Fetch one version of a pipeline by version number.
pub fn get_version(
    conn: &Connection,
    pipeline_id: &str,
    version_number: i64,
) -> Result<PipelineVersion> {
    conn.query_row(
        "SELECT id, pipeline_id, version_number, config_snapshot, created_by, created_at,
                change_description
         FROM pipeline_versions WHERE pipeline_id = ?1 AND version_number = ?2",
        params![pipeline_id, version_number],
        version_from_row,
    )
    .optional()?
    .ok_or_else(|| {
        EngineError::NotFound(format!(
            "Pipeline {} version {}",
            pipeline_id, version_number
        ))
    })
}

/// List the ordered steps of one pipeline version.
pub fn list_steps(conn: &Connection, pipeline_version_id: i64) -> Result<Vec<PipelineStep>> {
    let mut stmt = conn.prepare(
        "SELECT id, pipeline_version_id, step_order, step_type, step_config, is_enabled
         FROM pipeline_steps WHERE pipeline_version_id = ?1 ORDER BY step_order",
    )?;
    let rows = stmt.query_map([pipeline_version_id], step_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}
