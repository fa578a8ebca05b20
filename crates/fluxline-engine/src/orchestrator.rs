//! Execution Orchestrator.
//!
//! State machine for pipeline runs: `queued -> running -> completed | failed`,
//! with `cancelled` reachable from any non-terminal state. Transitions are
//! conditional UPDATEs keyed on the current state, so a stale writer affects
//! zero rows instead of clobbering. The one-run-at-a-time rule is structural:
//! a partial unique index on `pipeline_executions(pipeline_id)` over
//! non-terminal states makes the second concurrent trigger fail its INSERT.

use chrono::Utc;
use fluxline_core::{
    conflict_on_constraint, EngineError, ExecutionMetrics, ExecutionState, PipelineExecution,
    Result, TriggerType,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::column_parse_error;
use crate::registry;

const EXECUTION_COLUMNS: &str = "id, pipeline_id, pipeline_version_id, state, trigger_type, \
     triggered_by, queued_at, started_at, completed_at, rows_processed, rows_failed, \
     bytes_processed, peak_memory_mb, peak_cpu_percent, execution_log, error_message, \
     error_detail, created_dataset_version_id";

fn execution_from_row(row: &Row) -> rusqlite::Result<PipelineExecution> {
    let state: String = row.get(3)?;
    let trigger: String = row.get(4)?;
    Ok(PipelineExecution {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        pipeline_version_id: row.get(2)?,
        state: state.parse().map_err(|e| column_parse_error(3, e))?,
        trigger_type: trigger.parse().map_err(|e| column_parse_error(4, e))?,
        triggered_by: row.get(5)?,
        queued_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        metrics: ExecutionMetrics {
            rows_processed: row.get(9)?,
            rows_failed: row.get(10)?,
            bytes_processed: row.get(11)?,
            peak_memory_mb: row.get(12)?,
            peak_cpu_percent: row.get(13)?,
        },
        execution_log: row.get(14)?,
        error_message: row.get(15)?,
        error_detail: row.get(16)?,
        created_dataset_version_id: row.get(17)?,
    })
}

/// Trigger a new execution for a pipeline.
///
/// One transaction covers the whole trigger: the pipeline state guard, the
/// execution INSERT, and the pipeline flip to `running`. The pipeline must
/// be in a triggerable state (`ready`, `completed`, or `failed`) and have a
/// validated config version; a second live run is rejected with `Conflict`
/// by the partial unique index.
pub fn trigger_execution(
    conn: &Connection,
    pipeline_id: &str,
    trigger_type: TriggerType,
    triggered_by: Option<&str>,
) -> Result<PipelineExecution> {
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;

    let pipeline = registry::get_pipeline(&tx, pipeline_id)?;

    if pipeline.current_version == 0 {
        return Err(EngineError::Validation(format!(
            "Pipeline {} has no config version to run",
            pipeline_id
        )));
    }

    // Guard + flip in one conditional UPDATE
    let rows = tx.execute(
        "UPDATE pipelines SET state = 'running', updated_at = ?2
         WHERE id = ?1 AND is_deleted = 0 AND state IN ('ready', 'completed', 'failed')",
        params![pipeline_id, now],
    )?;

    if rows == 0 {
        return Err(EngineError::Conflict(format!(
            "Pipeline {} is not triggerable from state {}",
            pipeline_id, pipeline.state
        )));
    }

    // Bind the run to the version that is current right now
    let version_id: i64 = tx.query_row(
        "SELECT id FROM pipeline_versions WHERE pipeline_id = ?1 AND version_number = ?2",
        params![pipeline_id, pipeline.current_version],
        |row| row.get(0),
    )?;

    let execution_id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO pipeline_executions (id, pipeline_id, pipeline_version_id, state,
             trigger_type, triggered_by, queued_at)
         VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6)",
        params![
            execution_id,
            pipeline_id,
            version_id,
            trigger_type.as_str(),
            triggered_by,
            now,
        ],
    )
    .map_err(|e| conflict_on_constraint(e, "An execution is already active for this pipeline"))?;

    tx.commit()?;

    tracing::info!(
        pipeline_id,
        execution_id = %execution_id,
        trigger = %trigger_type,
        "Execution queued"
    );
    get_execution(conn, &execution_id)
}

/// Mark an execution as started: `queued -> running`.
pub fn record_start(conn: &Connection, execution_id: &str) -> Result<PipelineExecution> {
    let rows = conn.execute(
        "UPDATE pipeline_executions SET state = 'running', started_at = ?2
         WHERE id = ?1 AND state = 'queued'",
        params![execution_id, Utc::now()],
    )?;

    if rows == 0 {
        let current = get_execution(conn, execution_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot start execution in state {}",
            current.state
        )));
    }

    get_execution(conn, execution_id)
}

/// Mark an execution as completed: `running -> completed`.
///
/// Records the metrics reported by the Compute Engine and the dataset
/// version the run produced, then settles the pipeline to `completed` with
/// its last-run bookkeeping. Terminal; the execution row is immutable
/// afterwards.
pub fn record_completion(
    conn: &Connection,
    execution_id: &str,
    metrics: &ExecutionMetrics,
    created_dataset_version_id: Option<&str>,
) -> Result<PipelineExecution> {
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;

    let rows = tx.execute(
        "UPDATE pipeline_executions SET state = 'completed', completed_at = ?2,
             rows_processed = ?3, rows_failed = ?4, bytes_processed = ?5,
             peak_memory_mb = ?6, peak_cpu_percent = ?7, created_dataset_version_id = ?8
         WHERE id = ?1 AND state = 'running'",
        params![
            execution_id,
            now,
            metrics.rows_processed,
            metrics.rows_failed,
            metrics.bytes_processed,
            metrics.peak_memory_mb,
            metrics.peak_cpu_percent,
            created_dataset_version_id,
        ],
    )?;

    if rows == 0 {
        let current = get_execution(&tx, execution_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot complete execution in state {}",
            current.state
        )));
    }

    tx.execute(
        "UPDATE pipelines SET state = 'completed', last_run_at = ?2,
             last_run_status = 'completed', updated_at = ?2
         WHERE id = (SELECT pipeline_id FROM pipeline_executions WHERE id = ?1)",
        params![execution_id, now],
    )?;

    tx.commit()?;

    tracing::info!(execution_id, "Execution completed");
    get_execution(conn, execution_id)
}

/// Mark an execution as failed, from either `queued` or `running`.
pub fn record_failure(
    conn: &Connection,
    execution_id: &str,
    error_message: &str,
    error_detail: &str,
) -> Result<PipelineExecution> {
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;

    let rows = tx.execute(
        "UPDATE pipeline_executions SET state = 'failed', completed_at = ?2,
             error_message = ?3, error_detail = ?4
         WHERE id = ?1 AND state IN ('queued', 'running')",
        params![execution_id, now, error_message, error_detail],
    )?;

    if rows == 0 {
        let current = get_execution(&tx, execution_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot fail execution in state {}",
            current.state
        )));
    }

    tx.execute(
        "UPDATE pipelines SET state = 'failed', last_run_at = ?2,
             last_run_status = 'failed', updated_at = ?2
         WHERE id = (SELECT pipeline_id FROM pipeline_executions WHERE id = ?1)",
        params![execution_id, now],
    )?;

    tx.commit()?;

    tracing::warn!(execution_id, error = error_message, "Execution failed");
    get_execution(conn, execution_id)
}

/// Cancel a non-terminal execution.
///
/// The pipeline returns to `ready`: cancellation is an operator action, not
/// a run outcome, so it neither counts as a completion nor as a failure.
pub fn cancel_execution(conn: &Connection, execution_id: &str) -> Result<PipelineExecution> {
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;

    let rows = tx.execute(
        "UPDATE pipeline_executions SET state = 'cancelled', completed_at = ?2
         WHERE id = ?1 AND state IN ('queued', 'running')",
        params![execution_id, now],
    )?;

    if rows == 0 {
        let current = get_execution(&tx, execution_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot cancel execution in state {}",
            current.state
        )));
    }

    tx.execute(
        "UPDATE pipelines SET state = 'ready', last_run_status = 'cancelled', updated_at = ?2
         WHERE id = (SELECT pipeline_id FROM pipeline_executions WHERE id = ?1)",
        params![execution_id, now],
    )?;

    tx.commit()?;

    tracing::info!(execution_id, "Execution cancelled");
    get_execution(conn, execution_id)
}

/// Append a line to the execution log of a live run.
pub fn append_log(conn: &Connection, execution_id: &str, line: &str) -> Result<()> {
    let rows = conn.execute(
        "UPDATE pipeline_executions
         SET execution_log = execution_log || ?2 || char(10)
         WHERE id = ?1 AND state IN ('queued', 'running')",
        params![execution_id, line],
    )?;

    if rows == 0 {
        let current = get_execution(conn, execution_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot append log to execution in state {}",
            current.state
        )));
    }
    Ok(())
}

/// Fetch one execution by id.
pub fn get_execution(conn: &Connection, execution_id: &str) -> Result<PipelineExecution> {
    conn.query_row(
        &format!("SELECT {} FROM pipeline_executions WHERE id = ?1", EXECUTION_COLUMNS),
        [execution_id],
        execution_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("Execution {}", execution_id)))
}

/// List executions for a pipeline, newest first.
pub fn list_executions(
    conn: &Connection,
    pipeline_id: &str,
    limit: i64,
) -> Result<Vec<PipelineExecution>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM pipeline_executions WHERE pipeline_id = ?1
         ORDER BY queued_at DESC LIMIT ?2",
        EXECUTION_COLUMNS
    ))?;
    let rows = stmt.query_map(params![pipeline_id, limit], execution_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// The live (queued or running) execution for a pipeline, if any.
pub fn active_execution(conn: &Connection, pipeline_id: &str) -> Result<Option<PipelineExecution>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM pipeline_executions
                 WHERE pipeline_id = ?1 AND state IN ('queued', 'running')",
                EXECUTION_COLUMNS
            ),
            [pipeline_id],
            execution_from_row,
        )
        .optional()?)
}
