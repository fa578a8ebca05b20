//! Scheduler Poller.
//!
//! Selection only: the poller finds scheduled pipelines whose
//! `next_scheduled_run` has arrived and hands them to the orchestrator.
//! Cron evaluation lives with the caller, which computes the next fire time
//! and writes it back after triggering. A pipeline mid-run is simply not
//! due; the trigger-time guards stay the single enforcement point.

use chrono::{DateTime, Utc};
use fluxline_core::{EngineError, Pipeline, Result};
use rusqlite::{params, Connection};

use crate::registry::pipeline_from_row;

/// Scheduled pipelines that are due to run at `now`.
///
/// A pipeline is due when it is scheduled, live, in a triggerable state,
/// and its `next_scheduled_run` is set and not in the future. Ordered by
/// due time, most overdue first.
pub fn due_for_execution(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Pipeline>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, project_id, data_source_id, target_dataset_name,
                execution_mode, schedule_expression, config, state, current_version,
                last_run_at, last_run_status, next_scheduled_run, created_at, updated_at,
                created_by, is_deleted, deleted_at
         FROM pipelines
         WHERE is_deleted = 0
           AND execution_mode = 'scheduled'
           AND state IN ('ready', 'completed', 'failed')
           AND next_scheduled_run IS NOT NULL
           AND next_scheduled_run <= ?1
         ORDER BY next_scheduled_run",
    )?;
    let rows = stmt.query_map([now], pipeline_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Record the next fire time computed from the schedule expression.
pub fn set_next_scheduled_run(
    conn: &Connection,
    pipeline_id: &str,
    next_run: Option<DateTime<Utc>>,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE pipelines SET next_scheduled_run = ?2, updated_at = ?3
         WHERE id = ?1 AND is_deleted = 0",
        params![pipeline_id, next_run, Utc::now()],
    )?;

    if rows == 0 {
        return Err(EngineError::NotFound(format!("Pipeline {}", pipeline_id)));
    }
    Ok(())
}
