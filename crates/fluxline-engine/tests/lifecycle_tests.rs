//! End-to-end lifecycle tests: one pipeline run from draft to a promoted,
//! lineage-tracked dataset version.

use fluxline_core::{
    DatasetVersionState, EngineError, ExecutionMetrics, ExecutionMode, ExecutionState,
    PipelineState, QualityMetrics, StepType, TriggerType, Visibility,
};
use fluxline_engine::datasets::{self, NewDataset, NewDatasetVersion, QueryRecord};
use fluxline_engine::lineage::{self, LineageSource};
use fluxline_engine::orchestrator;
use fluxline_engine::registry::{self, NewPipeline, NewStep};
use fluxline_engine::scheduler;
use rusqlite::Connection;
use serde_json::json;

fn engine_conn() -> Connection {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let conn = Connection::open_in_memory().unwrap();
    fluxline_core::init_engine(&conn, true).unwrap();
    conn
}

fn orders_pipeline() -> NewPipeline {
    NewPipeline {
        name: "orders_daily".to_string(),
        description: "Clean and dedupe raw orders".to_string(),
        project_id: "analytics".to_string(),
        data_source_id: "warehouse-pg".to_string(),
        target_dataset_name: "orders_clean".to_string(),
        execution_mode: ExecutionMode::Manual,
        schedule_expression: String::new(),
        config: json!({"source_table": "raw_orders"}),
        steps: vec![
            NewStep {
                step_order: 0,
                step_type: StepType::FilterRows,
                step_config: json!({"condition": "amount > 0"}),
                is_enabled: true,
            },
            NewStep {
                step_order: 1,
                step_type: StepType::DropDuplicates,
                step_config: json!({"subset": ["order_id"]}),
                is_enabled: true,
            },
        ],
        created_by: Some("alice".to_string()),
    }
}

fn orders_schema() -> serde_json::Value {
    json!({
        "columns": [
            {"name": "order_id", "type": "INTEGER", "nullable": false},
            {"name": "amount", "type": "REAL", "nullable": false},
            {"name": "placed_at", "type": "TIMESTAMP", "nullable": true}
        ]
    })
}

#[test]
fn full_run_produces_promoted_version_with_lineage() {
    let conn = engine_conn();

    // Register and validate the pipeline
    let pipeline = registry::create_pipeline(&conn, &orders_pipeline()).unwrap();
    registry::begin_validation(&conn, &pipeline.id).unwrap();
    registry::complete_validation(&conn, &pipeline.id, true).unwrap();

    // Trigger: pipeline flips to running, execution starts queued
    let execution =
        orchestrator::trigger_execution(&conn, &pipeline.id, TriggerType::Manual, Some("alice"))
            .unwrap();
    assert_eq!(execution.state, ExecutionState::Queued);

    let execution = orchestrator::record_start(&conn, &execution.id).unwrap();
    orchestrator::append_log(&conn, &execution.id, "reading raw_orders").unwrap();

    // The run materializes a dataset version
    let dataset = datasets::create_dataset(
        &conn,
        &NewDataset {
            name: "orders_clean".to_string(),
            description: String::new(),
            project_id: "analytics".to_string(),
            visibility: Visibility::Project,
            tags: vec!["env:prod".to_string()],
            created_by: Some("alice".to_string()),
        },
    )
    .unwrap();

    let version = datasets::create_version(
        &conn,
        &dataset.id,
        &NewDatasetVersion {
            schema: orders_schema(),
            storage_table_name: String::new(),
            created_by: Some("alice".to_string()),
            created_by_pipeline_id: Some(pipeline.id.clone()),
            change_description: "Produced by orders_daily".to_string(),
        },
    )
    .unwrap();
    assert_eq!(version.version_number, 1);
    assert_eq!(version.state, DatasetVersionState::Creating);
    assert_eq!(version.column_count, 3);

    lineage::record_edge(
        &conn,
        &version.id,
        &LineageSource::Pipeline(pipeline.id.clone()),
        &json!({"steps": ["filter_rows", "drop_duplicates"]}),
    )
    .unwrap();
    lineage::record_edge(
        &conn,
        &version.id,
        &LineageSource::DataSource("warehouse-pg".to_string()),
        &json!({"table": "raw_orders"}),
    )
    .unwrap();

    let ready = datasets::finalize_version(
        &conn,
        &version.id,
        48_210,
        9_437_184,
        &QualityMetrics {
            quality_score: Some(96.0),
            null_percentage: 0.4,
            duplicate_count: 0,
            outlier_count: 12,
            column_profiles: json!({"amount": {"min": 0.01, "max": 9999.0}}),
        },
    )
    .unwrap();
    assert_eq!(ready.state, DatasetVersionState::Ready);

    datasets::set_current_version(&conn, &dataset.id, 1).unwrap();

    // Close out the execution, pointing at what it produced
    let done = orchestrator::record_completion(
        &conn,
        &execution.id,
        &ExecutionMetrics {
            rows_processed: Some(48_210),
            rows_failed: 17,
            bytes_processed: Some(9_437_184),
            peak_memory_mb: Some(310),
            peak_cpu_percent: Some(72),
        },
        Some(version.id.as_str()),
    )
    .unwrap();
    assert_eq!(done.state, ExecutionState::Completed);
    assert_eq!(done.created_dataset_version_id.as_deref(), Some(version.id.as_str()));

    let pipeline = registry::get_pipeline(&conn, &pipeline.id).unwrap();
    assert_eq!(pipeline.state, PipelineState::Completed);
    assert_eq!(pipeline.last_run_status, "completed");

    // Lineage answers both directions
    let edges = lineage::edges_for_version(&conn, &version.id).unwrap();
    assert_eq!(edges.len(), 2);

    // A second run may start now that the first is terminal
    assert!(
        orchestrator::trigger_execution(&conn, &pipeline.id, TriggerType::Manual, None).is_ok()
    );
}

#[test]
fn concurrent_trigger_is_rejected_and_state_is_untouched() {
    let conn = engine_conn();

    let pipeline = registry::create_pipeline(&conn, &orders_pipeline()).unwrap();
    registry::begin_validation(&conn, &pipeline.id).unwrap();
    registry::complete_validation(&conn, &pipeline.id, true).unwrap();

    let first =
        orchestrator::trigger_execution(&conn, &pipeline.id, TriggerType::Manual, None).unwrap();

    let err = orchestrator::trigger_execution(&conn, &pipeline.id, TriggerType::Api, None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    // The failed trigger left exactly one execution and the pipeline running
    let executions = orchestrator::list_executions(&conn, &pipeline.id, 10).unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].id, first.id);
    assert_eq!(
        registry::get_pipeline(&conn, &pipeline.id).unwrap().state,
        PipelineState::Running
    );
}

#[test]
fn config_change_mid_history_pins_running_version() {
    let conn = engine_conn();

    let pipeline = registry::create_pipeline(&conn, &orders_pipeline()).unwrap();
    registry::begin_validation(&conn, &pipeline.id).unwrap();
    registry::complete_validation(&conn, &pipeline.id, true).unwrap();

    let execution =
        orchestrator::trigger_execution(&conn, &pipeline.id, TriggerType::Manual, None).unwrap();
    let v1_id = execution.pipeline_version_id.unwrap();

    // Cancel so the pipeline is editable again, then change the config
    orchestrator::cancel_execution(&conn, &execution.id).unwrap();
    registry::update_config(
        &conn,
        &pipeline.id,
        &json!({"source_table": "raw_orders_v2"}),
        &[],
        None,
        "New source table",
    )
    .unwrap();

    // The old execution still points at the version it ran with
    let execution = orchestrator::get_execution(&conn, &execution.id).unwrap();
    assert_eq!(execution.pipeline_version_id, Some(v1_id));

    // A new run binds to the new current version
    let next =
        orchestrator::trigger_execution(&conn, &pipeline.id, TriggerType::Manual, None).unwrap();
    assert_ne!(next.pipeline_version_id, Some(v1_id));
}

#[test]
fn version_history_survives_pipeline_soft_delete() {
    let conn = engine_conn();

    let pipeline = registry::create_pipeline(&conn, &orders_pipeline()).unwrap();
    registry::update_config(&conn, &pipeline.id, &json!({"a": 1}), &[], None, "tweak").unwrap();
    registry::soft_delete_pipeline(&conn, &pipeline.id).unwrap();

    assert!(registry::get_pipeline(&conn, &pipeline.id).is_err());
    let versions = registry::list_versions(&conn, &pipeline.id).unwrap();
    assert_eq!(versions.len(), 2);
}

#[test]
fn scheduler_hands_due_pipelines_to_the_orchestrator() {
    let conn = engine_conn();
    let now = chrono::Utc::now();

    let mut input = orders_pipeline();
    input.execution_mode = ExecutionMode::Scheduled;
    input.schedule_expression = "0 6 * * *".to_string();
    let pipeline = registry::create_pipeline(&conn, &input).unwrap();
    registry::begin_validation(&conn, &pipeline.id).unwrap();
    registry::complete_validation(&conn, &pipeline.id, true).unwrap();

    scheduler::set_next_scheduled_run(&conn, &pipeline.id, Some(now - chrono::Duration::minutes(2)))
        .unwrap();

    let due = scheduler::due_for_execution(&conn, now).unwrap();
    assert_eq!(due.len(), 1);

    for pipeline in due {
        orchestrator::trigger_execution(&conn, &pipeline.id, TriggerType::Scheduled, None)
            .unwrap();
        scheduler::set_next_scheduled_run(
            &conn,
            &pipeline.id,
            Some(now + chrono::Duration::days(1)),
        )
        .unwrap();
    }

    // Once triggered and rescheduled, nothing is due
    assert!(scheduler::due_for_execution(&conn, now).unwrap().is_empty());
}

#[test]
fn quality_report_and_query_audit() {
    let conn = engine_conn();

    let dataset = datasets::create_dataset(
        &conn,
        &NewDataset {
            name: "metrics".to_string(),
            description: String::new(),
            project_id: "analytics".to_string(),
            visibility: Visibility::Workspace,
            tags: vec![],
            created_by: None,
        },
    )
    .unwrap();

    let version = datasets::create_version(
        &conn,
        &dataset.id,
        &NewDatasetVersion {
            schema: orders_schema(),
            storage_table_name: "metrics_v1".to_string(),
            created_by: None,
            created_by_pipeline_id: None,
            change_description: String::new(),
        },
    )
    .unwrap();
    datasets::finalize_version(
        &conn,
        &version.id,
        100,
        1024,
        &QualityMetrics {
            quality_score: Some(88.0),
            ..Default::default()
        },
    )
    .unwrap();

    let report = datasets::quality_report(&conn, &dataset.id).unwrap();
    assert_eq!(report.version_count, 1);
    assert_eq!(report.average_quality_score, Some(88.0));

    datasets::record_query(
        &conn,
        &version.id,
        "SELECT COUNT(*) FROM metrics_v1",
        &QueryRecord {
            executed_by: Some("bob".to_string()),
            execution_time_ms: Some(4),
            rows_returned: Some(1),
            success: true,
            error_message: String::new(),
        },
    )
    .unwrap();

    let logged: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM dataset_queries WHERE dataset_version_id = ?1",
            [&version.id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(logged, 1);
}

#[tokio::test]
async fn engine_runs_over_a_storage_backend() {
    use fluxline_storage::{LocalSqliteBackend, StoreBackend};

    let dir = tempfile::tempdir().unwrap();
    let backend = LocalSqliteBackend::new(dir.path().join("engine.db"));
    backend.initialize().await.unwrap();

    let conn = backend.get_connection().await.unwrap();
    fluxline_core::migrations::run_migrations(&conn).unwrap();

    let pipeline = registry::create_pipeline(&conn, &orders_pipeline()).unwrap();
    drop(conn);

    // State persists across connections
    let conn = backend.get_connection().await.unwrap();
    let listed = registry::list_pipelines(&conn, Some("analytics")).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, pipeline.id);
}
