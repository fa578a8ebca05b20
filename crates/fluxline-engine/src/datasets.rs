//! Dataset Version Manager.
//!
//! Datasets own a monotonic, append-only version history. Version numbers
//! are allocated as `MAX(version_number)+1` inserted under the
//! `(dataset_id, version_number)` unique constraint; losers of the race get
//! `Conflict` and may retry. A version's schema fingerprint is bound at
//! creation time and never recomputed. Promotion is explicit: creating a
//! version never moves `current_version`, `set_current_version` does.

use chrono::Utc;
use fluxline_core::fingerprint::{column_count, schema_fingerprint, sha256_hex};
use fluxline_core::validation::{validate_identifier, validate_name, validate_tag};
use fluxline_core::{
    conflict_on_constraint, Dataset, DatasetVersion, DatasetVersionState, EngineError,
    QualityMetrics, Result, Visibility,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{column_parse_error, json_column};

/// Input for registering a dataset.
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub name: String,
    pub description: String,
    pub project_id: String,
    pub visibility: Visibility,
    pub tags: Vec<String>,
    pub created_by: Option<String>,
}

/// Input for opening a new dataset version.
#[derive(Debug, Clone)]
pub struct NewDatasetVersion {
    /// Schema definition, `{"columns": [...]}` shape
    pub schema: serde_json::Value,
    /// Compute Engine table reference; generated when empty
    pub storage_table_name: String,
    pub created_by: Option<String>,
    pub created_by_pipeline_id: Option<String>,
    pub change_description: String,
}

const DATASET_COLUMNS: &str = "id, name, description, project_id, visibility, tags, \
     current_version, created_at, updated_at, created_by, is_deleted, deleted_at";

const VERSION_COLUMNS: &str = "id, dataset_id, version_number, state, schema, \
     schema_fingerprint, row_count, column_count, storage_size_bytes, storage_table_name, \
     quality_score, null_percentage, duplicate_count, outlier_count, column_profiles, \
     created_at, created_by, created_by_pipeline_id, change_description";

fn dataset_from_row(row: &Row) -> rusqlite::Result<Dataset> {
    let visibility: String = row.get(4)?;
    let tags_raw: String = row.get(5)?;
    let tags: Vec<String> =
        serde_json::from_str(&tags_raw).map_err(|e| column_parse_error(5, e))?;
    Ok(Dataset {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        project_id: row.get(3)?,
        visibility: visibility.parse().map_err(|e| column_parse_error(4, e))?,
        tags,
        current_version: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        created_by: row.get(9)?,
        is_deleted: row.get(10)?,
        deleted_at: row.get(11)?,
    })
}

fn version_from_row(row: &Row) -> rusqlite::Result<DatasetVersion> {
    let state: String = row.get(3)?;
    Ok(DatasetVersion {
        id: row.get(0)?,
        dataset_id: row.get(1)?,
        version_number: row.get(2)?,
        state: state.parse().map_err(|e| column_parse_error(3, e))?,
        schema: json_column(4, row.get(4)?)?,
        schema_fingerprint: row.get(5)?,
        row_count: row.get(6)?,
        column_count: row.get(7)?,
        storage_size_bytes: row.get(8)?,
        storage_table_name: row.get(9)?,
        quality: QualityMetrics {
            quality_score: row.get(10)?,
            null_percentage: row.get(11)?,
            duplicate_count: row.get(12)?,
            outlier_count: row.get(13)?,
            column_profiles: json_column(14, row.get(14)?)?,
        },
        created_at: row.get(15)?,
        created_by: row.get(16)?,
        created_by_pipeline_id: row.get(17)?,
        change_description: row.get(18)?,
    })
}

/// Register a dataset.
///
/// `(project_id, name)` must be unique among live datasets; the partial
/// unique index enforces it, so a soft-deleted dataset frees its name.
pub fn create_dataset(conn: &Connection, input: &NewDataset) -> Result<Dataset> {
    validate_name(&input.name, "Dataset name")?;
    validate_identifier(&input.project_id, "project_id")?;
    for tag in &input.tags {
        validate_tag(tag)?;
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let tags_json = serde_json::to_string(&input.tags)
        .map_err(|e| EngineError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO datasets (id, name, description, project_id, visibility, tags,
             current_version, created_at, updated_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7, ?8)",
        params![
            id,
            input.name,
            input.description,
            input.project_id,
            input.visibility.as_str(),
            tags_json,
            now,
            input.created_by,
        ],
    )
    .map_err(|e| {
        conflict_on_constraint(
            e,
            &format!(
                "Dataset '{}' already exists in project {}",
                input.name, input.project_id
            ),
        )
    })?;

    tracing::info!(dataset_id = %id, name = %input.name, "Created dataset");
    get_dataset(conn, &id)
}

/// Fetch a dataset. Soft-deleted datasets are reported as not found.
pub fn get_dataset(conn: &Connection, dataset_id: &str) -> Result<Dataset> {
    conn.query_row(
        &format!("SELECT {} FROM datasets WHERE id = ?1 AND is_deleted = 0", DATASET_COLUMNS),
        [dataset_id],
        dataset_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("Dataset {}", dataset_id)))
}

/// List datasets, optionally scoped to a project. Excludes soft-deleted.
pub fn list_datasets(conn: &Connection, project_id: Option<&str>) -> Result<Vec<Dataset>> {
    let sql = match project_id {
        Some(_) => format!(
            "SELECT {} FROM datasets WHERE is_deleted = 0 AND project_id = ?1 ORDER BY created_at",
            DATASET_COLUMNS
        ),
        None => format!(
            "SELECT {} FROM datasets WHERE is_deleted = 0 ORDER BY created_at",
            DATASET_COLUMNS
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = match project_id {
        Some(project) => stmt.query_map([project], dataset_from_row)?,
        None => stmt.query_map([], dataset_from_row)?,
    };
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Soft-delete a dataset. Its versions remain for lineage.
pub fn soft_delete_dataset(conn: &Connection, dataset_id: &str) -> Result<()> {
    let rows = conn.execute(
        "UPDATE datasets SET is_deleted = 1, deleted_at = ?2, updated_at = ?2
         WHERE id = ?1 AND is_deleted = 0",
        params![dataset_id, Utc::now()],
    )?;

    if rows == 0 {
        return Err(EngineError::NotFound(format!("Dataset {}", dataset_id)));
    }

    tracing::info!(dataset_id, "Dataset soft-deleted");
    Ok(())
}

/// Open a new version of a dataset, in `creating` state.
///
/// The version number, schema fingerprint, and column count are all bound
/// here. `current_version` does not move; promote with
/// [`set_current_version`] once the version is ready.
pub fn create_version(
    conn: &Connection,
    dataset_id: &str,
    input: &NewDatasetVersion,
) -> Result<DatasetVersion> {
    get_dataset(conn, dataset_id)?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let fingerprint = schema_fingerprint(&input.schema);
    let columns = column_count(&input.schema);

    let tx = conn.unchecked_transaction()?;

    let next_version: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM dataset_versions WHERE dataset_id = ?1",
        [dataset_id],
        |row| row.get(0),
    )?;

    let storage_table_name = if input.storage_table_name.is_empty() {
        format!("ds_{}_v{}", &id[..8], next_version)
    } else {
        input.storage_table_name.clone()
    };

    tx.execute(
        "INSERT INTO dataset_versions (id, dataset_id, version_number, state, schema,
             schema_fingerprint, column_count, storage_table_name, created_at, created_by,
             created_by_pipeline_id, change_description)
         VALUES (?1, ?2, ?3, 'creating', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            dataset_id,
            next_version,
            input.schema.to_string(),
            fingerprint,
            columns,
            storage_table_name,
            now,
            input.created_by,
            input.created_by_pipeline_id,
            input.change_description,
        ],
    )
    .map_err(|e| conflict_on_constraint(e, "Concurrent version creation on dataset"))?;

    tx.commit()?;

    tracing::info!(
        dataset_id,
        version = next_version,
        fingerprint = %fingerprint,
        "Dataset version opened"
    );
    get_version_by_id(conn, &id)
}

/// Fetch a version by its id.
pub fn get_version_by_id(conn: &Connection, version_id: &str) -> Result<DatasetVersion> {
    conn.query_row(
        &format!("SELECT {} FROM dataset_versions WHERE id = ?1", VERSION_COLUMNS),
        [version_id],
        version_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("Dataset version {}", version_id)))
}

/// Fetch a version by dataset and version number.
pub fn get_version(
    conn: &Connection,
    dataset_id: &str,
    version_number: i64,
) -> Result<DatasetVersion> {
    conn.query_row(
        &format!(
            "SELECT {} FROM dataset_versions WHERE dataset_id = ?1 AND version_number = ?2",
            VERSION_COLUMNS
        ),
        params![dataset_id, version_number],
        version_from_row,
    )
    .optional()?
    .ok_or_else(|| {
        EngineError::NotFound(format!("Dataset {} version {}", dataset_id, version_number))
    })
}

/// List a dataset's versions, oldest first.
pub fn list_versions(conn: &Connection, dataset_id: &str) -> Result<Vec<DatasetVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM dataset_versions WHERE dataset_id = ?1 ORDER BY version_number",
        VERSION_COLUMNS
    ))?;
    let rows = stmt.query_map([dataset_id], version_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Finalize a version: `creating -> ready`, recording size and quality.
pub fn finalize_version(
    conn: &Connection,
    version_id: &str,
    row_count: i64,
    storage_size_bytes: i64,
    quality: &QualityMetrics,
) -> Result<DatasetVersion> {
    let rows = conn.execute(
        "UPDATE dataset_versions SET state = 'ready', row_count = ?2,
             storage_size_bytes = ?3, quality_score = ?4, null_percentage = ?5,
             duplicate_count = ?6, outlier_count = ?7, column_profiles = ?8
         WHERE id = ?1 AND state = 'creating'",
        params![
            version_id,
            row_count,
            storage_size_bytes,
            quality.quality_score,
            quality.null_percentage,
            quality.duplicate_count,
            quality.outlier_count,
            quality.column_profiles.to_string(),
        ],
    )?;

    if rows == 0 {
        let current = get_version_by_id(conn, version_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot finalize version in state {}",
            current.state
        )));
    }

    tracing::info!(version_id, row_count, "Dataset version finalized");
    get_version_by_id(conn, version_id)
}

/// Mark a version's materialization as failed: `creating -> failed`.
pub fn mark_version_failed(conn: &Connection, version_id: &str) -> Result<DatasetVersion> {
    let rows = conn.execute(
        "UPDATE dataset_versions SET state = 'failed' WHERE id = ?1 AND state = 'creating'",
        [version_id],
    )?;

    if rows == 0 {
        let current = get_version_by_id(conn, version_id)?;
        return Err(EngineError::InvalidTransition(format!(
            "Cannot fail version in state {}",
            current.state
        )));
    }

    tracing::warn!(version_id, "Dataset version failed");
    get_version_by_id(conn, version_id)
}

/// Promote a version to be the dataset's current one.
///
/// Only `ready` versions are promotable.
pub fn set_current_version(
    conn: &Connection,
    dataset_id: &str,
    version_number: i64,
) -> Result<Dataset> {
    // Guard and pointer move share one transaction so a concurrent
    // delete_version cannot remove the row mid-promotion
    let tx = conn.unchecked_transaction()?;

    let version = get_version(&tx, dataset_id, version_number)?;

    if version.state != DatasetVersionState::Ready {
        return Err(EngineError::Conflict(format!(
            "Cannot promote version {} in state {}",
            version_number, version.state
        )));
    }

    let rows = tx.execute(
        "UPDATE datasets SET current_version = ?2, updated_at = ?3 WHERE id = ?1 AND is_deleted = 0",
        params![dataset_id, version_number, Utc::now()],
    )?;

    if rows == 0 {
        return Err(EngineError::NotFound(format!("Dataset {}", dataset_id)));
    }

    tx.commit()?;

    tracing::info!(dataset_id, version = version_number, "Version promoted");
    get_dataset(conn, dataset_id)
}

/// Delete one version of a dataset.
///
/// Refused for the current version and for the only remaining version; a
/// dataset's history never becomes empty and its promoted snapshot never
/// disappears out from under readers.
pub fn delete_version(conn: &Connection, dataset_id: &str, version_number: i64) -> Result<()> {
    // All three guards and the DELETE share one transaction; a promotion
    // racing this call sees either the old row or the new pointer, never a
    // current_version aimed at a deleted row
    let tx = conn.unchecked_transaction()?;

    let dataset = get_dataset(&tx, dataset_id)?;
    get_version(&tx, dataset_id, version_number)?;

    if dataset.current_version == version_number {
        return Err(EngineError::Conflict(format!(
            "Version {} is the current version",
            version_number
        )));
    }

    let total: i64 = tx.query_row(
        "SELECT COUNT(*) FROM dataset_versions WHERE dataset_id = ?1",
        [dataset_id],
        |row| row.get(0),
    )?;
    if total <= 1 {
        return Err(EngineError::Conflict(
            "Cannot delete the only version of a dataset".to_string(),
        ));
    }

    tx.execute(
        "DELETE FROM dataset_versions WHERE dataset_id = ?1 AND version_number = ?2",
        params![dataset_id, version_number],
    )?;

    tx.commit()?;

    tracing::info!(dataset_id, version = version_number, "Version deleted");
    Ok(())
}

/// Backfill a fingerprint for a version stored before fingerprinting.
///
/// No-op when the version already carries one; the stored fingerprint is
/// never overwritten.
pub fn ensure_fingerprint(conn: &Connection, version_id: &str) -> Result<String> {
    let version = get_version_by_id(conn, version_id)?;

    if !version.schema_fingerprint.is_empty() {
        return Ok(version.schema_fingerprint);
    }

    let fingerprint = schema_fingerprint(&version.schema);
    conn.execute(
        "UPDATE dataset_versions SET schema_fingerprint = ?2
         WHERE id = ?1 AND schema_fingerprint = ''",
        params![version_id, fingerprint],
    )?;

    tracing::debug!(version_id, "Fingerprint backfilled");
    Ok(fingerprint)
}

/// One row of a dataset quality report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionQuality {
    pub version_number: i64,
    pub state: DatasetVersionState,
    pub quality_score: Option<f64>,
    pub null_percentage: f64,
    pub duplicate_count: i64,
    pub outlier_count: i64,
    pub row_count: i64,
}

/// Quality summary across a dataset's versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub dataset_id: String,
    pub version_count: i64,
    /// Mean quality score over ready versions that carry one
    pub average_quality_score: Option<f64>,
    pub versions: Vec<VersionQuality>,
}

/// Quality metrics per version plus the mean score over ready versions.
pub fn quality_report(conn: &Connection, dataset_id: &str) -> Result<QualityReport> {
    get_dataset(conn, dataset_id)?;

    let mut stmt = conn.prepare(
        "SELECT version_number, state, quality_score, null_percentage, duplicate_count,
                outlier_count, row_count
         FROM dataset_versions WHERE dataset_id = ?1 ORDER BY version_number",
    )?;
    let versions = stmt
        .query_map([dataset_id], |row| {
            let state: String = row.get(1)?;
            Ok(VersionQuality {
                version_number: row.get(0)?,
                state: state.parse().map_err(|e| column_parse_error(1, e))?,
                quality_score: row.get(2)?,
                null_percentage: row.get(3)?,
                duplicate_count: row.get(4)?,
                outlier_count: row.get(5)?,
                row_count: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let scored: Vec<f64> = versions
        .iter()
        .filter(|v| v.state == DatasetVersionState::Ready)
        .filter_map(|v| v.quality_score)
        .collect();
    let average_quality_score = if scored.is_empty() {
        None
    } else {
        Some(scored.iter().sum::<f64>() / scored.len() as f64)
    };

    Ok(QualityReport {
        dataset_id: dataset_id.to_string(),
        version_count: versions.len() as i64,
        average_quality_score,
        versions,
    })
}

/// Outcome of a proxied query, for the audit log.
#[derive(Debug, Clone, Default)]
pub struct QueryRecord {
    pub executed_by: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub rows_returned: Option<i64>,
    pub success: bool,
    pub error_message: String,
}

/// Record a query proxied to the Compute Engine against a version.
///
/// Only `ready` versions are queryable; a version still materializing or
/// failed has no table to query. The SQL is hashed so repeated queries can
/// be grouped without comparing full statements.
pub fn record_query(
    conn: &Connection,
    version_id: &str,
    query_sql: &str,
    record: &QueryRecord,
) -> Result<String> {
    let version = get_version_by_id(conn, version_id)?;

    if version.state != DatasetVersionState::Ready {
        return Err(EngineError::Conflict(format!(
            "Cannot query version in state {}",
            version.state
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO dataset_queries (id, dataset_version_id, query_sql, query_hash,
             executed_by, executed_at, execution_time_ms, rows_returned, success, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            version_id,
            query_sql,
            sha256_hex(query_sql),
            record.executed_by,
            Utc::now(),
            record.execution_time_ms,
            record.rows_returned,
            record.success,
            record.error_message,
        ],
    )?;

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        fluxline_core::init_engine(&conn, true).unwrap();
        conn
    }

    fn sample_dataset() -> NewDataset {
        NewDataset {
            name: "customers".to_string(),
            description: "Customer master data".to_string(),
            project_id: "proj-1".to_string(),
            visibility: Visibility::Project,
            tags: vec!["env:prod".to_string(), "pii".to_string()],
            created_by: Some("alice".to_string()),
        }
    }

    fn sample_version() -> NewDatasetVersion {
        NewDatasetVersion {
            schema: json!({
                "columns": [
                    {"name": "id", "type": "INTEGER", "nullable": false},
                    {"name": "email", "type": "VARCHAR", "nullable": true}
                ]
            }),
            storage_table_name: String::new(),
            created_by: Some("alice".to_string()),
            created_by_pipeline_id: None,
            change_description: "Initial load".to_string(),
        }
    }

    #[test]
    fn test_create_dataset_round_trip() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();

        assert_eq!(dataset.current_version, 0);
        assert_eq!(dataset.visibility, Visibility::Project);
        assert_eq!(dataset.tags, vec!["env:prod", "pii"]);
    }

    #[test]
    fn test_duplicate_name_in_project_conflicts() {
        let conn = test_conn();
        create_dataset(&conn, &sample_dataset()).unwrap();

        let err = create_dataset(&conn, &sample_dataset()).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // Same name in another project is fine
        let mut other = sample_dataset();
        other.project_id = "proj-2".to_string();
        assert!(create_dataset(&conn, &other).is_ok());
    }

    #[test]
    fn test_soft_delete_frees_name() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        soft_delete_dataset(&conn, &dataset.id).unwrap();

        assert!(create_dataset(&conn, &sample_dataset()).is_ok());
    }

    #[test]
    fn test_version_numbers_are_monotonic() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();

        let v1 = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        let v2 = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);
        assert_eq!(v1.state, DatasetVersionState::Creating);
        assert_eq!(v1.column_count, 2);
        assert!(!v1.storage_table_name.is_empty());

        // Creating versions never moves the pointer
        let dataset = get_dataset(&conn, &dataset.id).unwrap();
        assert_eq!(dataset.current_version, 0);
    }

    #[test]
    fn test_fingerprint_bound_at_creation() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();

        // Key order differs; fingerprints must not
        let mut a = sample_version();
        a.schema = json!({"columns": [{"name": "id", "type": "INTEGER", "nullable": false},
                                      {"name": "email", "type": "VARCHAR", "nullable": true}]});
        let mut b = sample_version();
        b.schema = json!({"columns": [{"nullable": false, "type": "INTEGER", "name": "id"},
                                      {"type": "VARCHAR", "name": "email", "nullable": true}]});

        let v1 = create_version(&conn, &dataset.id, &a).unwrap();
        let v2 = create_version(&conn, &dataset.id, &b).unwrap();
        assert_eq!(v1.schema_fingerprint, v2.schema_fingerprint);
        assert_eq!(v1.schema_fingerprint.len(), 64);
    }

    #[test]
    fn test_finalize_lifecycle() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        let version = create_version(&conn, &dataset.id, &sample_version()).unwrap();

        let quality = QualityMetrics {
            quality_score: Some(92.5),
            null_percentage: 1.2,
            duplicate_count: 4,
            outlier_count: 1,
            column_profiles: json!({"id": {"min": 1, "max": 5000}}),
        };
        let ready = finalize_version(&conn, &version.id, 5000, 123456, &quality).unwrap();
        assert_eq!(ready.state, DatasetVersionState::Ready);
        assert_eq!(ready.row_count, 5000);
        assert_eq!(ready.quality.quality_score, Some(92.5));

        // Finalizing twice is an invalid transition
        let err = finalize_version(&conn, &version.id, 5000, 123456, &quality).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[test]
    fn test_failed_version_stays_failed() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        let version = create_version(&conn, &dataset.id, &sample_version()).unwrap();

        mark_version_failed(&conn, &version.id).unwrap();

        let err =
            finalize_version(&conn, &version.id, 0, 0, &QualityMetrics::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[test]
    fn test_promotion_requires_ready() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        let version = create_version(&conn, &dataset.id, &sample_version()).unwrap();

        let err = set_current_version(&conn, &dataset.id, version.version_number).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        finalize_version(&conn, &version.id, 10, 100, &QualityMetrics::default()).unwrap();
        let dataset = set_current_version(&conn, &dataset.id, version.version_number).unwrap();
        assert_eq!(dataset.current_version, 1);
    }

    #[test]
    fn test_promotion_rejected_on_deleted_dataset() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        let version = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        finalize_version(&conn, &version.id, 10, 100, &QualityMetrics::default()).unwrap();

        soft_delete_dataset(&conn, &dataset.id).unwrap();

        // The version row is still there, but the dataset is gone; the
        // pointer update must not land anywhere
        let err = set_current_version(&conn, &dataset.id, 1).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_delete_version_guards() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        let v1 = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        finalize_version(&conn, &v1.id, 10, 100, &QualityMetrics::default()).unwrap();
        set_current_version(&conn, &dataset.id, 1).unwrap();

        // Only version
        let err = delete_version(&conn, &dataset.id, 1).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let v2 = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        finalize_version(&conn, &v2.id, 20, 200, &QualityMetrics::default()).unwrap();

        // Still the current version
        let err = delete_version(&conn, &dataset.id, 1).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // After promoting v2, v1 becomes deletable
        set_current_version(&conn, &dataset.id, 2).unwrap();
        delete_version(&conn, &dataset.id, 1).unwrap();

        let err = get_version(&conn, &dataset.id, 1).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_ensure_fingerprint_backfills_once() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        let version = create_version(&conn, &dataset.id, &sample_version()).unwrap();

        // Simulate a pre-fingerprint row
        conn.execute(
            "UPDATE dataset_versions SET schema_fingerprint = '' WHERE id = ?1",
            [&version.id],
        )
        .unwrap();

        let fp = ensure_fingerprint(&conn, &version.id).unwrap();
        assert_eq!(fp, version.schema_fingerprint);

        // Idempotent
        let fp2 = ensure_fingerprint(&conn, &version.id).unwrap();
        assert_eq!(fp, fp2);
    }

    #[test]
    fn test_quality_report_averages_ready_versions() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();

        let v1 = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        finalize_version(
            &conn,
            &v1.id,
            10,
            100,
            &QualityMetrics {
                quality_score: Some(80.0),
                ..Default::default()
            },
        )
        .unwrap();

        let v2 = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        finalize_version(
            &conn,
            &v2.id,
            20,
            200,
            &QualityMetrics {
                quality_score: Some(90.0),
                ..Default::default()
            },
        )
        .unwrap();

        // Unscored, still creating: excluded from the average
        create_version(&conn, &dataset.id, &sample_version()).unwrap();

        let report = quality_report(&conn, &dataset.id).unwrap();
        assert_eq!(report.version_count, 3);
        assert_eq!(report.average_quality_score, Some(85.0));
    }

    #[test]
    fn test_query_rejected_unless_ready() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        let version = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        let record = QueryRecord {
            success: true,
            ..Default::default()
        };

        // Still materializing
        let err = record_query(&conn, &version.id, "SELECT 1", &record).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // Failed versions have no table either
        let failed = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        mark_version_failed(&conn, &failed.id).unwrap();
        let err = record_query(&conn, &failed.id, "SELECT 1", &record).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // Once ready, queries are accepted
        finalize_version(&conn, &version.id, 10, 100, &QualityMetrics::default()).unwrap();
        assert!(record_query(&conn, &version.id, "SELECT 1", &record).is_ok());
    }

    #[test]
    fn test_record_query_hashes_sql() {
        let conn = test_conn();
        let dataset = create_dataset(&conn, &sample_dataset()).unwrap();
        let version = create_version(&conn, &dataset.id, &sample_version()).unwrap();
        finalize_version(&conn, &version.id, 10, 100, &QualityMetrics::default()).unwrap();

        let record = QueryRecord {
            executed_by: Some("alice".to_string()),
            execution_time_ms: Some(12),
            rows_returned: Some(3),
            success: true,
            error_message: String::new(),
        };
        record_query(&conn, &version.id, "SELECT * FROM t LIMIT 3", &record).unwrap();
        record_query(&conn, &version.id, "SELECT * FROM t LIMIT 3", &record).unwrap();

        let distinct: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT query_hash) FROM dataset_queries WHERE dataset_version_id = ?1",
                [&version.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(distinct, 1);
    }
}
