//! Lineage Tracker.
//!
//! Records where each dataset version came from. An edge names exactly one
//! upstream contributor: a raw data source, the pipeline run that produced
//! the version, or another dataset version it read. The sum type here and
//! the CHECK constraint in the schema enforce the same rule from both
//! sides; a mismatched kind never reaches the store.

use chrono::{DateTime, Utc};
use fluxline_core::{EngineError, LineageKind, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::datasets;
use crate::{column_parse_error, json_column};

/// One upstream contributor of a dataset version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LineageSource {
    /// Raw external source, by data-source id
    DataSource(String),
    /// Pipeline whose run produced the version
    Pipeline(String),
    /// Another dataset version that was read
    Dataset(String),
}

impl LineageSource {
    pub fn kind(&self) -> LineageKind {
        match self {
            LineageSource::DataSource(_) => LineageKind::Source,
            LineageSource::Pipeline(_) => LineageKind::Pipeline,
            LineageSource::Dataset(_) => LineageKind::Dataset,
        }
    }

    /// Reassemble a source from its stored columns.
    ///
    /// The kind column and the populated reference must agree; a kind that
    /// points at an unset reference is a validation error, not a silent
    /// fallback to another column.
    pub fn from_parts(
        kind: LineageKind,
        data_source_id: Option<String>,
        pipeline_id: Option<String>,
        dataset_version_id: Option<String>,
    ) -> Result<Self> {
        match kind {
            LineageKind::Source => data_source_id.map(LineageSource::DataSource).ok_or_else(|| {
                EngineError::Validation(
                    "Lineage kind 'source' requires a data source reference".to_string(),
                )
            }),
            LineageKind::Pipeline => pipeline_id.map(LineageSource::Pipeline).ok_or_else(|| {
                EngineError::Validation(
                    "Lineage kind 'pipeline' requires a pipeline reference".to_string(),
                )
            }),
            LineageKind::Dataset => {
                dataset_version_id.map(LineageSource::Dataset).ok_or_else(|| {
                    EngineError::Validation(
                        "Lineage kind 'dataset' requires a dataset version reference".to_string(),
                    )
                })
            }
        }
    }

    fn columns(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        match self {
            LineageSource::DataSource(id) => (Some(id.as_str()), None, None),
            LineageSource::Pipeline(id) => (None, Some(id.as_str()), None),
            LineageSource::Dataset(id) => (None, None, Some(id.as_str())),
        }
    }
}

/// A recorded lineage edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEdge {
    pub id: i64,
    /// The version this edge describes (the downstream end)
    pub dataset_version_id: String,
    pub source: LineageSource,
    /// Free-form context, e.g. the transform steps applied
    pub transformation_details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

fn edge_from_row(row: &Row) -> rusqlite::Result<LineageEdge> {
    let kind_raw: String = row.get(2)?;
    let kind: LineageKind = kind_raw.parse().map_err(|e| column_parse_error(2, e))?;
    let source = LineageSource::from_parts(kind, row.get(3)?, row.get(4)?, row.get(5)?)
        .map_err(|e| column_parse_error(2, e))?;
    Ok(LineageEdge {
        id: row.get(0)?,
        dataset_version_id: row.get(1)?,
        source,
        transformation_details: json_column(6, row.get(6)?)?,
        created_at: row.get(7)?,
    })
}

const EDGE_COLUMNS: &str = "id, dataset_version_id, source_type, source_data_source_id, \
     source_pipeline_id, source_dataset_version_id, transformation_details, created_at";

/// Record a lineage edge for a dataset version.
///
/// The downstream version must exist. Multiple edges per version are fine
/// (fan-in); each edge still names exactly one contributor.
pub fn record_edge(
    conn: &Connection,
    dataset_version_id: &str,
    source: &LineageSource,
    transformation_details: &serde_json::Value,
) -> Result<LineageEdge> {
    datasets::get_version_by_id(conn, dataset_version_id)?;

    let (data_source_id, pipeline_id, upstream_version_id) = source.columns();
    conn.execute(
        "INSERT INTO dataset_lineage (dataset_version_id, source_type, source_data_source_id,
             source_pipeline_id, source_dataset_version_id, transformation_details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            dataset_version_id,
            source.kind().as_str(),
            data_source_id,
            pipeline_id,
            upstream_version_id,
            transformation_details.to_string(),
            Utc::now(),
        ],
    )?;
    let edge_id = conn.last_insert_rowid();

    tracing::debug!(
        dataset_version_id,
        kind = %source.kind(),
        "Lineage edge recorded"
    );

    conn.query_row(
        &format!("SELECT {} FROM dataset_lineage WHERE id = ?1", EDGE_COLUMNS),
        [edge_id],
        edge_from_row,
    )
    .map_err(EngineError::from)
}

/// Direct upstream edges of one dataset version.
pub fn edges_for_version(conn: &Connection, dataset_version_id: &str) -> Result<Vec<LineageEdge>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM dataset_lineage WHERE dataset_version_id = ?1 ORDER BY id",
        EDGE_COLUMNS
    ))?;
    let rows = stmt.query_map([dataset_version_id], edge_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Direct downstream edges: versions that read this one.
pub fn edges_from_version(conn: &Connection, dataset_version_id: &str) -> Result<Vec<LineageEdge>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM dataset_lineage WHERE source_dataset_version_id = ?1 ORDER BY id",
        EDGE_COLUMNS
    ))?;
    let rows = stmt.query_map([dataset_version_id], edge_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Full upstream closure of a dataset version.
///
/// Walks dataset-to-dataset edges breadth-first, collecting every edge on
/// the way; source and pipeline contributors terminate their branch. A
/// visited set guards against cycles in hand-recorded lineage.
pub fn ancestors_of(conn: &Connection, dataset_version_id: &str) -> Result<Vec<LineageEdge>> {
    let mut edges = Vec::new();
    let mut visited = std::collections::HashSet::new();
    let mut frontier = std::collections::VecDeque::new();
    frontier.push_back(dataset_version_id.to_string());

    while let Some(version_id) = frontier.pop_front() {
        if !visited.insert(version_id.clone()) {
            continue;
        }
        for edge in edges_for_version(conn, &version_id)? {
            if let LineageSource::Dataset(upstream) = &edge.source {
                frontier.push_back(upstream.clone());
            }
            edges.push(edge);
        }
    }

    Ok(edges)
}
