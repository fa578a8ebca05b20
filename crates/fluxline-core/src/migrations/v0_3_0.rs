//! Migration v0.3.0: Query audit log.
//!
//! Adds the `dataset_queries` table: every query proxied to the Compute
//! Engine is recorded with its SQL, a SHA-256 hash for deduplication, the
//! executing actor, timing, and outcome.

use super::Migration;

pub const VERSION: i64 = 3_000;

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v0.3.0: Query audit log",
        sql: SQL,
        add_columns: &[],
    }
}

const SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dataset_queries (
  id TEXT PRIMARY KEY,
  dataset_version_id TEXT NOT NULL,
  query_sql TEXT NOT NULL,
  query_hash TEXT NOT NULL,
  executed_by TEXT,
  executed_at TEXT NOT NULL,
  execution_time_ms INTEGER,
  rows_returned INTEGER,
  success INTEGER NOT NULL DEFAULT 1,
  error_message TEXT NOT NULL DEFAULT '',
  FOREIGN KEY (dataset_version_id) REFERENCES dataset_versions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_dataset_queries_version
  ON dataset_queries(dataset_version_id, executed_at);
CREATE INDEX IF NOT EXISTS idx_dataset_queries_hash ON dataset_queries(query_hash);
"#;
