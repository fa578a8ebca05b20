//! Migration v0.2.0: Resource estimates.
//!
//! Adds the Compute Engine resource-estimate columns to `pipelines`. The
//! estimates are advisory (populated by `estimate_resources`) and nullable,
//! so existing rows keep working.

use super::Migration;

/// Version number: MAJOR * 1_000_000 + MINOR * 1_000 + PATCH
pub const VERSION: i64 = 2_000;

const ADD_COLUMNS: &[(&str, &str, &str)] = &[
    ("pipelines", "estimated_memory_mb", "INTEGER"),
    ("pipelines", "estimated_cpu_percent", "INTEGER"),
    ("pipelines", "estimated_duration_seconds", "INTEGER"),
    ("pipelines", "estimated_row_count", "INTEGER"),
];

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v0.2.0: Resource estimates",
        sql: SQL,
        add_columns: ADD_COLUMNS,
    }
}

const SQL: &str = r#"
-- Resource estimate columns are added via add_columns (no IF NOT EXISTS
-- for ADD COLUMN in SQLite).
"#;
