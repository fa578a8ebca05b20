//! Schema migration framework for the Fluxline engine store.
//!
//! Versioned, idempotent, forward-only migrations tracked in a dedicated
//! `schema_migrations` table. Each migration runs in its own transaction and
//! an advisory lock keeps concurrent migrators out (stale locks older than
//! five minutes are reclaimed).
//!
//! Migrations should be run by a single actor during deployment; request
//! handlers call `init_engine(conn, false)` and never migrate on startup.

use crate::{EngineError, Result};
use rusqlite::Connection;

mod v0_2_0;
mod v0_3_0;

/// Migration version number.
pub type MigrationVersion = i64;

/// A schema migration.
pub struct Migration {
    /// Version number (unique, monotonically increasing)
    pub version: MigrationVersion,
    /// Human-readable description
    pub description: &'static str,
    /// SQL to execute (must be idempotent)
    pub sql: &'static str,
    /// Columns to add after SQL execution (table, column, type).
    /// SQLite has no IF NOT EXISTS for ADD COLUMN, so these go through
    /// a PRAGMA-guarded helper.
    pub add_columns: &'static [(&'static str, &'static str, &'static str)],
}

/// All available migrations in order.
/// Add new migrations to the end of this array.
pub fn all_migrations() -> Vec<Migration> {
    vec![v0_2_0::migration(), v0_3_0::migration()]
}

/// Initialize the migrations tracking table with advisory lock support.
fn init_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS migration_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            locked_at TEXT,
            locked_by TEXT
        );

        INSERT OR IGNORE INTO migration_lock (id, locked_at, locked_by) VALUES (1, NULL, NULL);
        "#,
    )?;
    Ok(())
}

/// Check if a column exists in a table.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}

/// Add a column to a table if missing (idempotent).
fn add_column_if_not_exists(
    conn: &Connection,
    table: &str,
    column: &str,
    column_type: &str,
) -> Result<bool> {
    if column_exists(conn, table, column)? {
        tracing::debug!(table, column, "Column already exists, skipping");
        return Ok(false);
    }

    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type);
    conn.execute(&sql, [])?;
    tracing::info!(table, column, column_type, "Added column");
    Ok(true)
}

/// Acquire the migration advisory lock.
fn acquire_migration_lock(conn: &Connection) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE migration_lock SET locked_at = datetime('now'), locked_by = 'migration'
         WHERE id = 1 AND (locked_at IS NULL OR locked_at < datetime('now', '-5 minutes'))",
        [],
    )?;
    Ok(rows > 0)
}

/// Release the migration advisory lock.
fn release_migration_lock(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE migration_lock SET locked_at = NULL, locked_by = NULL WHERE id = 1",
        [],
    )?;
    Ok(())
}

/// Get the current schema version (highest applied migration).
pub fn get_schema_version(conn: &Connection) -> Result<MigrationVersion> {
    init_migrations_table(conn)?;

    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .ok()
        .flatten();

    Ok(version.unwrap_or(0))
}

/// Check if a specific migration has been applied.
pub fn is_migration_applied(conn: &Connection, version: MigrationVersion) -> Result<bool> {
    init_migrations_table(conn)?;

    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
        [version],
        |row| row.get(0),
    )?;

    Ok(count > 0)
}

/// Run all pending migrations.
///
/// Idempotent; each migration runs in its own transaction. Returns the
/// number of migrations applied. Fails with `Other` when another process
/// holds the (non-stale) advisory lock.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    init_migrations_table(conn)?;

    if !acquire_migration_lock(conn)? {
        return Err(EngineError::Other(
            "Another migration is in progress. Wait and retry.".to_string(),
        ));
    }

    let result = run_migrations_inner(conn);

    if let Err(e) = release_migration_lock(conn) {
        tracing::warn!("Failed to release migration lock: {}", e);
    }

    result
}

fn run_migrations_inner(conn: &Connection) -> Result<usize> {
    let migrations = all_migrations();
    let mut applied_count = 0;

    for migration in migrations {
        if is_migration_applied(conn, migration.version)? {
            tracing::debug!(
                version = migration.version,
                description = migration.description,
                "Migration already applied, skipping"
            );
            continue;
        }

        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applying migration"
        );

        let tx = conn.unchecked_transaction()?;

        tx.execute_batch(migration.sql).map_err(|e| {
            EngineError::Other(format!("Migration {} failed: {}", migration.version, e))
        })?;

        tx.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, datetime('now'))",
            rusqlite::params![migration.version, migration.description],
        )?;

        tx.commit()?;

        // Column additions run outside the transaction (ALTER TABLE commits implicitly)
        for (table, column, col_type) in migration.add_columns {
            add_column_if_not_exists(conn, table, column, col_type)?;
        }

        applied_count += 1;
    }

    Ok(applied_count)
}

/// Get applied migrations with their timestamps.
pub fn get_migration_history(conn: &Connection) -> Result<Vec<(MigrationVersion, String, String)>> {
    init_migrations_table(conn)?;

    let mut stmt = conn.prepare(
        "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Check if the schema needs migration.
pub fn needs_migration(conn: &Connection) -> Result<bool> {
    let current = get_schema_version(conn)?;
    let migrations = all_migrations();
    let latest = migrations.last().map(|m| m.version).unwrap_or(0);
    Ok(current < latest)
}
