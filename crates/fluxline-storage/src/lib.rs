//! Fluxline Engine Storage
//!
//! Durable-store abstraction for the engine. The engine core only assumes a
//! store with unique-constraint semantics and atomic conditional updates;
//! this crate supplies the local SQLite implementation.

use fluxline_core::{init_engine_schema, EngineError, Result};
use rusqlite::Connection;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// Convenience alias for trait objects.
pub type DynStoreBackend = dyn StoreBackend;

/// Backend abstraction for the engine store (async).
///
/// # Safety
///
/// Never hold `rusqlite::Connection` across `.await` points; it is !Send.
/// All SQLite work goes through `tokio::task::spawn_blocking`.
///
/// # Manual Async Trait
///
/// Uses manual async (`Pin<Box<dyn Future>>`) instead of the async-trait
/// crate for zero-cost abstraction and explicit Send bounds.
pub trait StoreBackend: Send + Sync {
    /// Get a connection to the store.
    ///
    /// Use the connection immediately; do not hold it across await points.
    fn get_connection(&self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + '_>>;

    /// Check if the store exists.
    fn exists(&self) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Initialize a new store (create the database file and schema).
    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Parsed representation of a store URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Local(PathBuf),
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Local(path) => write!(f, "file://{}", path.display()),
        }
    }
}

/// Parse a store URI into a structured location.
///
/// Accepts `file://` URIs and raw paths.
pub fn parse_store_uri(uri: &str) -> Result<StoreLocation> {
    let path = uri
        .strip_prefix("file://")
        .map(|p| p.to_string())
        .unwrap_or_else(|| uri.to_string());

    // Validate file:// paths for traversal and null bytes
    if uri.starts_with("file://") {
        fluxline_core::validation::validate_store_path(&path)?;
    }

    Ok(StoreLocation::Local(PathBuf::from(path)))
}

/// Build a backend from a store URI.
pub fn backend_from_uri(uri: &str) -> Result<Box<dyn StoreBackend>> {
    match parse_store_uri(uri)? {
        StoreLocation::Local(path) => Ok(Box::new(LocalSqliteBackend::new(path))),
    }
}

/// Build a backend from the `FLUXLINE_STORE` environment variable,
/// falling back to `fluxline.db` in the working directory.
pub fn backend_from_env() -> Result<Box<dyn StoreBackend>> {
    let uri = std::env::var("FLUXLINE_STORE").unwrap_or_else(|_| "fluxline.db".to_string());
    tracing::info!(store = %uri, "Using engine store");
    backend_from_uri(&uri)
}

/// Local filesystem SQLite backend.
#[derive(Clone, Debug)]
pub struct LocalSqliteBackend {
    /// Path to the SQLite database file
    path: PathBuf,
}

impl LocalSqliteBackend {
    /// Create a new local SQLite backend.
    ///
    /// # Example
    /// ```no_run
    /// use fluxline_storage::LocalSqliteBackend;
    ///
    /// let backend = LocalSqliteBackend::new("fluxline.db");
    /// ```
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreBackend for LocalSqliteBackend {
    fn get_connection(&self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + '_>> {
        let path = self.path.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&path)?;

                conn.execute_batch("PRAGMA foreign_keys = ON;")?;

                // Initialize schema if needed
                init_engine_schema(&conn)?;

                Ok(conn)
            })
            .await
            .map_err(|e| EngineError::Other(format!("Task join error: {}", e)))?
        })
    }

    fn exists(&self) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let path = self.path.clone();
        Box::pin(async move { Ok(path.exists()) })
    }

    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let path = self.path.clone();
        Box::pin(async move {
            if path.exists() {
                return Err(EngineError::Other(format!(
                    "Store already exists at {:?}",
                    path
                )));
            }

            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&path)?;
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                init_engine_schema(&conn)?;
                fluxline_core::migrations::run_migrations(&conn)?;

                Ok(())
            })
            .await
            .map_err(|e| EngineError::Other(format!("Task join error: {}", e)))?
        })
    }
}

/// In-memory SQLite backend for tests and ephemeral runs.
///
/// Each `get_connection` call opens a fresh, empty database; callers that
/// need shared state across connections should use `LocalSqliteBackend`
/// with a temp file instead.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBackend;

impl StoreBackend for InMemoryBackend {
    fn get_connection(&self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + '_>> {
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open_in_memory()?;
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                init_engine_schema(&conn)?;
                fluxline_core::migrations::run_migrations(&conn)?;
                Ok(conn)
            })
            .await
            .map_err(|e| EngineError::Other(format!("Task join error: {}", e)))?
        })
    }

    fn exists(&self) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(async move { Ok(true) })
    }

    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { Ok(()) })
    }
}
