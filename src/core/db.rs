use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::FlowError;
use crate::core::schemas;

/// Handle to the pipeline database file. Connections are opened fresh per
/// operation scope (worker sweep, CLI command); SQLite WAL mode carries the
/// cross-process concurrency, there is no in-process pool.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> Result<Connection, FlowError> {
        db_connect(&self.path)
    }

    /// Create the database file (and parent directories) with all core tables.
    /// Pipeline tables are created separately by the table registry.
    pub fn initialize(&self) -> Result<Connection, FlowError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(FlowError::Io)?;
            }
        }
        let conn = self.connect()?;
        conn.execute_batch(schemas::WORKER_LOG_SCHEMA)?;
        conn.execute_batch(schemas::ERROR_LOG_SCHEMA)?;
        Ok(conn)
    }
}

pub fn db_connect(db_path: &Path) -> Result<Connection, FlowError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(FlowError::Sqlite)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(FlowError::Sqlite)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(FlowError::Sqlite)?;
    Ok(conn)
}
