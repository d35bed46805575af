//! Table shapes and SQL schemas.
//!
//! Keyed record tables all share one shape: the key fields as real columns (so
//! the primary key enforces per-key uniqueness, which is the only cross-process
//! mutual exclusion in the system) plus a JSON `payload` column for everything
//! else. Their DDL is generated from a [`TableSpec`]. The worker/error logs have
//! their own handwritten schemas because their columns are queried individually.

use rusqlite::Connection;

use crate::core::error::FlowError;

/// Declaration of one keyed record table: name plus ordered key fields.
#[derive(Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub key_fields: &'static [&'static str],
}

impl TableSpec {
    /// Key fields shared with another table, in this table's order. Along a
    /// foreign-key chain this is the upstream key.
    pub fn common_key_fields(&self, other: &TableSpec) -> Vec<&'static str> {
        self.key_fields
            .iter()
            .filter(|f| other.key_fields.contains(f))
            .copied()
            .collect()
    }
}

/// `CREATE TABLE IF NOT EXISTS` for a keyed record table.
pub fn create_table(conn: &Connection, spec: &TableSpec) -> Result<(), FlowError> {
    let cols: Vec<String> = spec
        .key_fields
        .iter()
        .map(|f| format!("\"{}\" NOT NULL", f))
        .collect();
    let pk = spec
        .key_fields
        .iter()
        .map(|f| format!("\"{}\"", f))
        .collect::<Vec<_>>()
        .join(", ");
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({}, payload TEXT NOT NULL DEFAULT '{{}}', PRIMARY KEY ({}));",
        spec.name,
        cols.join(", "),
        pk
    );
    conn.execute(&ddl, [])?;
    Ok(())
}

pub const WORKER_LOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS worker_log (
    id          TEXT PRIMARY KEY,
    ts          TEXT NOT NULL,
    worker      TEXT NOT NULL,
    job_id      TEXT NOT NULL,
    status      TEXT NOT NULL,
    key_count   INTEGER NOT NULL DEFAULT 0
);
";

pub const ERROR_LOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS error_log (
    id          TEXT PRIMARY KEY,
    ts          TEXT NOT NULL,
    worker      TEXT NOT NULL,
    job_id      TEXT NOT NULL,
    key_json    TEXT NOT NULL,
    message     TEXT NOT NULL
);
";
