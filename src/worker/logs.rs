//! Persistent worker and error logs.
//!
//! Every job sweep appends a worker_log row; every failed `make` appends an
//! error_log row carrying the job id, the key that failed, and the rendered
//! error. Both are append-only audit trails; the error log is additionally what
//! the autoclear machinery matches its patterns against. Each append is echoed
//! to stdout as a JSON line so a worker process can be tailed.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::core::error::FlowError;
use crate::core::key::Key;
use crate::core::time;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: String,
    pub ts: String,
    pub worker: String,
    pub job_id: String,
    pub key_json: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLogEntry {
    pub id: String,
    pub ts: String,
    pub worker: String,
    pub job_id: String,
    pub status: String,
    pub key_count: i64,
}

pub fn log_error(
    conn: &Connection,
    worker: &str,
    job_id: &str,
    key: &Key,
    message: &str,
) -> Result<ErrorLogEntry, FlowError> {
    let entry = ErrorLogEntry {
        id: Ulid::new().to_string(),
        ts: time::now_epoch_z(),
        worker: worker.to_string(),
        job_id: job_id.to_string(),
        key_json: serde_json::to_string(key)?,
        message: message.to_string(),
    };
    conn.execute(
        "INSERT INTO error_log (id, ts, worker, job_id, key_json, message) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![entry.id, entry.ts, entry.worker, entry.job_id, entry.key_json, entry.message],
    )?;
    println!(
        "{}",
        serde_json::json!({
            "ts": entry.ts,
            "event": "job.error",
            "worker": entry.worker,
            "job": entry.job_id,
            "key": entry.key_json,
            "message": entry.message,
        })
    );
    Ok(entry)
}

pub fn log_worker_event(
    conn: &Connection,
    worker: &str,
    job_id: &str,
    status: &str,
    key_count: usize,
) -> Result<(), FlowError> {
    let ts = time::now_epoch_z();
    conn.execute(
        "INSERT INTO worker_log (id, ts, worker, job_id, status, key_count) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            Ulid::new().to_string(),
            ts,
            worker,
            job_id,
            status,
            key_count as i64
        ],
    )?;
    Ok(())
}

pub fn list_errors(conn: &Connection, job_id: Option<&str>) -> Result<Vec<ErrorLogEntry>, FlowError> {
    let mut sql =
        "SELECT id, ts, worker, job_id, key_json, message FROM error_log".to_string();
    if job_id.is_some() {
        sql.push_str(" WHERE job_id = ?1");
    }
    sql.push_str(" ORDER BY ts, id");
    let mut stmt = conn.prepare(&sql)?;
    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(ErrorLogEntry {
            id: row.get(0)?,
            ts: row.get(1)?,
            worker: row.get(2)?,
            job_id: row.get(3)?,
            key_json: row.get(4)?,
            message: row.get(5)?,
        })
    };
    let rows = match job_id {
        Some(id) => stmt.query_map([id], map_row)?,
        None => stmt.query_map([], map_row)?,
    };
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn clear_errors(conn: &Connection, job_id: Option<&str>) -> Result<usize, FlowError> {
    let deleted = match job_id {
        Some(id) => conn.execute("DELETE FROM error_log WHERE job_id = ?1", [id])?,
        None => conn.execute("DELETE FROM error_log", [])?,
    };
    Ok(deleted)
}
