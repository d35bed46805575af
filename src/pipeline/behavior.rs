//! Session registration and behavioral trial ingestion.
//!
//! Sessions arrive as a roster CSV (`subject, session_id, session_datetime,
//! session_dir`) maintained by the acquisition hosts; registering one inserts a
//! `session` row and its `session_directory` row. Trial ingestion is the first
//! gated populate stage: once the gate has staged a session's behavior exports,
//! the per-trial summary table is read and one `behavior_trial` row per trial is
//! inserted under a `behavior_ingestion` master.

use rusqlite::Connection;
use std::fs;
use std::path::Path;

use crate::core::error::FlowError;
use crate::core::key::Key;
use crate::core::store::{self, Record};
use crate::pipeline::{
    self, BEHAVIOR_INGESTION, BEHAVIOR_TRIAL, PRE_BEHAVIOR, PRE_BEHAVIOR_GATE, SESSION,
    SESSION_DIRECTORY,
};
use crate::worker::job::{JobContext, JobDescriptor, KeySource};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub subject: String,
    pub session_id: i64,
    pub session_datetime: String,
    pub session_dir: String,
}

/// Parse the session roster CSV. Text columns, so this does not go through the
/// numeric table reader.
pub fn load_sessions_csv(path: &Path) -> Result<Vec<SessionRow>, FlowError> {
    let raw = fs::read_to_string(path).map_err(FlowError::Io)?;
    parse_sessions(&raw, path)
}

fn parse_sessions(raw: &str, path: &Path) -> Result<Vec<SessionRow>, FlowError> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| FlowError::Validation(format!("empty roster: {}", path.display())))?;
    let names: Vec<&str> = header.split(',').map(|s| s.trim()).collect();
    let col = |name: &str| -> Result<usize, FlowError> {
        names.iter().position(|n| *n == name).ok_or_else(|| {
            FlowError::Validation(format!("{}: roster has no '{}' column", path.display(), name))
        })
    };
    let (c_subj, c_id, c_dt, c_dir) = (
        col("subject")?,
        col("session_id")?,
        col("session_datetime")?,
        col("session_dir")?,
    );

    let mut rows = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if cells.len() != names.len() {
            return Err(FlowError::Validation(format!(
                "{}: row {} has {} cells, header has {}",
                path.display(),
                line_no + 2,
                cells.len(),
                names.len()
            )));
        }
        let session_id = cells[c_id].parse::<i64>().map_err(|_| {
            FlowError::Validation(format!(
                "{}: row {} has non-integer session_id '{}'",
                path.display(),
                line_no + 2,
                cells[c_id]
            ))
        })?;
        rows.push(SessionRow {
            subject: cells[c_subj].to_string(),
            session_id,
            session_datetime: cells[c_dt].to_string(),
            session_dir: cells[c_dir].to_string(),
        });
    }
    Ok(rows)
}

/// Register sessions, skipping any already known. Returns how many were new.
pub fn ingest_sessions(conn: &Connection, rows: &[SessionRow]) -> Result<usize, FlowError> {
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0usize;
    for row in rows {
        let key = Key::new()
            .with("subject", row.subject.as_str())
            .with("session_id", row.session_id);
        inserted += store::insert(
            &tx,
            &SESSION,
            &[Record::with_payload(
                key.clone(),
                serde_json::json!({ "session_datetime": row.session_datetime }),
            )],
            true,
        )?;
        store::insert(
            &tx,
            &SESSION_DIRECTORY,
            &[Record::with_payload(
                key,
                serde_json::json!({ "session_dir": row.session_dir }),
            )],
            true,
        )?;
    }
    tx.commit()?;
    Ok(inserted)
}

/// One `behavior_trial` row per row of the session's trial summary table.
pub fn behavior_ingestion_make(ctx: &JobContext<'_>, key: &Key) -> Result<(), FlowError> {
    let dir = pipeline::session_dir(ctx, key)?;
    let prefix = ctx.config.remote_session_prefix(&dir);
    let trial_path =
        pipeline::resolve_required_file(ctx.conn, &format!("{}/%trial.csv", prefix))?;
    let trials = ctx.readers.read_table(&trial_path)?;

    let trial_ids = trials.column("nTrial")?;
    let mut rows = Vec::with_capacity(trials.len());
    for row in 0..trials.len() {
        let mut payload = serde_json::Map::new();
        for name in trials.names() {
            if name == "nTrial" {
                continue;
            }
            let v = trials.get(name, row)?;
            payload.insert(
                name.clone(),
                serde_json::Number::from_f64(v)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            );
        }
        rows.push(Record::with_payload(
            key.clone().with("trial_id", trial_ids[row] as i64),
            serde_json::Value::Object(payload),
        ));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    store::insert(&tx, &BEHAVIOR_INGESTION, &[Record::new(key.clone())], false)?;
    store::insert(&tx, &BEHAVIOR_TRIAL, &rows, false)?;
    tx.commit()?;
    Ok(())
}

pub fn behavior_ingestion_job() -> JobDescriptor {
    JobDescriptor::new(
        "behavior.ingestion",
        &BEHAVIOR_INGESTION,
        KeySource::table(&SESSION_DIRECTORY).semi_join(&PRE_BEHAVIOR),
        Box::new(behavior_ingestion_make),
    )
    .with_staging(&PRE_BEHAVIOR_GATE)
}
