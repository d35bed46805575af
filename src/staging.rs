//! Prepare-table staging gates.
//!
//! A gate marks an upstream key as ready for its populate job only once every
//! required acquisition file is present in the manifest. Discovery is atomic:
//! either all file references resolve and the master row plus one file row per
//! artifact are inserted in a single transaction, or nothing is. `clean_up`
//! reconciles staged-but-never-populated keys back out of the gate so a crashed
//! or failed populate attempt is rediscovered and retried.

use rusqlite::Connection;

use crate::core::error::FlowError;
use crate::core::key::Key;
use crate::core::manifest;
use crate::core::schemas::TableSpec;
use crate::core::store::{self, Record};
use crate::worker::job::{JobContext, JobDescriptor, KeySource, MakeFn};

/// Derives the manifest `LIKE` patterns whose matches must all exist before the
/// key is staged. One pattern per required artifact.
pub type RequiredFiles = fn(&JobContext<'_>, &Key) -> Result<Vec<String>, FlowError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Staged (or already staged): the downstream job may run.
    Eligible,
    /// At least one required artifact is missing. Silent and expected; the key
    /// is simply retried on a later sweep.
    NotFound,
}

pub struct StagingGate {
    /// Gate name, used as the discovery job id (`staging.<name>`).
    pub name: &'static str,
    /// Upstream table supplying candidate keys.
    pub source: &'static TableSpec,
    /// Master pre-table (same key fields as `source`).
    pub staging: &'static TableSpec,
    /// File part table: `staging` key fields + `file_idx`; payload carries the
    /// matched manifest `remote_fullpath`.
    pub files: &'static TableSpec,
    /// Downstream populate table this gate guards.
    pub populate: &'static TableSpec,
    pub required: RequiredFiles,
}

impl StagingGate {
    /// Check every required pattern against the manifest and stage the key if
    /// all resolve. Re-running for an already-staged key is a no-op.
    pub fn discover(&self, ctx: &JobContext<'_>, key: &Key) -> Result<Discovery, FlowError> {
        if store::exists(ctx.conn, self.staging, key)? {
            return Ok(Discovery::Eligible);
        }

        let patterns = (self.required)(ctx, key)?;
        let mut file_rows: Vec<Record> = Vec::new();
        for pattern in &patterns {
            let matches = manifest::resolve_like(ctx.conn, pattern)?;
            if matches.is_empty() {
                // All-or-nothing: zero rows inserted when any artifact is absent.
                return Ok(Discovery::NotFound);
            }
            for entry in matches {
                let idx = file_rows.len() as i64;
                file_rows.push(Record::with_payload(
                    key.clone().with("file_idx", idx),
                    serde_json::json!({ "remote_fullpath": entry.remote_fullpath }),
                ));
            }
        }

        let tx = ctx.conn.unchecked_transaction()?;
        store::insert(&tx, self.staging, &[Record::new(key.clone())], false)?;
        store::insert(&tx, self.files, &file_rows, false)?;
        tx.commit()?;
        Ok(Discovery::Eligible)
    }

    /// Delete staging entries whose populate row never materialized. Entries
    /// only disappear here, never reappear incorrectly, so the delete-after-read
    /// race with a concurrent worker is benign. Idempotent.
    pub fn clean_up(&self, conn: &Connection) -> Result<usize, FlowError> {
        let orphaned = store::difference(
            conn,
            self.staging,
            self.populate,
            &store::Predicate::True,
        )?;
        if orphaned.is_empty() {
            return Ok(0);
        }
        let tx = conn.unchecked_transaction()?;
        store::delete(&tx, self.files, &orphaned)?;
        let deleted = store::delete(&tx, self.staging, &orphaned)?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Remove one key's staging entry (autoclear path: the error told us the
    /// missing file will never appear, so stop offering the key for retry).
    pub fn purge(&self, conn: &Connection, key: &Key) -> Result<(), FlowError> {
        let staged = key.project(self.staging.key_fields)?;
        let tx = conn.unchecked_transaction()?;
        store::delete(&tx, self.files, std::slice::from_ref(&staged))?;
        store::delete(&tx, self.staging, std::slice::from_ref(&staged))?;
        tx.commit()?;
        Ok(())
    }

    /// Discovery as a schedulable job: key source is `source − staging`, target
    /// is the staging table itself, `make` runs one discovery.
    pub fn as_job(&'static self, max_calls: Option<usize>) -> JobDescriptor {
        let make: MakeFn = Box::new(move |ctx, key| self.discover(ctx, key).map(|_| ()));
        JobDescriptor {
            id: format!("staging.{}", self.name),
            target: self.staging,
            key_source: KeySource::table(self.source),
            make,
            max_calls,
            staging: None,
        }
    }
}
