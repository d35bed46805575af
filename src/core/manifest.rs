//! File manifest: logical remote paths resolved to local files.
//!
//! Acquisition files land under a remote prefix (`<org>/inbox/...`); the manifest
//! table maps each `remote_fullpath` to the local staged copy plus a checksum
//! taken at registration. Staging gates query it with SQL `LIKE` patterns to
//! decide whether every upstream artifact of a key exists yet.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::FlowError;
use crate::core::key::Key;
use crate::core::schemas::TableSpec;
use crate::core::store::{self, Predicate, Record};

pub static FILE_MANIFEST: TableSpec = TableSpec {
    name: "file_manifest",
    key_fields: &["remote_fullpath"],
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub remote_fullpath: String,
    pub local_path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

pub fn create_manifest_table(conn: &Connection) -> Result<(), FlowError> {
    crate::core::schemas::create_table(conn, &FILE_MANIFEST)
}

/// Register every regular file under `root`, keyed as `<prefix>/<relative path>`.
/// Re-registration overwrites nothing: an already-known remote path is skipped,
/// so the manifest only ever grows as new acquisition files arrive.
pub fn register_tree(conn: &Connection, root: &Path, prefix: &str) -> Result<usize, FlowError> {
    let mut entries = Vec::new();
    collect_files(root, &mut entries)?;
    let mut rows = Vec::with_capacity(entries.len());
    for local_path in entries {
        let rel = local_path
            .strip_prefix(root)
            .map_err(|_| FlowError::Validation(format!("path escapes root: {}", local_path.display())))?;
        let remote = format!("{}/{}", prefix.trim_end_matches('/'), rel.to_string_lossy().replace('\\', "/"));
        let bytes = fs::read(&local_path).map_err(FlowError::Io)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let entry = ManifestEntry {
            remote_fullpath: remote.clone(),
            local_path: local_path.clone(),
            sha256: format!("{:x}", hasher.finalize()),
            size: bytes.len() as u64,
        };
        rows.push(Record::with_payload(
            Key::new().with("remote_fullpath", remote),
            serde_json::to_value(&entry)?,
        ));
    }
    store::insert(conn, &FILE_MANIFEST, &rows, true)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), FlowError> {
    for entry in fs::read_dir(dir).map_err(FlowError::Io)? {
        let entry = entry.map_err(FlowError::Io)?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    out.sort();
    Ok(())
}

/// All manifest entries whose remote path matches the `LIKE` pattern.
pub fn resolve_like(conn: &Connection, pattern: &str) -> Result<Vec<ManifestEntry>, FlowError> {
    let records = store::fetch(
        conn,
        &FILE_MANIFEST,
        &Predicate::Like("remote_fullpath".to_string(), pattern.to_string()),
    )?;
    records
        .into_iter()
        .map(|r| serde_json::from_value(r.payload).map_err(FlowError::Json))
        .collect()
}

/// Local file for an exact remote path.
pub fn fetch_local(conn: &Connection, remote_fullpath: &str) -> Result<PathBuf, FlowError> {
    let record = store::fetch1(
        conn,
        &FILE_MANIFEST,
        &Key::new().with("remote_fullpath", remote_fullpath),
    )?;
    let entry: ManifestEntry = serde_json::from_value(record.payload)?;
    Ok(entry.local_path)
}
