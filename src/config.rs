//! Process configuration.
//!
//! One explicit struct, loaded from a TOML file at startup and passed by
//! reference into the worker and staging constructors. Environment variables
//! override the file the same way the acquisition hosts configure their
//! deployments; no component reads ambient global state after construction.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::FlowError;

pub const DEFAULT_SLEEP_DURATION_SECS: u64 = 30;
pub const RUN_FOREVER: i64 = -1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Pipeline database file.
    pub db_path: PathBuf,
    /// Local root under which acquisition sessions are staged.
    pub raw_root_data_dir: PathBuf,
    /// Root for derived artifacts; optional because ingest-only hosts have none.
    pub processed_root_data_dir: Option<PathBuf>,
    /// Remote prefix the manifest keys files under, e.g. `lab_photometry/inbox`.
    pub inbox_prefix: String,
    /// LIKE-style patterns matched against error messages; a hit purges the
    /// staging entry instead of retrying forever.
    #[serde(default = "default_autoclear_patterns")]
    pub autoclear_error_patterns: Vec<String>,
    #[serde(default = "default_sleep_duration")]
    pub sleep_duration_secs: u64,
    /// Wall-clock bound for `worker run`; -1 runs forever.
    #[serde(default = "default_run_duration")]
    pub run_duration_secs: i64,
}

fn default_autoclear_patterns() -> Vec<String> {
    vec!["%MissingInput%".to_string(), "%FileNotFound%".to_string()]
}

fn default_sleep_duration() -> u64 {
    DEFAULT_SLEEP_DURATION_SECS
}

fn default_run_duration() -> i64 {
    RUN_FOREVER
}

impl FlowConfig {
    /// A workable default rooted at `root`: database and raw data side by side.
    pub fn default_at(root: &Path) -> Self {
        Self {
            db_path: root.join("fiberflow.db"),
            raw_root_data_dir: root.join("inbox"),
            processed_root_data_dir: Some(root.join("outbox")),
            inbox_prefix: "fiberflow/inbox".to_string(),
            autoclear_error_patterns: default_autoclear_patterns(),
            sleep_duration_secs: DEFAULT_SLEEP_DURATION_SECS,
            run_duration_secs: RUN_FOREVER,
        }
    }

    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let raw = fs::read_to_string(path).map_err(FlowError::Io)?;
        let mut config: FlowConfig =
            toml::from_str(&raw).map_err(|e| FlowError::Toml(e.to_string()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), FlowError> {
        let raw = toml::to_string_pretty(self).map_err(|e| FlowError::Toml(e.to_string()))?;
        fs::write(path, raw).map_err(FlowError::Io)?;
        Ok(())
    }

    /// Deployment overrides, mirroring the acquisition-host environment names.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("RAW_ROOT_DATA_DIR") {
            self.raw_root_data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("PROCESSED_ROOT_DATA_DIR") {
            self.processed_root_data_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("FIBERFLOW_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
    }

    /// `<raw root>/<session_dir>`: local session directory for a staged key.
    pub fn session_path(&self, session_dir: &str) -> PathBuf {
        self.raw_root_data_dir.join(session_dir)
    }

    /// `<inbox prefix>/<session_dir>`: remote-path prefix for manifest lookups.
    pub fn remote_session_prefix(&self, session_dir: &str) -> String {
        format!("{}/{}", self.inbox_prefix.trim_end_matches('/'), session_dir)
    }
}
