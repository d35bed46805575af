//! The photometry pipeline: table declarations, staging gates, and the standard
//! worker wiring.
//!
//! Tables chain by key extension: `session` keys everything, acquisition gates
//! (`pre_*` masters plus their file part tables) guard each populate stage, and
//! derived tables extend the session key with fiber and trace identifiers. The
//! standard worker registers each gate's discovery scan, its clean-up pass, and
//! its populate job in dependency order.

pub mod behavior;
pub mod photometry_jobs;

use rusqlite::Connection;

use crate::config::FlowConfig;
use crate::core::error::FlowError;
use crate::core::key::Key;
use crate::core::manifest;
use crate::core::schemas::{self, TableSpec};
use crate::core::store;
use crate::staging::StagingGate;
use crate::worker::Worker;
use crate::worker::job::JobContext;

/// Which hemisphere a fiber is implanted in. Channel names carry it as a
/// trailing letter (`grnR`, `redL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hemisphere {
    Right,
    Left,
}

impl Hemisphere {
    /// Stable fiber number: the right fiber is always fiber 1.
    pub fn fiber_id(&self) -> i64 {
        match self {
            Hemisphere::Right => 1,
            Hemisphere::Left => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Hemisphere::Right => "right",
            Hemisphere::Left => "left",
        }
    }

    pub fn letter(&self) -> char {
        match self {
            Hemisphere::Right => 'R',
            Hemisphere::Left => 'L',
        }
    }

    pub fn from_channel_name(name: &str) -> Result<Self, FlowError> {
        match name.chars().last() {
            Some('R') => Ok(Hemisphere::Right),
            Some('L') => Ok(Hemisphere::Left),
            _ => Err(FlowError::Validation(format!(
                "channel '{}' does not end in a hemisphere letter",
                name
            ))),
        }
    }
}

/// Emission color of a photometry channel, encoded as the channel name's
/// leading letters (`grn`, `red`, `blu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EmissionColor {
    Green,
    Red,
    Blue,
}

impl EmissionColor {
    pub fn from_initial(c: char) -> Result<Self, FlowError> {
        match c.to_ascii_lowercase() {
            'g' => Ok(EmissionColor::Green),
            'r' => Ok(EmissionColor::Red),
            'b' => Ok(EmissionColor::Blue),
            other => Err(FlowError::Validation(format!(
                "unknown emission color initial '{}'",
                other
            ))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EmissionColor::Green => "green",
            EmissionColor::Red => "red",
            EmissionColor::Blue => "blue",
        }
    }

    /// The three-letter form channel names use.
    pub fn short(&self) -> &'static str {
        match self {
            EmissionColor::Green => "grn",
            EmissionColor::Red => "red",
            EmissionColor::Blue => "blu",
        }
    }
}

/// Split a channel name like `grnR` into its color and hemisphere.
pub fn parse_channel_name(name: &str) -> Result<(EmissionColor, Hemisphere), FlowError> {
    let hemisphere = Hemisphere::from_channel_name(name)?;
    let initial = name.chars().next().ok_or_else(|| {
        FlowError::Validation("empty channel name".to_string())
    })?;
    let color = EmissionColor::from_initial(initial)?;
    Ok((color, hemisphere))
}

pub static SESSION: TableSpec = TableSpec {
    name: "session",
    key_fields: &["subject", "session_id"],
};

/// Session row payload carries `session_dir`, the path of the acquisition
/// directory relative to the raw data root.
pub static SESSION_DIRECTORY: TableSpec = TableSpec {
    name: "session_directory",
    key_fields: &["subject", "session_id"],
};

pub static PRE_BEHAVIOR: TableSpec = TableSpec {
    name: "pre_behavior_ingestion",
    key_fields: &["subject", "session_id"],
};

pub static PRE_BEHAVIOR_FILES: TableSpec = TableSpec {
    name: "pre_behavior_ingestion_file",
    key_fields: &["subject", "session_id", "file_idx"],
};

pub static BEHAVIOR_INGESTION: TableSpec = TableSpec {
    name: "behavior_ingestion",
    key_fields: &["subject", "session_id"],
};

pub static BEHAVIOR_TRIAL: TableSpec = TableSpec {
    name: "behavior_trial",
    key_fields: &["subject", "session_id", "trial_id"],
};

pub static PRE_FIBER_PHOTOMETRY: TableSpec = TableSpec {
    name: "pre_fiber_photometry",
    key_fields: &["subject", "session_id"],
};

pub static PRE_FIBER_PHOTOMETRY_FILES: TableSpec = TableSpec {
    name: "pre_fiber_photometry_file",
    key_fields: &["subject", "session_id", "file_idx"],
};

pub static FIBER_PHOTOMETRY: TableSpec = TableSpec {
    name: "fiber_photometry",
    key_fields: &["subject", "session_id"],
};

pub static FIBER: TableSpec = TableSpec {
    name: "fiber_photometry_fiber",
    key_fields: &["subject", "session_id", "fiber_id"],
};

pub static DEMODULATED_TRACE: TableSpec = TableSpec {
    name: "demodulated_trace",
    key_fields: &["subject", "session_id", "trace_name", "emission_color", "hemisphere"],
};

pub static PRE_SYNC: TableSpec = TableSpec {
    name: "pre_fiber_photometry_sync",
    key_fields: &["subject", "session_id"],
};

pub static PRE_SYNC_FILES: TableSpec = TableSpec {
    name: "pre_fiber_photometry_sync_file",
    key_fields: &["subject", "session_id", "file_idx"],
};

pub static SYNCED: TableSpec = TableSpec {
    name: "fiber_photometry_synced",
    key_fields: &["subject", "session_id"],
};

pub static SYNCED_TRACE: TableSpec = TableSpec {
    name: "synced_trace",
    key_fields: &["subject", "session_id", "channel"],
};

/// Resolve a key's `session_dir` from the session directory table.
pub fn session_dir(ctx: &JobContext<'_>, key: &Key) -> Result<String, FlowError> {
    let record = store::fetch1(ctx.conn, &SESSION_DIRECTORY, key)?;
    record
        .payload
        .get("session_dir")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            FlowError::Validation(format!("session_directory row {} has no session_dir", key))
        })
}

/// Local path of the single manifest entry matching `pattern`. A populate job
/// calling this after its gate staged the key should always find the file; a
/// miss means the artifact vanished and surfaces as a missing-input error the
/// autoclear patterns recognize.
pub fn resolve_required_file(
    conn: &Connection,
    pattern: &str,
) -> Result<std::path::PathBuf, FlowError> {
    let matches = manifest::resolve_like(conn, pattern)?;
    match matches.into_iter().next() {
        Some(entry) => Ok(entry.local_path),
        None => Err(FlowError::MissingInput(format!(
            "no manifest entry matches '{}'",
            pattern
        ))),
    }
}

fn behavior_required_files(ctx: &JobContext<'_>, key: &Key) -> Result<Vec<String>, FlowError> {
    let dir = session_dir(ctx, key)?;
    let prefix = ctx.config.remote_session_prefix(&dir);
    Ok(vec![
        format!("{}/%events.csv", prefix),
        format!("{}/%trial.csv", prefix),
        format!("{}/%block.csv", prefix),
    ])
}

fn photometry_required_files(ctx: &JobContext<'_>, key: &Key) -> Result<Vec<String>, FlowError> {
    let dir = session_dir(ctx, key)?;
    let prefix = ctx.config.remote_session_prefix(&dir);
    Ok(vec![format!("{}/Photometry/%block.json", prefix)])
}

fn sync_required_files(ctx: &JobContext<'_>, key: &Key) -> Result<Vec<String>, FlowError> {
    let dir = session_dir(ctx, key)?;
    let prefix = ctx.config.remote_session_prefix(&dir);
    let subject = key
        .get("subject")
        .ok_or_else(|| FlowError::Validation(format!("key {} has no subject", key)))?;
    Ok(vec![
        format!("{}/%{}_analog_filled.csv", prefix, subject),
        format!("{}/%{}_behavior_df_full.csv", prefix, subject),
    ])
}

pub static PRE_BEHAVIOR_GATE: StagingGate = StagingGate {
    name: "behavior_ingestion",
    source: &SESSION_DIRECTORY,
    staging: &PRE_BEHAVIOR,
    files: &PRE_BEHAVIOR_FILES,
    populate: &BEHAVIOR_INGESTION,
    required: behavior_required_files,
};

pub static PRE_FIBER_PHOTOMETRY_GATE: StagingGate = StagingGate {
    name: "fiber_photometry",
    source: &SESSION_DIRECTORY,
    staging: &PRE_FIBER_PHOTOMETRY,
    files: &PRE_FIBER_PHOTOMETRY_FILES,
    populate: &FIBER_PHOTOMETRY,
    required: photometry_required_files,
};

pub static PRE_SYNC_GATE: StagingGate = StagingGate {
    name: "fiber_photometry_sync",
    source: &SESSION_DIRECTORY,
    staging: &PRE_SYNC,
    files: &PRE_SYNC_FILES,
    populate: &SYNCED,
    required: sync_required_files,
};

static ALL_TABLES: [&TableSpec; 15] = [
    &SESSION,
    &SESSION_DIRECTORY,
    &PRE_BEHAVIOR,
    &PRE_BEHAVIOR_FILES,
    &BEHAVIOR_INGESTION,
    &BEHAVIOR_TRIAL,
    &PRE_FIBER_PHOTOMETRY,
    &PRE_FIBER_PHOTOMETRY_FILES,
    &FIBER_PHOTOMETRY,
    &FIBER,
    &DEMODULATED_TRACE,
    &PRE_SYNC,
    &PRE_SYNC_FILES,
    &SYNCED,
    &SYNCED_TRACE,
];

/// Create every pipeline table plus the file manifest. Idempotent.
pub fn init_tables(conn: &Connection) -> Result<(), FlowError> {
    for spec in ALL_TABLES {
        schemas::create_table(conn, spec)?;
    }
    manifest::create_manifest_table(conn)?;
    Ok(())
}

/// The standard worker: each gate's discovery scan, its populate job, then its
/// clean-up pass, in dependency order. Registration order is the only ordering
/// the scheduler knows. Clean-up runs after the populate job so a key staged
/// and populated within one sweep is never reclaimed mid-flight; a key whose
/// populate failed is reclaimed here and restaged on the next sweep.
pub fn standard_worker(config: &FlowConfig) -> Result<Worker, FlowError> {
    let mut worker = Worker::new("fiberflow_worker", &config.autoclear_error_patterns)?;

    worker.register_gate(&PRE_BEHAVIOR_GATE, None);
    worker.register(behavior::behavior_ingestion_job(), None);
    worker.register_clean_up(&PRE_BEHAVIOR_GATE);

    worker.register_gate(&PRE_FIBER_PHOTOMETRY_GATE, None);
    worker.register(photometry_jobs::fiber_photometry_job(), Some(5));
    worker.register_clean_up(&PRE_FIBER_PHOTOMETRY_GATE);

    worker.register_gate(&PRE_SYNC_GATE, None);
    worker.register(photometry_jobs::fiber_photometry_synced_job(), Some(5));
    worker.register_clean_up(&PRE_SYNC_GATE);

    Ok(worker)
}
