//! End-to-end photometry pipeline: demodulation through the standard worker,
//! alignment onto the behavior clock, and penalty-state correction.

use std::f64::consts::TAU;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rusqlite::Connection;
use tempfile::TempDir;

use fiberflow::config::FlowConfig;
use fiberflow::core::db::Db;
use fiberflow::core::error::FlowError;
use fiberflow::core::key::Key;
use fiberflow::core::manifest::{self, ManifestEntry};
use fiberflow::core::store::{self, Predicate, Record};
use fiberflow::photometry::frame::Frame;
use fiberflow::photometry::preprocess;
use fiberflow::pipeline::{
    self, BEHAVIOR_TRIAL, DEMODULATED_TRACE, FIBER, FIBER_PHOTOMETRY, SYNCED, SYNCED_TRACE,
    photometry_jobs,
};
use fiberflow::readers::{FsReaders, RawBlock, RawChannel, SessionReaders};
use fiberflow::worker::RunDuration;

fn session_key() -> Key {
    Key::new().with("subject", "M123").with("session_id", 1)
}

fn register_session(conn: &Connection) {
    let rows = vec![pipeline::behavior::SessionRow {
        subject: "M123".to_string(),
        session_id: 1,
        session_datetime: "2024-03-01 10:00:00".to_string(),
        session_dir: "M123/s1".to_string(),
    }];
    pipeline::behavior::ingest_sessions(conn, &rows).unwrap();
}

fn count(conn: &Connection, spec: &fiberflow::core::schemas::TableSpec) -> usize {
    store::fetch_keys(conn, spec, &Predicate::True).unwrap().len()
}

#[test]
fn worker_demodulates_a_staged_session() {
    let tmp = TempDir::new().unwrap();
    let config = FlowConfig::default_at(tmp.path());
    let db = Db::new(config.db_path.clone());
    let conn = db.initialize().unwrap();
    pipeline::init_tables(&conn).unwrap();
    register_session(&conn);

    let session_dir = config.raw_root_data_dir.join("M123/s1");
    fs::create_dir_all(session_dir.join("Photometry")).unwrap();
    fs::write(session_dir.join("events.csv"), "t\n0\n").unwrap();
    fs::write(session_dir.join("trial.csv"), ",nTrial,reward\n0,1,1.0\n1,2,0.0\n").unwrap();
    fs::write(session_dir.join("block.csv"), "t\n0\n").unwrap();

    // Carrier-modulated constant envelope at 3 kHz; demodulation at a 5x
    // decimation should recover a flat 2.0 trace at 600 Hz.
    let fs_raw = 3000.0;
    let n = 18_000;
    let samples: Vec<f64> = (0..n)
        .map(|i| 2.0 * (TAU * 211.0 * i as f64 / fs_raw).sin())
        .collect();
    let block = RawBlock {
        sample_rate: fs_raw,
        channels: vec![RawChannel {
            name: "grnR".to_string(),
            carrier_hz: 211.0,
            samples,
        }],
        to_beh_sys: vec![0.0; n],
        from_beh_sys: vec![0.0; n],
    };
    fs::write(
        session_dir.join("Photometry/block.json"),
        serde_json::to_string(&block).unwrap(),
    )
    .unwrap();
    manifest::register_tree(&conn, &config.raw_root_data_dir, &config.inbox_prefix).unwrap();
    drop(conn);

    let worker = pipeline::standard_worker(&config).unwrap();
    let report = worker
        .run(
            &db,
            &config,
            &FsReaders,
            RunDuration::from_secs(0),
            Duration::ZERO,
            &AtomicBool::new(false),
        )
        .unwrap();
    assert_eq!(report.errored, 0);

    let conn = db.connect().unwrap();
    assert_eq!(count(&conn, &BEHAVIOR_TRIAL), 2);
    assert_eq!(count(&conn, &FIBER_PHOTOMETRY), 1);
    assert_eq!(count(&conn, &FIBER), 1);
    assert_eq!(count(&conn, &DEMODULATED_TRACE), 2);
    // Sync exports were never staged, so the aligned stage must not have run.
    assert_eq!(count(&conn, &SYNCED), 0);

    let raw = store::fetch1(
        &conn,
        &DEMODULATED_TRACE,
        &session_key()
            .with("trace_name", "raw")
            .with("emission_color", "green")
            .with("hemisphere", "right"),
    )
    .unwrap();
    let trace: Vec<f64> = serde_json::from_value(raw.payload["trace"].clone()).unwrap();
    assert_eq!(trace.len(), n / 5);
    let mid = trace[trace.len() / 2];
    assert!((mid - 2.0).abs() < 0.25, "recovered envelope {}", mid);
    assert_eq!(raw.payload["fiber_id"], 1);
}

struct MemReaders {
    analog: Frame,
    behavior: Frame,
}

impl SessionReaders for MemReaders {
    fn read_block(&self, _dir: &Path) -> Result<Option<RawBlock>, FlowError> {
        Ok(None)
    }

    fn read_table(&self, path: &Path) -> Result<Frame, FlowError> {
        match path.file_name().and_then(|n| n.to_str()) {
            Some("analog.csv") => Ok(self.analog.clone()),
            Some("behavior.csv") => Ok(self.behavior.clone()),
            other => Err(FlowError::NotFound(format!("{:?}", other))),
        }
    }
}

fn manifest_row(remote: &str, local: &str) -> Record {
    let entry = ManifestEntry {
        remote_fullpath: remote.to_string(),
        local_path: local.into(),
        sha256: String::new(),
        size: 0,
    };
    Record::with_payload(
        Key::new().with("remote_fullpath", remote),
        serde_json::to_value(&entry).unwrap(),
    )
}

#[test]
fn synced_stage_aligns_onto_the_behavior_clock() {
    let tmp = TempDir::new().unwrap();
    let config = FlowConfig::default_at(tmp.path());
    let conn = Db::new(config.db_path.clone()).initialize().unwrap();
    pipeline::init_tables(&conn).unwrap();
    register_session(&conn);

    let prefix = config.remote_session_prefix("M123/s1");
    store::insert(
        &conn,
        &manifest::FILE_MANIFEST,
        &[
            manifest_row(&format!("{}/M123_analog_filled.csv", prefix), "analog.csv"),
            manifest_row(&format!("{}/M123_behavior_df_full.csv", prefix), "behavior.csv"),
        ],
        false,
    )
    .unwrap();

    // Persisted demodulated traces at 600 Hz, with the handshake pulse 60
    // samples in (0.1 s of pre-task recording).
    let n_photo = 80_000;
    let raw: Vec<f64> = (0..n_photo).map(|i| 5.0 + (i as f64 * 0.01).sin()).collect();
    let detrend: Vec<f64> = (0..n_photo).map(|i| (i as f64 * 0.013).sin()).collect();
    let mut from_beh = vec![0.0; n_photo];
    from_beh[60] = 1.0;
    store::insert(
        &conn,
        &FIBER_PHOTOMETRY,
        &[Record::with_payload(
            session_key(),
            serde_json::json!({
                "raw_sample_rate": 3000.0,
                "demod_sample_rate": 600.0,
                "channels": ["grnR"],
                "synch_signals": { "toBehSys": vec![0.0; n_photo], "fromBehSys": from_beh },
            }),
        )],
        false,
    )
    .unwrap();
    for (trace_name, samples) in [("raw", &raw), ("detrend", &detrend)] {
        store::insert(
            &conn,
            &DEMODULATED_TRACE,
            &[Record::with_payload(
                session_key()
                    .with("trace_name", trace_name)
                    .with("emission_color", "green")
                    .with("hemisphere", "right"),
                serde_json::json!({ "fiber_id": 1, "trace": samples }),
            )],
            false,
        )
        .unwrap();
    }

    // Behavior analog table at 200 Hz: the task enters ENL at row 40.
    let n_beh = 26_000;
    let mut analog = Frame::new();
    analog
        .push_column("nTrial", (0..n_beh).map(|i| 1.0 + (i / 500) as f64).collect())
        .unwrap();
    analog
        .push_column("ENL", (0..n_beh).map(|i| if i >= 40 { 1.0 } else { 0.0 }).collect())
        .unwrap();
    analog.push_column("ENLP", vec![0.0; n_beh]).unwrap();
    analog.push_column("nENL", vec![1.0; n_beh]).unwrap();
    let mut behavior = Frame::new();
    behavior
        .push_column("nTrial", (1..=52).map(|t| t as f64).collect())
        .unwrap();
    behavior.push_column("n_ENL", vec![1.0; 52]).unwrap();

    let readers = MemReaders { analog, behavior };
    let ctx = fiberflow::worker::job::JobContext {
        conn: &conn,
        config: &config,
        readers: &readers,
    };
    photometry_jobs::fiber_photometry_synced_make(&ctx, &session_key()).unwrap();

    let master = store::fetch1(&conn, &SYNCED, &session_key()).unwrap();
    assert_eq!(master.payload["sample_rate"], 50.0);
    let time_offset = master.payload["time_offset"].as_f64().unwrap();
    assert!((time_offset - 0.2).abs() < 1e-9);

    // Timestamps are strictly increasing and uniform at the output rate.
    let timestamps: Vec<f64> =
        serde_json::from_value(master.payload["timestamps"].clone()).unwrap();
    assert!(!timestamps.is_empty());
    for pair in timestamps.windows(2) {
        let dt = pair[1] - pair[0];
        assert!(dt > 0.0);
        assert!((dt - 0.02).abs() < 1e-9, "non-uniform step {}", dt);
    }

    let channels: Vec<String> = store::fetch_keys(&conn, &SYNCED_TRACE, &Predicate::True)
        .unwrap()
        .iter()
        .map(|k| k.get("channel").unwrap().to_string())
        .collect();
    for expected in ["raw_grnR", "detrend_grnR", "nTrial", "ENL", "ENLP", "state_ENLP", "trial_clock"] {
        assert!(channels.contains(&expected.to_string()), "missing {}", expected);
    }

    let z = store::fetch1(
        &conn,
        &SYNCED_TRACE,
        &session_key().with("channel", "detrend_grnR"),
    )
    .unwrap();
    let z: Vec<f64> = serde_json::from_value(z.payload["trace"].clone()).unwrap();
    assert_eq!(z.len(), timestamps.len());
    assert!(z.iter().all(|v| v.is_finite()));
}

#[test]
fn penalty_flags_split_against_the_reference_log() {
    // One 20-row penalty trial: the in-task counter says the first ten samples
    // belong to the aborted first attempt, the behavior log says the trial's
    // true count is 2.
    let mut df = Frame::new();
    df.push_column("nTrial", vec![7.0; 20]).unwrap();
    df.push_column("ENLP", vec![1.0; 20]).unwrap();
    let counters: Vec<f64> = (0..20).map(|i| if i < 10 { 1.0 } else { 2.0 }).collect();
    df.push_column("nENL", counters).unwrap();

    let mut behavior = Frame::new();
    behavior.push_column("nTrial", vec![7.0]).unwrap();
    behavior.push_column("n_ENL", vec![2.0]).unwrap();

    preprocess::split_penalty_states(&mut df, &behavior, "ENLP").unwrap();

    let flags = df.column("ENLP").unwrap();
    let state = df.column("state_ENLP").unwrap();
    for i in 0..10 {
        assert_eq!(flags[i], 0.0, "row {} should be relabeled", i);
        assert_eq!(state[i], 1.0);
    }
    for i in 10..20 {
        assert_eq!(flags[i], 1.0, "row {} is the real penalty", i);
        assert_eq!(state[i], 0.0);
    }
}
