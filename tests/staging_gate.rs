//! Staging gate protocol: atomic discovery, reconciliation, purge.

use std::fs;
use std::path::Path;

use rusqlite::Connection;
use tempfile::TempDir;

use fiberflow::config::FlowConfig;
use fiberflow::core::db::Db;
use fiberflow::core::key::Key;
use fiberflow::core::manifest;
use fiberflow::core::store::{self, Predicate, Record};
use fiberflow::pipeline::{
    self, BEHAVIOR_INGESTION, PRE_BEHAVIOR, PRE_BEHAVIOR_FILES, PRE_BEHAVIOR_GATE,
};
use fiberflow::readers::FsReaders;
use fiberflow::staging::Discovery;
use fiberflow::worker::job::JobContext;

struct Fixture {
    _tmp: TempDir,
    config: FlowConfig,
    conn: Connection,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let config = FlowConfig::default_at(tmp.path());
    let conn = Db::new(config.db_path.clone()).initialize().unwrap();
    pipeline::init_tables(&conn).unwrap();

    let rows = vec![fiberflow::pipeline::behavior::SessionRow {
        subject: "M123".to_string(),
        session_id: 1,
        session_datetime: "2024-03-01 10:00:00".to_string(),
        session_dir: "M123/s1".to_string(),
    }];
    pipeline::behavior::ingest_sessions(&conn, &rows).unwrap();

    Fixture {
        _tmp: tmp,
        config,
        conn,
    }
}

fn session_key() -> Key {
    Key::new().with("subject", "M123").with("session_id", 1)
}

fn write_file(dir: &Path, name: &str, contents: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(name), contents).unwrap();
}

fn register_inbox(f: &Fixture) {
    manifest::register_tree(&f.conn, &f.config.raw_root_data_dir, &f.config.inbox_prefix)
        .unwrap();
}

fn count(conn: &Connection, spec: &fiberflow::core::schemas::TableSpec) -> usize {
    store::fetch_keys(conn, spec, &Predicate::True).unwrap().len()
}

#[test]
fn discovery_is_all_or_nothing() {
    let f = fixture();
    let session_dir = f.config.raw_root_data_dir.join("M123/s1");
    write_file(&session_dir, "events.csv", "x\n1\n");
    write_file(&session_dir, "trial.csv", ",nTrial\n0,1\n");
    register_inbox(&f);

    let ctx = JobContext {
        conn: &f.conn,
        config: &f.config,
        readers: &FsReaders,
    };
    // Two of the three required artifacts: nothing may be staged.
    let outcome = PRE_BEHAVIOR_GATE.discover(&ctx, &session_key()).unwrap();
    assert_eq!(outcome, Discovery::NotFound);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR), 0);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR_FILES), 0);

    write_file(&session_dir, "block.csv", "x\n1\n");
    register_inbox(&f);
    let outcome = PRE_BEHAVIOR_GATE.discover(&ctx, &session_key()).unwrap();
    assert_eq!(outcome, Discovery::Eligible);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR), 1);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR_FILES), 3);

    // Rediscovery of a staged key changes nothing.
    let outcome = PRE_BEHAVIOR_GATE.discover(&ctx, &session_key()).unwrap();
    assert_eq!(outcome, Discovery::Eligible);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR_FILES), 3);
}

fn stage(f: &Fixture) {
    let session_dir = f.config.raw_root_data_dir.join("M123/s1");
    write_file(&session_dir, "events.csv", "x\n1\n");
    write_file(&session_dir, "trial.csv", ",nTrial\n0,1\n");
    write_file(&session_dir, "block.csv", "x\n1\n");
    register_inbox(f);
    let ctx = JobContext {
        conn: &f.conn,
        config: &f.config,
        readers: &FsReaders,
    };
    assert_eq!(
        PRE_BEHAVIOR_GATE.discover(&ctx, &session_key()).unwrap(),
        Discovery::Eligible
    );
}

#[test]
fn clean_up_removes_only_unpopulated_entries() {
    let f = fixture();
    stage(&f);

    // Staged but never populated: clean_up reclaims master and file rows.
    assert_eq!(PRE_BEHAVIOR_GATE.clean_up(&f.conn).unwrap(), 1);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR), 0);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR_FILES), 0);
    assert_eq!(PRE_BEHAVIOR_GATE.clean_up(&f.conn).unwrap(), 0);

    // Restage, populate, then clean_up must leave the entry alone.
    stage(&f);
    store::insert(
        &f.conn,
        &BEHAVIOR_INGESTION,
        &[Record::new(session_key())],
        false,
    )
    .unwrap();
    assert_eq!(PRE_BEHAVIOR_GATE.clean_up(&f.conn).unwrap(), 0);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR), 1);
}

#[test]
fn purge_drops_master_and_file_rows() {
    let f = fixture();
    stage(&f);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR_FILES), 3);

    PRE_BEHAVIOR_GATE.purge(&f.conn, &session_key()).unwrap();
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR), 0);
    assert_eq!(count(&f.conn, &PRE_BEHAVIOR_FILES), 0);
}
