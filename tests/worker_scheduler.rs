//! Scheduler semantics: sweep order, max_calls, failure isolation, autoclear,
//! and run termination.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rusqlite::Connection;
use tempfile::TempDir;

use fiberflow::config::FlowConfig;
use fiberflow::core::db::Db;
use fiberflow::core::error::FlowError;
use fiberflow::core::key::{Key, KeyValue};
use fiberflow::core::schemas::{self, TableSpec};
use fiberflow::core::store::{self, Predicate, Record};
use fiberflow::readers::FsReaders;
use fiberflow::staging::StagingGate;
use fiberflow::worker::job::{JobContext, JobDescriptor, KeySource};
use fiberflow::worker::{RunDuration, Worker, logs};

static SOURCE: TableSpec = TableSpec {
    name: "ws_source",
    key_fields: &["subject", "session_id"],
};
static STAGE_ONE: TableSpec = TableSpec {
    name: "ws_stage_one",
    key_fields: &["subject", "session_id"],
};
static STAGE_TWO: TableSpec = TableSpec {
    name: "ws_stage_two",
    key_fields: &["subject", "session_id"],
};
static PRE: TableSpec = TableSpec {
    name: "ws_pre",
    key_fields: &["subject", "session_id"],
};
static PRE_FILES: TableSpec = TableSpec {
    name: "ws_pre_file",
    key_fields: &["subject", "session_id", "file_idx"],
};

fn never_ready(
    _ctx: &JobContext<'_>,
    _key: &Key,
) -> Result<Vec<String>, FlowError> {
    Ok(vec!["%never.bin".to_string()])
}

static GATE: StagingGate = StagingGate {
    name: "ws_gate",
    source: &SOURCE,
    staging: &PRE,
    files: &PRE_FILES,
    populate: &STAGE_ONE,
    required: never_ready,
};

struct Fixture {
    _tmp: TempDir,
    config: FlowConfig,
    db: Db,
    conn: Connection,
}

fn fixture(n_source_keys: i64) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let config = FlowConfig::default_at(tmp.path());
    let db = Db::new(config.db_path.clone());
    let conn = db.initialize().unwrap();
    for spec in [&SOURCE, &STAGE_ONE, &STAGE_TWO, &PRE, &PRE_FILES] {
        schemas::create_table(&conn, spec).unwrap();
    }
    let rows: Vec<Record> = (1..=n_source_keys)
        .map(|i| Record::new(Key::new().with("subject", "M1").with("session_id", i)))
        .collect();
    store::insert(&conn, &SOURCE, &rows, false).unwrap();
    Fixture {
        _tmp: tmp,
        config,
        db,
        conn,
    }
}

fn copy_job(id: &str, from: &'static TableSpec, to: &'static TableSpec) -> JobDescriptor {
    JobDescriptor::new(
        id,
        to,
        KeySource::table(from),
        Box::new(move |ctx, key| {
            store::insert(ctx.conn, to, &[Record::new(key.clone())], false)?;
            Ok(())
        }),
    )
}

fn count(conn: &Connection, spec: &TableSpec) -> usize {
    store::fetch_keys(conn, spec, &Predicate::True).unwrap().len()
}

#[test]
fn max_calls_bounds_each_sweep() {
    let f = fixture(10);
    let mut worker = Worker::new("w", &[]).unwrap();
    worker.register(copy_job("test.copy", &SOURCE, &STAGE_ONE), Some(3));

    let ctx = JobContext {
        conn: &f.conn,
        config: &f.config,
        readers: &FsReaders,
    };
    let cancel = AtomicBool::new(false);
    let report = worker.sweep(&ctx, &cancel).unwrap();
    assert_eq!(report.succeeded, 3);
    assert_eq!(count(&f.conn, &STAGE_ONE), 3);

    // The next sweep picks up where pending left off.
    worker.sweep(&ctx, &cancel).unwrap();
    assert_eq!(count(&f.conn, &STAGE_ONE), 6);
}

#[test]
fn registration_order_carries_dependencies_within_one_sweep() {
    let f = fixture(4);
    let mut worker = Worker::new("w", &[]).unwrap();
    worker.register(copy_job("test.first", &SOURCE, &STAGE_ONE), None);
    worker.register(copy_job("test.second", &STAGE_ONE, &STAGE_TWO), None);

    let ctx = JobContext {
        conn: &f.conn,
        config: &f.config,
        readers: &FsReaders,
    };
    let report = worker.sweep(&ctx, &AtomicBool::new(false)).unwrap();
    // The second job sees the rows the first job inserted this same sweep.
    assert_eq!(report.succeeded, 8);
    assert_eq!(count(&f.conn, &STAGE_TWO), 4);
}

#[test]
fn one_failing_key_never_aborts_the_sweep() {
    let f = fixture(5);
    let make = Box::new(|ctx: &JobContext<'_>, key: &Key| {
        if key.get("session_id") == Some(&KeyValue::Int(3)) {
            return Err(FlowError::Validation("corrupt export".to_string()));
        }
        store::insert(ctx.conn, &STAGE_ONE, &[Record::new(key.clone())], false)?;
        Ok(())
    });
    let mut worker = Worker::new("w", &[]).unwrap();
    worker.register(
        JobDescriptor::new("test.flaky", &STAGE_ONE, KeySource::table(&SOURCE), make),
        None,
    );

    let ctx = JobContext {
        conn: &f.conn,
        config: &f.config,
        readers: &FsReaders,
    };
    let report = worker.sweep(&ctx, &AtomicBool::new(false)).unwrap();
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.errored, 1);
    assert_eq!(count(&f.conn, &STAGE_ONE), 4);

    let errors = logs::list_errors(&f.conn, Some("test.flaky")).unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("corrupt export"));

    // The failed key stays pending and is retried on the next sweep.
    let report = worker.sweep(&ctx, &AtomicBool::new(false)).unwrap();
    assert_eq!(report.errored, 1);
    assert_eq!(report.succeeded, 0);
}

#[test]
fn autoclear_purges_staging_only_on_matching_errors() {
    let f = fixture(1);
    let key = Key::new().with("subject", "M1").with("session_id", 1);
    let stage = |conn: &Connection| {
        store::insert(conn, &PRE, &[Record::new(key.clone())], true).unwrap();
        store::insert(
            conn,
            &PRE_FILES,
            &[Record::new(key.clone().with("file_idx", 0))],
            true,
        )
        .unwrap();
    };
    stage(&f.conn);

    let gated_job = || {
        JobDescriptor::new(
            "test.gated",
            &STAGE_ONE,
            KeySource::table(&SOURCE).semi_join(&PRE),
            Box::new(|_ctx: &JobContext<'_>, _key: &Key| {
                Err(FlowError::MissingInput("raw block".to_string()))
            }),
        )
        .with_staging(&GATE)
    };

    let ctx = JobContext {
        conn: &f.conn,
        config: &f.config,
        readers: &FsReaders,
    };

    // Non-matching pattern: the error is logged but the staging entry stays.
    let mut worker = Worker::new("w", &["%Timeout%".to_string()]).unwrap();
    worker.register(gated_job(), None);
    let report = worker.sweep(&ctx, &AtomicBool::new(false)).unwrap();
    assert_eq!(report.errored, 1);
    assert_eq!(count(&f.conn, &PRE), 1);

    // Matching pattern: the staging entry and its file rows are purged, and the
    // key stops being offered.
    let mut worker = Worker::new("w", &["%MissingInput%".to_string()]).unwrap();
    worker.register(gated_job(), None);
    let report = worker.sweep(&ctx, &AtomicBool::new(false)).unwrap();
    assert_eq!(report.errored, 1);
    assert_eq!(count(&f.conn, &PRE), 0);
    assert_eq!(count(&f.conn, &PRE_FILES), 0);

    let report = worker.sweep(&ctx, &AtomicBool::new(false)).unwrap();
    assert_eq!(report.errored, 0);
}

#[test]
fn bounded_runs_terminate() {
    let f = fixture(2);
    assert_eq!(RunDuration::from_secs(-1), RunDuration::Forever);

    let mut worker = Worker::new("w", &[]).unwrap();
    worker.register(copy_job("test.copy", &SOURCE, &STAGE_ONE), None);

    let cancel = AtomicBool::new(false);
    let report = worker
        .run(
            &f.db,
            &f.config,
            &FsReaders,
            RunDuration::from_secs(0),
            Duration::ZERO,
            &cancel,
        )
        .unwrap();
    assert_eq!(report.succeeded, 2);
    assert!(!report.cancelled);

    // A pre-set cancellation flag stops the loop after at most one sweep.
    let cancel = AtomicBool::new(true);
    let report = worker
        .run(
            &f.db,
            &f.config,
            &FsReaders,
            RunDuration::Forever,
            Duration::from_secs(60),
            &cancel,
        )
        .unwrap();
    assert!(report.cancelled);
}
