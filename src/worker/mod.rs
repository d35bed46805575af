//! The worker scheduler.
//!
//! A worker holds an ordered list of steps (populate jobs, staging discovery,
//! clean-up passes) and sweeps them in declaration order: compute the pending
//! key set for each job, execute up to `max_calls` keys, log failures to the
//! error log, then sleep and repeat. Dependency order between jobs is encoded
//! purely by registration order; there is no dynamic graph. Keys fail
//! independently: one raising `make` never aborts the sweep. Coordination with
//! other worker processes happens only through the record store's per-key
//! uniqueness.

pub mod job;
pub mod logs;

use regex::Regex;
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::FlowConfig;
use crate::core::db::Db;
use crate::core::error::FlowError;
use crate::readers::SessionReaders;
use crate::staging::StagingGate;
use job::{JobContext, JobDescriptor, like_to_regex};

/// Sleep is taken in short slices so a cancellation flag is observed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Wall-clock bound on a worker run. The CLI maps `-1` to `Forever`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDuration {
    Forever,
    For(Duration),
}

impl RunDuration {
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            RunDuration::Forever
        } else {
            RunDuration::For(Duration::from_secs(secs as u64))
        }
    }

    fn expired(&self, start: Instant) -> bool {
        match self {
            RunDuration::Forever => false,
            RunDuration::For(d) => start.elapsed() >= *d,
        }
    }
}

enum WorkerStep {
    Job(JobDescriptor),
    CleanUp(&'static StagingGate),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub succeeded: usize,
    pub errored: usize,
    pub cleaned: usize,
    pub cancelled: bool,
}

pub struct Worker {
    name: String,
    steps: Vec<WorkerStep>,
    autoclear: Vec<(String, Regex)>,
}

impl Worker {
    pub fn new(name: &str, autoclear_error_patterns: &[String]) -> Result<Self, FlowError> {
        let autoclear = autoclear_error_patterns
            .iter()
            .map(|p| Ok((p.clone(), like_to_regex(p)?)))
            .collect::<Result<Vec<_>, FlowError>>()?;
        Ok(Self {
            name: name.to_string(),
            steps: Vec::new(),
            autoclear,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a populate job. Steps execute in registration order each sweep,
    /// so dependencies must be registered before their dependents.
    pub fn register(&mut self, mut descriptor: JobDescriptor, max_calls: Option<usize>) {
        if max_calls.is_some() {
            descriptor.max_calls = max_calls;
        }
        self.steps.push(WorkerStep::Job(descriptor));
    }

    /// Register a gate's discovery scan as a step.
    pub fn register_gate(&mut self, gate: &'static StagingGate, max_calls: Option<usize>) {
        self.steps.push(WorkerStep::Job(gate.as_job(max_calls)));
    }

    /// Register a periodic clean-up pass for a gate. Deliberately a step rather
    /// than an every-sweep side effect: reconciliation cost is paid where it is
    /// declared.
    pub fn register_clean_up(&mut self, gate: &'static StagingGate) {
        self.steps.push(WorkerStep::CleanUp(gate));
    }

    /// One pass over all registered steps. Errors returned here are
    /// infrastructure failures (store connectivity, bad registration); `make`
    /// failures are logged and absorbed.
    pub fn sweep(
        &self,
        ctx: &JobContext<'_>,
        cancel: &AtomicBool,
    ) -> Result<SweepReport, FlowError> {
        let mut report = SweepReport::default();
        for step in &self.steps {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }
            match step {
                WorkerStep::Job(job) => self.run_job(ctx, job, cancel, &mut report)?,
                WorkerStep::CleanUp(gate) => {
                    let cleaned = gate.clean_up(ctx.conn)?;
                    report.cleaned += cleaned;
                    if cleaned > 0 {
                        logs::log_worker_event(
                            ctx.conn,
                            &self.name,
                            &format!("staging.{}.clean_up", gate.name),
                            "cleaned",
                            cleaned,
                        )?;
                    }
                }
            }
        }
        Ok(report)
    }

    fn run_job(
        &self,
        ctx: &JobContext<'_>,
        job: &JobDescriptor,
        cancel: &AtomicBool,
        report: &mut SweepReport,
    ) -> Result<(), FlowError> {
        let pending = job.pending(ctx.conn)?;
        let take = job
            .max_calls
            .map(|m| m.min(pending.len()))
            .unwrap_or(pending.len());
        let mut succeeded = 0usize;
        for key in &pending[..take] {
            // Cancellation is cooperative at key granularity: a running make
            // always finishes or fails cleanly.
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }
            match (job.make)(ctx, key) {
                Ok(()) => succeeded += 1,
                Err(err) => {
                    report.errored += 1;
                    let message = err.to_string();
                    logs::log_error(ctx.conn, &self.name, &job.id, key, &message)?;
                    self.apply_autoclear(ctx.conn, job, key, &message)?;
                }
            }
        }
        report.succeeded += succeeded;
        if take > 0 {
            logs::log_worker_event(ctx.conn, &self.name, &job.id, "processed", succeeded)?;
        }
        Ok(())
    }

    /// A matching error message means the failure is known-unrecoverable for
    /// this staging attempt: purge the entry so the key is not retried until
    /// upstream data changes and rediscovery stages it again.
    fn apply_autoclear(
        &self,
        conn: &Connection,
        job: &JobDescriptor,
        key: &crate::core::key::Key,
        message: &str,
    ) -> Result<(), FlowError> {
        let Some(gate) = job.staging else {
            return Ok(());
        };
        for (pattern, re) in &self.autoclear {
            if re.is_match(message) {
                gate.purge(conn, key)?;
                println!(
                    "{}",
                    serde_json::json!({
                        "ts": crate::core::time::now_epoch_z(),
                        "event": "job.autoclear",
                        "worker": self.name,
                        "job": job.id,
                        "key": key.to_string(),
                        "pattern": pattern,
                    })
                );
                break;
            }
        }
        Ok(())
    }

    /// Sweep, sleep, repeat until the duration expires or cancellation is
    /// requested. Returns the accumulated totals.
    pub fn run(
        &self,
        db: &Db,
        config: &FlowConfig,
        readers: &dyn SessionReaders,
        run_duration: RunDuration,
        sleep_duration: Duration,
        cancel: &AtomicBool,
    ) -> Result<SweepReport, FlowError> {
        let start = Instant::now();
        let conn = db.connect()?;
        let mut totals = SweepReport::default();
        loop {
            let ctx = JobContext {
                conn: &conn,
                config,
                readers,
            };
            let report = self.sweep(&ctx, cancel)?;
            totals.succeeded += report.succeeded;
            totals.errored += report.errored;
            totals.cleaned += report.cleaned;
            totals.cancelled |= report.cancelled;
            if totals.cancelled || run_duration.expired(start) {
                break;
            }
            let mut slept = Duration::ZERO;
            while slept < sleep_duration {
                if cancel.load(Ordering::Relaxed) || run_duration.expired(start) {
                    break;
                }
                let slice = SLEEP_SLICE.min(sleep_duration - slept);
                std::thread::sleep(slice);
                slept += slice;
            }
            if cancel.load(Ordering::Relaxed) {
                totals.cancelled = true;
                break;
            }
            if run_duration.expired(start) {
                break;
            }
        }
        Ok(totals)
    }
}
