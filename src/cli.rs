//! Command-line interface.
//!
//! All clap-derived types plus the dispatch. Commands operate on a config file
//! (default `fiberflow.toml`); `init` writes one and creates the database so the
//! rest of the commands have something to open.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::config::FlowConfig;
use crate::core::db::Db;
use crate::core::manifest;
use crate::pipeline;
use crate::readers::FsReaders;
use crate::worker::RunDuration;
use crate::worker::logs;

#[derive(Parser, Debug)]
#[clap(
    name = "fiberflow",
    version = env!("CARGO_PKG_VERSION"),
    about = "Dependency-gated populate workers and photometry alignment for multi-modal neuroscience sessions."
)]
pub struct Cli {
    /// Config file to operate on.
    #[clap(long, short = 'c', global = true, default_value = "fiberflow.toml")]
    pub config: PathBuf,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a default config and create the pipeline database.
    Init {
        /// Root directory for the database and data folders.
        #[clap(long, default_value = ".")]
        root: PathBuf,
    },
    /// Register sessions from a roster CSV (subject, session_id,
    /// session_datetime, session_dir).
    IngestSessions { roster: PathBuf },
    /// File manifest operations.
    Manifest {
        #[clap(subcommand)]
        command: ManifestCommand,
    },
    /// Run the standard worker.
    Worker {
        #[clap(subcommand)]
        command: WorkerCommand,
    },
    /// Reconcile staging entries whose populate row never materialized.
    StagingCleanup,
    /// Error log operations.
    Errorlog {
        #[clap(subcommand)]
        command: ErrorlogCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ManifestCommand {
    /// Register every file under a local directory tree.
    Register {
        dir: PathBuf,
        /// Remote prefix to key the files under; defaults to the configured
        /// inbox prefix.
        #[clap(long)]
        prefix: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Sweep-sleep loop over all registered jobs.
    Run {
        /// Seconds to keep running; -1 runs until interrupted.
        #[clap(long, allow_hyphen_values = true)]
        run_duration: Option<i64>,
        /// Seconds to sleep between sweeps.
        #[clap(long)]
        sleep: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ErrorlogCommand {
    /// Print error log entries.
    List {
        #[clap(long)]
        job: Option<String>,
    },
    /// Delete error log entries.
    Clear {
        #[clap(long)]
        job: Option<String>,
    },
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { root } => init(&cli.config, &root),
        Command::IngestSessions { roster } => ingest_sessions(&cli.config, &roster),
        Command::Manifest {
            command: ManifestCommand::Register { dir, prefix },
        } => manifest_register(&cli.config, &dir, prefix.as_deref()),
        Command::Worker {
            command: WorkerCommand::Run {
                run_duration,
                sleep,
            },
        } => worker_run(&cli.config, run_duration, sleep),
        Command::StagingCleanup => staging_cleanup(&cli.config),
        Command::Errorlog { command } => errorlog(&cli.config, command),
    }
}

fn open(config_path: &std::path::Path) -> anyhow::Result<(FlowConfig, Db)> {
    let config = FlowConfig::load(config_path)?;
    let db = Db::new(config.db_path.clone());
    Ok((config, db))
}

fn init(config_path: &std::path::Path, root: &std::path::Path) -> anyhow::Result<()> {
    let mut config = FlowConfig::default_at(root);
    config.apply_env_overrides();
    config.save(config_path)?;
    let db = Db::new(config.db_path.clone());
    let conn = db.initialize()?;
    pipeline::init_tables(&conn)?;
    println!(
        "{} config {} database {}",
        "initialized".green().bold(),
        config_path.display(),
        db.path().display()
    );
    Ok(())
}

fn ingest_sessions(config_path: &std::path::Path, roster: &std::path::Path) -> anyhow::Result<()> {
    let (_, db) = open(config_path)?;
    let conn = db.connect()?;
    let rows = pipeline::behavior::load_sessions_csv(roster)?;
    let inserted = pipeline::behavior::ingest_sessions(&conn, &rows)?;
    println!(
        "{} {} new of {} listed",
        "sessions".green().bold(),
        inserted,
        rows.len()
    );
    Ok(())
}

fn manifest_register(
    config_path: &std::path::Path,
    dir: &std::path::Path,
    prefix: Option<&str>,
) -> anyhow::Result<()> {
    let (config, db) = open(config_path)?;
    let conn = db.connect()?;
    let prefix = prefix.unwrap_or(&config.inbox_prefix);
    let registered = manifest::register_tree(&conn, dir, prefix)?;
    println!("{} {} files", "registered".green().bold(), registered);
    Ok(())
}

fn worker_run(
    config_path: &std::path::Path,
    run_duration: Option<i64>,
    sleep: Option<u64>,
) -> anyhow::Result<()> {
    let (config, db) = open(config_path)?;
    let worker = pipeline::standard_worker(&config)?;
    let duration = RunDuration::from_secs(run_duration.unwrap_or(config.run_duration_secs));
    let sleep = Duration::from_secs(sleep.unwrap_or(config.sleep_duration_secs));
    let cancel = AtomicBool::new(false);
    let report = worker.run(&db, &config, &FsReaders, duration, sleep, &cancel)?;
    println!(
        "{} {} succeeded, {} errored, {} cleaned",
        "worker done".green().bold(),
        report.succeeded,
        report.errored,
        report.cleaned
    );
    Ok(())
}

fn staging_cleanup(config_path: &std::path::Path) -> anyhow::Result<()> {
    let (_, db) = open(config_path)?;
    let conn = db.connect()?;
    for gate in [
        &pipeline::PRE_BEHAVIOR_GATE,
        &pipeline::PRE_FIBER_PHOTOMETRY_GATE,
        &pipeline::PRE_SYNC_GATE,
    ] {
        let cleaned = gate.clean_up(&conn)?;
        println!("{} {}: {}", "cleaned".yellow().bold(), gate.name, cleaned);
    }
    Ok(())
}

fn errorlog(config_path: &std::path::Path, command: ErrorlogCommand) -> anyhow::Result<()> {
    let (_, db) = open(config_path)?;
    let conn = db.connect()?;
    match command {
        ErrorlogCommand::List { job } => {
            for entry in logs::list_errors(&conn, job.as_deref())? {
                println!(
                    "{} {} {} {} {}",
                    entry.ts.dimmed(),
                    entry.job_id.cyan(),
                    entry.key_json,
                    "error:".red().bold(),
                    entry.message
                );
            }
        }
        ErrorlogCommand::Clear { job } => {
            let deleted = logs::clear_errors(&conn, job.as_deref())?;
            println!("{} {} entries", "cleared".yellow().bold(), deleted);
        }
    }
    Ok(())
}
