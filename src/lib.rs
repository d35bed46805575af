//! Fiberflow: dependency-gated populate workers and photometry alignment for
//! multi-modal neuroscience sessions.
//!
//! The pipeline is a set of keyed record tables chained by key extension. Each
//! derived table has a populate job; each job that depends on acquisition files
//! sits behind a staging gate that only admits a key once every required file is
//! present in the manifest. A polling worker sweeps the jobs in registration
//! order, so a whole acquisition cohort flows through discovery, behavioral
//! ingestion, demodulation, and alignment without any central scheduler.
//!
//! # Layout
//!
//! - [`core`]: database handle, keys, the record store, file manifest.
//! - [`staging`]: the prepare/populate/clean-up gate protocol.
//! - [`worker`]: job descriptors, the sweep scheduler, persistent logs.
//! - [`photometry`]: demodulation and alignment signal processing.
//! - [`pipeline`]: the concrete tables, gates, and jobs wired together.
//! - [`readers`]: acquisition-format seams, kept behind a trait for testing.

pub mod cli;
pub mod config;
pub mod core;
pub mod photometry;
pub mod pipeline;
pub mod readers;
pub mod staging;
pub mod worker;
