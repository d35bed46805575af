//! Job descriptors and the key-source algebra.
//!
//! A job is a `make` function keyed by a record: given a fully-specified key it
//! inserts its output rows (one transaction) or errors leaving no partial state.
//! Which keys are currently eligible is an expression over upstream tables, built
//! from restriction, semijoin against a staging gate, and set difference. The
//! worker never asks `make` to check for prior work: idempotence comes from the
//! pending computation excluding keys whose populate row already exists.

use rusqlite::Connection;

use crate::config::FlowConfig;
use crate::core::error::FlowError;
use crate::core::key::Key;
use crate::core::schemas::TableSpec;
use crate::core::store::{self, Predicate};
use crate::readers::SessionReaders;
use crate::staging::StagingGate;

/// Everything a `make` invocation may touch. Constructed per sweep by the
/// worker; components never reach for ambient global state.
pub struct JobContext<'a> {
    pub conn: &'a Connection,
    pub config: &'a FlowConfig,
    pub readers: &'a dyn SessionReaders,
}

pub type MakeFn = Box<dyn Fn(&JobContext<'_>, &Key) -> Result<(), FlowError> + Send + Sync>;

/// Set expression defining the keys eligible for a job.
pub enum KeySource {
    /// All keys of a table.
    Table(&'static TableSpec),
    /// Keys satisfying a restriction on their fields.
    Restrict(Box<KeySource>, Predicate),
    /// Keys whose projection onto the shared fields exists in the other table
    /// (the `key_source & PreTable` staging rework).
    SemiJoin(Box<KeySource>, &'static TableSpec),
    /// Keys whose projection onto the shared fields is absent from the other
    /// table ("not yet processed").
    Minus(Box<KeySource>, &'static TableSpec),
}

impl KeySource {
    pub fn table(spec: &'static TableSpec) -> Self {
        KeySource::Table(spec)
    }

    pub fn semi_join(self, spec: &'static TableSpec) -> Self {
        KeySource::SemiJoin(Box::new(self), spec)
    }

    pub fn minus(self, spec: &'static TableSpec) -> Self {
        KeySource::Minus(Box::new(self), spec)
    }

    pub fn restrict(self, pred: Predicate) -> Self {
        KeySource::Restrict(Box::new(self), pred)
    }

    /// Evaluate to the eligible key set, in the base table's natural order.
    pub fn eval(&self, conn: &Connection) -> Result<Vec<Key>, FlowError> {
        match self {
            KeySource::Table(spec) => store::fetch_keys(conn, spec, &Predicate::True),
            KeySource::Restrict(inner, pred) => {
                let keys = inner.eval(conn)?;
                Ok(keys.into_iter().filter(|k| pred_matches(pred, k)).collect())
            }
            KeySource::SemiJoin(inner, spec) => {
                filter_against(conn, inner.eval(conn)?, spec, true)
            }
            KeySource::Minus(inner, spec) => filter_against(conn, inner.eval(conn)?, spec, false),
        }
    }
}

/// Keep keys whose projection onto the fields shared with `spec` is present
/// (semijoin) or absent (antijoin) in that table.
fn filter_against(
    conn: &Connection,
    keys: Vec<Key>,
    spec: &'static TableSpec,
    keep_present: bool,
) -> Result<Vec<Key>, FlowError> {
    use rustc_hash::FxHashSet;
    let Some(first) = keys.first() else {
        return Ok(keys);
    };
    let common: Vec<String> = first
        .iter()
        .map(|(f, _)| f)
        .filter(|f| spec.key_fields.contains(f))
        .map(|f| f.to_string())
        .collect();
    let common: Vec<&str> = common.iter().map(|s| s.as_str()).collect();
    if common.is_empty() {
        return Err(FlowError::Validation(format!(
            "key source shares no key fields with table '{}'",
            spec.name
        )));
    }
    let present: FxHashSet<Key> = store::fetch_keys(conn, spec, &Predicate::True)?
        .into_iter()
        .map(|k| k.project(&common))
        .collect::<Result<_, _>>()?;
    let mut out = Vec::new();
    for key in keys {
        if present.contains(&key.project(&common)?) == keep_present {
            out.push(key);
        }
    }
    Ok(out)
}

fn pred_matches(pred: &Predicate, key: &Key) -> bool {
    match pred {
        Predicate::True => true,
        Predicate::Eq(field, value) => key.get(field) == Some(value),
        Predicate::Like(field, pattern) => key
            .get(field)
            .map(|v| like_matches(pattern, &v.to_string()))
            .unwrap_or(false),
        Predicate::And(clauses) => clauses.iter().all(|c| pred_matches(c, key)),
    }
}

/// Compile a SQL-LIKE pattern (`%` any run, `_` any char) to an anchored regex.
/// The same convention covers autoclear error patterns.
pub fn like_to_regex(pattern: &str) -> Result<regex::Regex, FlowError> {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re)
        .map_err(|e| FlowError::Validation(format!("bad LIKE pattern '{}': {}", pattern, e)))
}

fn like_matches(pattern: &str, value: &str) -> bool {
    like_to_regex(pattern)
        .map(|r| r.is_match(value))
        .unwrap_or(false)
}

/// One registered processing unit.
pub struct JobDescriptor {
    /// Stable string identifier, e.g. `photometry.fiber_photometry`.
    pub id: String,
    /// Populate table this job writes. Pending keys are `key_source − target`.
    pub target: &'static TableSpec,
    pub key_source: KeySource,
    pub make: MakeFn,
    /// Upper bound on keys processed per sweep; `None` means unbounded.
    pub max_calls: Option<usize>,
    /// Gate whose staging entry is purged when this job fails with an
    /// autoclear-matching error.
    pub staging: Option<&'static StagingGate>,
}

impl JobDescriptor {
    pub fn new(
        id: impl Into<String>,
        target: &'static TableSpec,
        key_source: KeySource,
        make: MakeFn,
    ) -> Self {
        Self {
            id: id.into(),
            target,
            key_source,
            make,
            max_calls: None,
            staging: None,
        }
    }

    pub fn with_staging(mut self, gate: &'static StagingGate) -> Self {
        self.staging = Some(gate);
        self
    }

    /// Keys eligible and not yet populated, in natural order.
    pub fn pending(&self, conn: &Connection) -> Result<Vec<Key>, FlowError> {
        let keys = self.key_source.eval(conn)?;
        filter_against(conn, keys, self.target, false)
    }
}
