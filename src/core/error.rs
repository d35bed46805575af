use std::env;
use std::io;
use thiserror::Error;

/// Crate-wide error type.
///
/// `MissingInput` is deliberately its own variant: it is the one failure class the
/// worker treats as unrecoverable-until-restaged. Its rendered message matches the
/// default autoclear patterns, which purges the staging entry instead of retrying
/// the same absent file forever.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("MissingInput: {0}")]
    MissingInput(String),
    #[error("TOML error: {0}")]
    Toml(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] env::VarError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
}
