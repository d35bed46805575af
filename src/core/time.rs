//! Timestamp helpers for log rows and worker bookkeeping.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Epoch-seconds timestamp with a trailing `Z`, the form every log table stores.
pub fn now_epoch_z() -> String {
    format!("{}Z", now_epoch_secs())
}
