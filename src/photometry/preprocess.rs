//! Alignment of photometry frames onto the behavioral clock.
//!
//! The photometry and behavior systems free-run on their own clocks at
//! different rates. Alignment proceeds: zero the photometry clock at the first
//! behavioral handshake pulse, interpolate each trace onto the behavior clock
//! by nearest sample, correct the one-sample-early penalty flags against the
//! reference behavior log, then downsample by windowed aggregation.

use crate::core::error::FlowError;
use crate::photometry::demodulation::{decimate_max, decimate_mean};
use crate::photometry::frame::Frame;

/// Threshold above which a pulse or flag sample counts as set.
const FLAG_ON: f64 = 0.5;

/// Trim the frame so its first sample coincides with the first rising edge of
/// `sync_col` (the pulse the behavior system sends at the first trial).
pub fn handshake_behav_recording_sys(frame: &mut Frame, sync_col: &str) -> Result<(), FlowError> {
    let first = frame
        .column(sync_col)?
        .iter()
        .position(|&v| v > FLAG_ON)
        .ok_or_else(|| {
            FlowError::Validation(format!("no synchronization pulse on '{}'", sync_col))
        })?;
    frame.trim_front(first);
    Ok(())
}

/// Interpolate the named photometry channels onto the behavior clock.
///
/// The anchor is the first behavior row where `align_on` is set: photometry
/// sample zero (post-handshake) lands there. Output is one merged frame at the
/// behavior rate, truncated to the rows both systems cover, plus the
/// `time_offset` (the `session_clock` value of the anchor row).
pub fn resample_and_align(
    analog: &Frame,
    photo: &Frame,
    channels: &[String],
    align_on: &str,
    photo_rate: f64,
) -> Result<(Frame, f64), FlowError> {
    let clock = analog.column("session_clock")?;
    let anchor = analog
        .column(align_on)?
        .iter()
        .position(|&v| v > FLAG_ON)
        .ok_or_else(|| {
            FlowError::Validation(format!("behavior frame never sets '{}'", align_on))
        })?;
    let time_offset = clock[anchor];

    if photo.is_empty() {
        return Err(FlowError::Validation("empty photometry frame".to_string()));
    }
    // Nearest photometry sample for each behavior row at and after the anchor.
    let mut indices = Vec::new();
    for r in anchor..analog.len() {
        let t = clock[r] - time_offset;
        let idx = (t * photo_rate).round() as usize;
        if idx >= photo.len() {
            break;
        }
        indices.push(idx);
    }

    let mut merged = analog.slice_rows(anchor, anchor + indices.len())?;
    for channel in channels {
        let trace = photo.column(channel)?;
        let resampled: Vec<f64> = indices.iter().map(|&i| trace[i]).collect();
        merged.push_column(channel, resampled)?;
    }
    Ok((merged, time_offset))
}

/// Per-trial clock: seconds since the start of each trial's first sample.
pub fn trial_clock(n_trial: &[f64], dt: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(n_trial.len());
    let mut current = f64::NAN;
    let mut count = 0usize;
    for &trial in n_trial {
        if trial != current {
            current = trial;
            count = 0;
        }
        out.push(count as f64 * dt);
        count += 1;
    }
    out
}

/// Correct the one-sample-early penalty instrumentation artifact.
///
/// The task controller raises a penalty flag (e.g. `ENLP`) one sample before
/// the penalty actually committed, so samples whose in-task counter `n<Base>`
/// is still below the reference per-trial counter `n_<Base>` from the behavior
/// log are not truly in the penalty state. Those samples are relabeled onto a
/// `state_<penalty>` column and zeroed out of the original flag. One code path
/// handles any number of penalty trials.
pub fn split_penalty_states(
    df: &mut Frame,
    behavior_df: &Frame,
    penalty: &str,
) -> Result<(), FlowError> {
    let base = &penalty[..penalty.len() - 1];
    let counter_col = format!("n{}", base);
    let ref_col = format!("n_{}", base);
    let state_col = format!("state_{}", penalty);

    // Reference counter per trial from the behavior log.
    let ref_trials = behavior_df.column("nTrial")?;
    let ref_counts = behavior_df.column(&ref_col)?;
    let reference: rustc_hash::FxHashMap<i64, f64> = ref_trials
        .iter()
        .zip(ref_counts)
        .map(|(&t, &c)| (t as i64, c))
        .collect();

    let trials = df.column("nTrial")?.to_vec();
    let flags = df.column(penalty)?.to_vec();
    let counters = df.column(&counter_col)?.to_vec();

    let penalty_trials: rustc_hash::FxHashSet<i64> = trials
        .iter()
        .zip(&flags)
        .filter(|&(_, &f)| f > FLAG_ON)
        .map(|(&t, _)| t as i64)
        .collect();

    let mut state = vec![0.0; df.len()];
    let mut corrected = flags.clone();
    for (row, &trial) in trials.iter().enumerate() {
        let trial = trial as i64;
        if !penalty_trials.contains(&trial) {
            continue;
        }
        let Some(&true_count) = reference.get(&trial) else {
            return Err(FlowError::Validation(format!(
                "behavior log has no '{}' for trial {}",
                ref_col, trial
            )));
        };
        if counters[row] < true_count {
            state[row] = flags[row];
            corrected[row] = 0.0;
        }
    }
    df.set_column(&state_col, state)?;
    df.set_column(penalty, corrected)?;
    Ok(())
}

/// Downsample by windowed aggregation: `factor` samples per bin, the remainder
/// forming a final short bin. Trace columns average; every other column takes
/// the bin maximum, so state flags are sticky within a bin.
pub fn downsample_by_aggregation(
    df: &Frame,
    trace_cols: &[String],
    factor: usize,
) -> Result<Frame, FlowError> {
    if factor == 0 {
        return Err(FlowError::Validation(
            "downsample factor must be at least 1".to_string(),
        ));
    }
    let mut out = Frame::new();
    for name in df.names() {
        let col = df.column(name)?;
        let binned = if trace_cols.contains(name) {
            decimate_mean(col, factor)
        } else {
            decimate_max(col, factor)
        };
        out.push_column(name, binned)?;
    }
    Ok(out)
}
