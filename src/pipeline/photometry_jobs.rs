//! The two photometry populate stages.
//!
//! `fiber_photometry` demodulates a session's raw block and persists the
//! recovered traces per fiber and color, together with the decimated behavioral
//! synchronization pulses the alignment stage needs. `fiber_photometry_synced`
//! rebuilds the demodulated frame from those rows, aligns it onto the behavior
//! clock, z-scores the detrended traces, corrects the penalty flags, and stores
//! the downsampled result as one trace row per output column.

use crate::core::error::FlowError;
use crate::core::key::Key;
use crate::core::store::{self, Record};
use crate::photometry::demodulation::{
    self, BANDPASS_BW_HZ, DEMOD_RATE_HZ, DEMOD_TAU_S, SYNCH_SIGNAL_NAMES,
};
use crate::photometry::frame::Frame;
use crate::photometry::preprocess;
use crate::pipeline::{
    self, BEHAVIOR_INGESTION, DEMODULATED_TRACE, FIBER, FIBER_PHOTOMETRY,
    PRE_FIBER_PHOTOMETRY, PRE_FIBER_PHOTOMETRY_GATE, PRE_SYNC, PRE_SYNC_GATE, SESSION_DIRECTORY,
    SYNCED, SYNCED_TRACE, parse_channel_name,
};
use crate::readers::MetaInfo;
use crate::worker::job::{JobContext, JobDescriptor, KeySource};

/// Nominal rate of the behavioral task controller (Hz).
pub const BEHAVIOR_RATE_HZ: f64 = 200.0;
/// Rolling z-score window: one minute at the behavior rate.
pub const ROLLING_Z_WIN: usize = 60 * BEHAVIOR_RATE_HZ as usize;
/// Aligned output is binned down by this factor (200 Hz to 50 Hz).
pub const DOWNSAMPLE_FACTOR: usize = 4;
/// Penalty flags that fire one sample early and need splitting.
pub const PENALTY_FLAGS: [&str; 2] = ["ENLP", "CueP"];
/// Behavior state whose first onset anchors the alignment.
const ALIGN_STATE: &str = "ENL";

/// JSON array for a trace; non-finite samples become null.
fn json_trace(samples: &[f64]) -> serde_json::Value {
    serde_json::Value::Array(
        samples
            .iter()
            .map(|&v| {
                serde_json::Number::from_f64(v)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            })
            .collect(),
    )
}

fn trace_from_payload(payload: &serde_json::Value, field: &str) -> Result<Vec<f64>, FlowError> {
    let value = payload.get(field).ok_or_else(|| {
        FlowError::Validation(format!("trace payload has no '{}'", field))
    })?;
    Ok(serde_json::from_value(value.clone())?)
}

/// Demodulate the session's raw block and insert the master row, one fiber row
/// per implanted hemisphere, and raw plus detrended trace rows per channel.
pub fn fiber_photometry_make(ctx: &JobContext<'_>, key: &Key) -> Result<(), FlowError> {
    let dir = pipeline::session_dir(ctx, key)?;
    let photometry_dir = ctx.config.session_path(&dir).join("Photometry");
    let meta = MetaInfo::read_dir(&photometry_dir)?.unwrap_or_else(MetaInfo::empty);

    let block = ctx
        .readers
        .read_block(&photometry_dir)?
        .ok_or_else(|| {
            FlowError::MissingInput(format!(
                "raw photometry block under {}",
                photometry_dir.display()
            ))
        })?;
    let demod =
        demodulation::offline_demodulation(&block, DEMOD_TAU_S, DEMOD_RATE_HZ, BANDPASS_BW_HZ)?;

    let channel_names: Vec<&str> = block.channels.iter().map(|c| c.name.as_str()).collect();
    let master = Record::with_payload(
        key.clone(),
        serde_json::json!({
            "raw_sample_rate": demod.raw_sample_rate,
            "demod_sample_rate": demod.demod_sample_rate,
            "light_source": meta.light_source(),
            "channels": channel_names,
            "synch_signals": {
                "toBehSys": json_trace(demod.frame.column(SYNCH_SIGNAL_NAMES[0])?),
                "fromBehSys": json_trace(demod.frame.column(SYNCH_SIGNAL_NAMES[1])?),
            },
        }),
    );

    let fiber_rows: Vec<Record> = demod
        .fibers
        .iter()
        .map(|hemi| {
            Record::with_payload(
                key.clone().with("fiber_id", hemi.fiber_id()),
                serde_json::json!({
                    "hemisphere": hemi.label(),
                    "notes": meta.fiber_notes(*hemi),
                    "sensor_protein": meta.sensor_protein(*hemi),
                }),
            )
        })
        .collect();

    let mut trace_rows = Vec::with_capacity(block.channels.len() * 2);
    for chan in &block.channels {
        let (color, hemi) = parse_channel_name(&chan.name)?;
        for trace_name in ["raw", "detrend"] {
            let column = format!("{}_{}", trace_name, chan.name);
            trace_rows.push(Record::with_payload(
                key.clone()
                    .with("trace_name", trace_name)
                    .with("emission_color", color.label())
                    .with("hemisphere", hemi.label()),
                serde_json::json!({
                    "fiber_id": hemi.fiber_id(),
                    "carrier_hz": chan.carrier_hz,
                    "excitation_wavelength": meta.excitation_wavelength(color.label()),
                    "emission_wavelength": meta.emission_wavelength(color.label()),
                    "trace": json_trace(demod.frame.column(&column)?),
                }),
            ));
        }
    }

    let tx = ctx.conn.unchecked_transaction()?;
    store::insert(&tx, &FIBER_PHOTOMETRY, &[master], false)?;
    store::insert(&tx, &FIBER, &fiber_rows, false)?;
    store::insert(&tx, &DEMODULATED_TRACE, &trace_rows, false)?;
    tx.commit()?;
    Ok(())
}

/// Rebuild the demodulated frame for a session from its persisted rows.
fn rebuild_demodulated(
    ctx: &JobContext<'_>,
    key: &Key,
) -> Result<(Frame, f64, Vec<String>), FlowError> {
    let master = store::fetch1(ctx.conn, &FIBER_PHOTOMETRY, key)?;
    let demod_rate = master
        .payload
        .get("demod_sample_rate")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| {
            FlowError::Validation(format!("fiber_photometry row {} has no sample rate", key))
        })?;
    let channels: Vec<String> = serde_json::from_value(
        master
            .payload
            .get("channels")
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    )?;

    let mut frame = Frame::new();
    let mut trace_cols = Vec::new();
    for name in &channels {
        let (color, hemi) = parse_channel_name(name)?;
        for trace_name in ["raw", "detrend"] {
            let record = store::fetch1(
                ctx.conn,
                &DEMODULATED_TRACE,
                &key.clone()
                    .with("trace_name", trace_name)
                    .with("emission_color", color.label())
                    .with("hemisphere", hemi.label()),
            )?;
            let column = format!("{}_{}", trace_name, name);
            frame.push_column(&column, trace_from_payload(&record.payload, "trace")?)?;
            trace_cols.push(column);
        }
    }
    let synch = master
        .payload
        .get("synch_signals")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    frame.push_column(
        SYNCH_SIGNAL_NAMES[1],
        trace_from_payload(&synch, SYNCH_SIGNAL_NAMES[1])?,
    )?;
    Ok((frame, demod_rate, trace_cols))
}

/// Align the session's traces onto the behavior clock and persist the
/// downsampled result.
pub fn fiber_photometry_synced_make(ctx: &JobContext<'_>, key: &Key) -> Result<(), FlowError> {
    let (mut photo, demod_rate, trace_cols) = rebuild_demodulated(ctx, key)?;
    preprocess::handshake_behav_recording_sys(&mut photo, SYNCH_SIGNAL_NAMES[1])?;

    let dir = pipeline::session_dir(ctx, key)?;
    let prefix = ctx.config.remote_session_prefix(&dir);
    let subject = key
        .get("subject")
        .ok_or_else(|| FlowError::Validation(format!("key {} has no subject", key)))?;
    let analog_path = pipeline::resolve_required_file(
        ctx.conn,
        &format!("{}/%{}_analog_filled.csv", prefix, subject),
    )?;
    let behavior_path = pipeline::resolve_required_file(
        ctx.conn,
        &format!("{}/%{}_behavior_df_full.csv", prefix, subject),
    )?;
    let mut analog = ctx.readers.read_table(&analog_path)?;
    let behavior_df = ctx.readers.read_table(&behavior_path)?;

    let dt = 1.0 / BEHAVIOR_RATE_HZ;
    if !analog.has_column("session_clock") {
        let clock: Vec<f64> = (0..analog.len()).map(|i| i as f64 * dt).collect();
        analog.push_column("session_clock", clock)?;
    }

    let (mut merged, time_offset) =
        preprocess::resample_and_align(&analog, &photo, &trace_cols, ALIGN_STATE, demod_rate)?;

    // Z-score the detrended traces over a sliding minute, then drop the edge
    // rows that lacked full window support.
    if merged.len() <= 2 * ROLLING_Z_WIN {
        return Err(FlowError::Validation(format!(
            "session too short to z-score: {} aligned samples",
            merged.len()
        )));
    }
    for column in &trace_cols {
        if column.starts_with("detrend_") {
            let z = demodulation::rolling_z(merged.column(column)?, ROLLING_Z_WIN);
            merged.set_column(column, z)?;
        }
    }
    let mut merged = merged.slice_rows(ROLLING_Z_WIN, merged.len() - ROLLING_Z_WIN)?;

    let trial_clock = preprocess::trial_clock(merged.column("nTrial")?, dt);
    merged.set_column("trial_clock", trial_clock)?;
    for penalty in PENALTY_FLAGS {
        if merged.has_column(penalty) {
            preprocess::split_penalty_states(&mut merged, &behavior_df, penalty)?;
        }
    }

    let output = preprocess::downsample_by_aggregation(&merged, &trace_cols, DOWNSAMPLE_FACTOR)?;
    let sample_rate = BEHAVIOR_RATE_HZ / DOWNSAMPLE_FACTOR as f64;
    let timestamps = output.column("session_clock")?;

    let master = Record::with_payload(
        key.clone(),
        serde_json::json!({
            "time_offset": time_offset,
            "sample_rate": sample_rate,
            "timestamps": json_trace(timestamps),
        }),
    );
    let mut trace_rows = Vec::new();
    for name in output.names() {
        if name == "session_clock" {
            continue;
        }
        trace_rows.push(Record::with_payload(
            key.clone().with("channel", name.as_str()),
            serde_json::json!({ "trace": json_trace(output.column(name)?) }),
        ));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    store::insert(&tx, &SYNCED, &[master], false)?;
    store::insert(&tx, &SYNCED_TRACE, &trace_rows, false)?;
    tx.commit()?;
    Ok(())
}

pub fn fiber_photometry_job() -> JobDescriptor {
    JobDescriptor::new(
        "photometry.fiber_photometry",
        &FIBER_PHOTOMETRY,
        KeySource::table(&SESSION_DIRECTORY).semi_join(&PRE_FIBER_PHOTOMETRY),
        Box::new(fiber_photometry_make),
    )
    .with_staging(&PRE_FIBER_PHOTOMETRY_GATE)
}

pub fn fiber_photometry_synced_job() -> JobDescriptor {
    JobDescriptor::new(
        "photometry.synced",
        &SYNCED,
        KeySource::table(&FIBER_PHOTOMETRY)
            .semi_join(&BEHAVIOR_INGESTION)
            .semi_join(&PRE_SYNC),
        Box::new(fiber_photometry_synced_make),
    )
    .with_staging(&PRE_SYNC_GATE)
}
