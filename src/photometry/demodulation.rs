//! Offline demodulation of multiplexed photometry signals.
//!
//! Each fiber's emission is amplitude-modulated on its own carrier so several
//! excitation wavelengths can share one photodetector. Recovery is quadrature
//! demodulation: multiply by sine and cosine at the carrier, low-pass both
//! products, take the magnitude. The result is band-limited and decimated to
//! the working rate, with a slow-baseline-subtracted `detrend_*` companion for
//! every `raw_*` trace. Channels are independent, so they fan out across a
//! rayon pool.

use rayon::prelude::*;
use std::f64::consts::TAU;

use crate::core::error::FlowError;
use crate::photometry::frame::Frame;
use crate::pipeline::Hemisphere;
use crate::readers::RawBlock;

/// Low-pass time constant applied to the quadrature products (seconds).
pub const DEMOD_TAU_S: f64 = 0.05;
/// Width of the band kept around each carrier (Hz).
pub const BANDPASS_BW_HZ: f64 = 20.0;
/// Working rate the demodulated traces are decimated to (Hz).
pub const DEMOD_RATE_HZ: f64 = 600.0;
/// Slow baseline time constant for the detrended companion trace (seconds).
const BASELINE_TAU_S: f64 = 30.0;

/// Column names of the behavioral synchronization pulses carried alongside the
/// traces in every demodulated frame.
pub const SYNCH_SIGNAL_NAMES: [&str; 2] = ["toBehSys", "fromBehSys"];

pub struct Demodulated {
    /// `raw_<chan>` and `detrend_<chan>` trace columns plus the sync columns,
    /// all at the demodulated rate.
    pub frame: Frame,
    /// Fibers present, ordered by fiber id.
    pub fibers: Vec<Hemisphere>,
    pub raw_sample_rate: f64,
    pub demod_sample_rate: f64,
}

/// Demodulate a raw block and decimate everything to `downsample_fs`.
pub fn offline_demodulation(
    block: &RawBlock,
    tau_s: f64,
    downsample_fs: f64,
    bandpass_bw_hz: f64,
) -> Result<Demodulated, FlowError> {
    if block.sample_rate <= 0.0 {
        return Err(FlowError::Validation(format!(
            "raw sample rate must be positive, got {}",
            block.sample_rate
        )));
    }
    if block.channels.is_empty() {
        return Err(FlowError::Validation(
            "raw block has no channels".to_string(),
        ));
    }
    let n = block.to_beh_sys.len();
    if block.from_beh_sys.len() != n
        || block.channels.iter().any(|c| c.samples.len() != n)
    {
        return Err(FlowError::Validation(
            "raw block channels and sync pulses differ in length".to_string(),
        ));
    }

    let factor = ((block.sample_rate / downsample_fs).round() as usize).max(1);
    let demod_rate = block.sample_rate / factor as f64;

    let demodulated: Vec<(String, Vec<f64>, Vec<f64>)> = block
        .channels
        .par_iter()
        .map(|chan| {
            let amp = quadrature_demodulate(
                &chan.samples,
                block.sample_rate,
                chan.carrier_hz,
                tau_s,
                bandpass_bw_hz,
            );
            let raw = decimate_mean(&amp, factor);
            let detrend = detrend_normalize(&raw, demod_rate);
            (chan.name.clone(), raw, detrend)
        })
        .collect();

    let mut frame = Frame::new();
    for (name, raw, detrend) in demodulated {
        frame.push_column(&format!("raw_{}", name), raw)?;
        frame.push_column(&format!("detrend_{}", name), detrend)?;
    }
    frame.push_column(SYNCH_SIGNAL_NAMES[0], decimate_max(&block.to_beh_sys, factor))?;
    frame.push_column(SYNCH_SIGNAL_NAMES[1], decimate_max(&block.from_beh_sys, factor))?;

    let mut fibers: Vec<Hemisphere> = block
        .channels
        .iter()
        .map(|c| Hemisphere::from_channel_name(&c.name))
        .collect::<Result<Vec<_>, _>>()?;
    fibers.sort_by_key(|h| h.fiber_id());
    fibers.dedup();

    Ok(Demodulated {
        frame,
        fibers,
        raw_sample_rate: block.sample_rate,
        demod_sample_rate: demod_rate,
    })
}

fn quadrature_demodulate(
    samples: &[f64],
    fs: f64,
    carrier_hz: f64,
    tau_s: f64,
    bandpass_bw_hz: f64,
) -> Vec<f64> {
    let dt = 1.0 / fs;
    let mut in_phase = Vec::with_capacity(samples.len());
    let mut quadrature = Vec::with_capacity(samples.len());
    for (i, &x) in samples.iter().enumerate() {
        let phase = TAU * carrier_hz * i as f64 * dt;
        in_phase.push(x * phase.cos());
        quadrature.push(x * phase.sin());
    }
    one_pole_lowpass(&mut in_phase, tau_s, dt);
    one_pole_lowpass(&mut quadrature, tau_s, dt);

    // Magnitude of the rotated baseband; the factor 2 restores the carrier
    // amplitude split between the two quadrature products.
    let mut amp: Vec<f64> = in_phase
        .iter()
        .zip(&quadrature)
        .map(|(i, q)| 2.0 * (i * i + q * q).sqrt())
        .collect();

    // Band-limit to ±bw/2 around the carrier before decimation.
    let band_tau = 1.0 / (std::f64::consts::PI * bandpass_bw_hz);
    one_pole_lowpass(&mut amp, band_tau, dt);
    amp
}

fn one_pole_lowpass(x: &mut [f64], tau_s: f64, dt: f64) {
    let alpha = dt / (tau_s + dt);
    let mut state = match x.first() {
        Some(&v) => v,
        None => return,
    };
    for v in x.iter_mut() {
        state += alpha * (*v - state);
        *v = state;
    }
}

/// Decimate by averaging consecutive windows of `factor` samples; the trailing
/// remainder forms a final short window, never dropped.
pub fn decimate_mean(x: &[f64], factor: usize) -> Vec<f64> {
    x.chunks(factor)
        .map(|c| c.iter().sum::<f64>() / c.len() as f64)
        .collect()
}

/// Decimate by max: pulse and flag trains stay sticky through decimation.
pub fn decimate_max(x: &[f64], factor: usize) -> Vec<f64> {
    x.chunks(factor)
        .map(|c| c.iter().copied().fold(f64::MIN, f64::max))
        .collect()
}

/// Subtract a slow exponential baseline and scale to unit variance.
fn detrend_normalize(raw: &[f64], rate: f64) -> Vec<f64> {
    let mut baseline = raw.to_vec();
    one_pole_lowpass(&mut baseline, BASELINE_TAU_S, 1.0 / rate);
    let detrended: Vec<f64> = raw.iter().zip(&baseline).map(|(x, b)| x - b).collect();
    let n = detrended.len() as f64;
    if n == 0.0 {
        return detrended;
    }
    let mean = detrended.iter().sum::<f64>() / n;
    let var = detrended.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    let std = var.sqrt();
    if std > 0.0 {
        detrended.iter().map(|x| (x - mean) / std).collect()
    } else {
        vec![0.0; detrended.len()]
    }
}

/// Centered rolling z-score over a window of `wn` samples. Rows without full
/// window support come back NaN; callers drop `wn` rows from each edge.
pub fn rolling_z(x: &[f64], wn: usize) -> Vec<f64> {
    let len = x.len();
    if wn == 0 || wn > len {
        return vec![f64::NAN; len];
    }
    let mut s1 = vec![0.0; len + 1];
    let mut s2 = vec![0.0; len + 1];
    for (i, &v) in x.iter().enumerate() {
        s1[i + 1] = s1[i] + v;
        s2[i + 1] = s2[i] + v * v;
    }
    let half = wn / 2;
    let mut out = vec![f64::NAN; len];
    for i in 0..len {
        let Some(start) = i.checked_sub(half) else {
            continue;
        };
        let end = start + wn;
        if end > len {
            continue;
        }
        let mean = (s1[end] - s1[start]) / wn as f64;
        let var = ((s2[end] - s2[start]) / wn as f64 - mean * mean).max(0.0);
        let std = var.sqrt();
        out[i] = if std > 0.0 { (x[i] - mean) / std } else { 0.0 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::RawChannel;

    fn synthetic_block(n: usize, fs: f64, carrier: f64, envelope: impl Fn(f64) -> f64) -> RawBlock {
        let samples: Vec<f64> = (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                envelope(t) * (TAU * carrier * t).sin()
            })
            .collect();
        RawBlock {
            sample_rate: fs,
            channels: vec![RawChannel {
                name: "grnR".to_string(),
                carrier_hz: carrier,
                samples,
            }],
            to_beh_sys: vec![0.0; n],
            from_beh_sys: vec![0.0; n],
        }
    }

    #[test]
    fn recovers_constant_envelope() {
        let fs = 6000.0;
        let block = synthetic_block(6 * 6000, fs, 211.0, |_| 3.0);
        let out = offline_demodulation(&block, DEMOD_TAU_S, DEMOD_RATE_HZ, BANDPASS_BW_HZ).unwrap();
        assert_eq!(out.demod_sample_rate, 600.0);
        let raw = out.frame.column("raw_grnR").unwrap();
        // Settle past the filter transient, then the envelope should be flat.
        let tail = &raw[raw.len() / 2..];
        for &v in tail {
            assert!((v - 3.0).abs() < 0.15, "envelope {} drifted from 3.0", v);
        }
        assert_eq!(out.fibers, vec![Hemisphere::Right]);
        assert_eq!(out.raw_sample_rate, fs);
    }

    #[test]
    fn rolling_z_marks_unsupported_edges() {
        let x: Vec<f64> = (0..100).map(|i| (i % 7) as f64).collect();
        let z = rolling_z(&x, 20);
        assert!(z[0].is_nan());
        assert!(z[5].is_nan());
        assert!(!z[50].is_nan());
        assert!(z[99].is_nan());
    }

    #[test]
    fn decimation_keeps_partial_final_bin() {
        assert_eq!(decimate_mean(&[1.0, 3.0, 5.0, 7.0, 9.0], 2), vec![2.0, 6.0, 9.0]);
        assert_eq!(decimate_max(&[0.0, 1.0, 0.0], 2), vec![1.0, 0.0]);
    }
}
