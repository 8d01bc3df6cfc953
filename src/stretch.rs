//! Pitch-preserving time stretch (WSOLA).
//!
//! Overlap-adds Hann-windowed frames taken from the input at `rate` times the
//! output hop. Each frame's read position is nudged within a small tolerance to
//! the offset that best continues the previously emitted frame, which keeps
//! periodic signals phase coherent and so preserves pitch.

use crate::audio::Waveform;
use crate::error::{DubError, DubResult};

/// Analysis frame length.
const FRAME_SECS: f64 = 0.040;
/// Maximum read-position adjustment searched per frame.
const TOLERANCE_SECS: f64 = 0.010;

/// Stretch `waveform` so it plays `rate` times faster (`rate > 1` shortens it).
///
/// Returns the stretched audio and its realized duration in seconds, measured
/// from the produced sample count. Reads past the end of the input see
/// silence, so clips shorter than a frame are handled the same way.
pub fn stretch(waveform: &Waveform, rate: f64) -> DubResult<(Waveform, f64)> {
    if !(rate > 0.0) || !rate.is_finite() {
        return Err(DubError::InvalidRate { rate });
    }
    if waveform.is_empty() {
        return Err(DubError::EmptyAudio);
    }

    let sample_rate = waveform.sample_rate;
    let target_len = ((waveform.len() as f64 / rate).round() as usize).max(1);

    let frame_len = frame_length(sample_rate);
    let samples = wsola(&waveform.samples, sample_rate, rate, target_len, frame_len);

    let out = Waveform::new(samples, sample_rate);
    let realized = out.duration_secs();
    Ok((out, realized))
}

fn frame_length(sample_rate: u32) -> usize {
    // even, so the hop is exactly half a frame
    let len = (sample_rate as f64 * FRAME_SECS) as usize;
    (len.max(64) + 1) & !1
}

fn hann(len: usize) -> Vec<f32> {
    // periodic Hann sums to 1 at 50% overlap
    (0..len)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / len as f64;
            (0.5 - 0.5 * phase.cos()) as f32
        })
        .collect()
}

fn wsola(input: &[f32], sample_rate: u32, rate: f64, target_len: usize, frame_len: usize) -> Vec<f32> {
    let hop = frame_len / 2;
    let tolerance = (sample_rate as f64 * TOLERANCE_SECS) as isize;
    let window = hann(frame_len);

    let mut out = vec![0.0f32; target_len + frame_len];
    let mut norm = vec![0.0f32; target_len + frame_len];

    let mut previous: isize = 0;
    let mut k = 0usize;
    loop {
        let out_pos = k * hop;
        if out_pos >= target_len {
            break;
        }

        let read_pos = if k == 0 {
            0
        } else {
            let nominal = (out_pos as f64 * rate).round() as isize;
            best_offset(input, previous + hop as isize, nominal, tolerance, hop)
        };

        for (i, w) in window.iter().enumerate() {
            // no fade-in on the very first frame
            let weight = if k == 0 && i < hop { 1.0 } else { *w };
            out[out_pos + i] += sample_at(input, read_pos + i as isize) * weight;
            norm[out_pos + i] += weight;
        }

        previous = read_pos;
        k += 1;
    }

    out.truncate(target_len);
    for (sample, n) in out.iter_mut().zip(&norm) {
        if *n > 1e-6 {
            *sample /= n;
        }
    }
    out
}

/// Read position within `nominal ± tolerance` whose first `len` samples best
/// match the natural continuation starting at `continuation`.
fn best_offset(input: &[f32], continuation: isize, nominal: isize, tolerance: isize, len: usize) -> isize {
    let mut best = nominal;
    let mut best_score = f32::NEG_INFINITY;
    for candidate in (nominal - tolerance)..=(nominal + tolerance) {
        if candidate < 0 {
            continue;
        }
        let score: f32 = (0..len as isize)
            .map(|i| sample_at(input, candidate + i) * sample_at(input, continuation + i))
            .sum();
        if score > best_score {
            best_score = score;
            best = candidate;
        }
    }
    best.max(0)
}

fn sample_at(input: &[f32], index: isize) -> f32 {
    if index < 0 {
        return 0.0;
    }
    input.get(index as usize).copied().unwrap_or(0.0)
}
