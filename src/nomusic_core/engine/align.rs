//! Cross-correlation alignment of the two separator outputs.
//!
//! The two vocal stems come from independent tools and can disagree on
//! leading padding by a handful of frames. We estimate the lag over an
//! analysis window with an FFT cross-correlation, then left-pad the earlier
//! stream with silence; audio is never truncated.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rustfft::{FftPlanner, num_complex::Complex};

use super::wav::{WavData, read_wav, write_wav_i16};

/// Samples quieter than this are treated as leading silence.
const SILENCE_GATE_DBFS: f64 = -50.0;
/// At most this much leading silence is trimmed before analysis.
const MAX_TRIM_SECONDS: f64 = 5.0;
/// Correlation is computed over at most this long a window.
const WINDOW_SECONDS: f64 = 30.0;
/// Estimates with lower peak/mean confidence are discarded.
const CONFIDENCE_FLOOR: f64 = 0.2;
/// Lags beyond this are considered implausible and forced to zero.
const MAX_LAG_SECONDS: f64 = 2.0;

#[derive(Debug, Clone)]
pub(crate) struct AlignmentResult {
    pub lag_samples: i64,
    pub lag_seconds: f64,
    pub confidence: f64,
    pub sample_rate: u32,
    pub aligned_a: PathBuf,
    pub aligned_b: PathBuf,
    /// True when the estimate was rejected (low confidence or excessive lag)
    /// and the streams were left unshifted.
    pub forced_zero: bool,
}

/// Align two equally formatted WAV files, writing `aligned_a.wav` and
/// `aligned_b.wav` into `out_dir`.
pub(crate) fn align_pair(a_path: &Path, b_path: &Path, out_dir: &Path) -> Result<AlignmentResult> {
    let a = read_wav(a_path)?;
    let b = read_wav(b_path)?;
    if a.spec.sample_rate != b.spec.sample_rate || a.spec.channels != b.spec.channels {
        bail!(
            "stream formats differ: {}Hz/{}ch vs {}Hz/{}ch",
            a.spec.sample_rate,
            a.spec.channels,
            b.spec.sample_rate,
            b.spec.channels
        );
    }
    let sample_rate = a.spec.sample_rate;

    let mono_a = a.to_mono();
    let mono_b = b.to_mono();

    // Trim the same amount of leading silence from both streams. Trimming
    // symmetrically keeps a genuine inter-stream offset intact.
    let gate = 10f64.powf(SILENCE_GATE_DBFS / 20.0) as f32;
    let max_trim = (MAX_TRIM_SECONDS * sample_rate as f64) as usize;
    let trim = leading_silence(&mono_a, gate)
        .min(leading_silence(&mono_b, gate))
        .min(max_trim);

    let window = (WINDOW_SECONDS * sample_rate as f64) as usize;
    let wa = windowed(&mono_a, trim, window);
    let wb = windowed(&mono_b, trim, window);

    let (mut lag, confidence) = if wa.is_empty() || wb.is_empty() {
        (0i64, 0.0)
    } else {
        cross_correlate(wa, wb)
    };

    let max_lag = (MAX_LAG_SECONDS * sample_rate as f64) as i64;
    let mut forced_zero = false;
    if lag.abs() > max_lag || confidence < CONFIDENCE_FLOOR {
        tracing::warn!(
            lag_samples = lag,
            confidence,
            "alignment estimate rejected, keeping streams unshifted"
        );
        lag = 0;
        forced_zero = true;
    }

    // Positive lag: A trails B, so B is the earlier stream and gets padded.
    // Negative lag: the other way around.
    let pad = lag.unsigned_abs() as usize;
    let aligned_a = out_dir.join("aligned_a.wav");
    let aligned_b = out_dir.join("aligned_b.wav");
    if lag > 0 {
        write_padded(&aligned_a, &a, 0)?;
        write_padded(&aligned_b, &b, pad)?;
    } else {
        write_padded(&aligned_a, &a, pad)?;
        write_padded(&aligned_b, &b, 0)?;
    }

    Ok(AlignmentResult {
        lag_samples: lag,
        lag_seconds: lag as f64 / sample_rate as f64,
        confidence,
        sample_rate,
        aligned_a,
        aligned_b,
        forced_zero,
    })
}

fn leading_silence(samples: &[f32], gate: f32) -> usize {
    samples
        .iter()
        .position(|s| s.abs() >= gate)
        .unwrap_or(samples.len())
}

fn windowed(samples: &[f32], trim: usize, window: usize) -> &[f32] {
    let start = trim.min(samples.len());
    let end = (start + window).min(samples.len());
    &samples[start..end]
}

/// FFT cross-correlation of `a` against `b`. Returns `(lag, confidence)`
/// where a positive lag means `a(t) ≈ b(t - lag)` (A trails B) and the
/// confidence is peak magnitude over mean magnitude, clamped to [0, 1].
fn cross_correlate(a: &[f32], b: &[f32]) -> (i64, f64) {
    let fft_size = (a.len() + b.len() - 1).next_power_of_two();

    let mut fa: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); fft_size];
    let mut fb: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); fft_size];
    for (slot, &sample) in fa.iter_mut().zip(a) {
        *slot = Complex::new(sample as f64, 0.0);
    }
    for (slot, &sample) in fb.iter_mut().zip(b) {
        *slot = Complex::new(sample as f64, 0.0);
    }

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_size);
    let ifft = planner.plan_fft_inverse(fft_size);
    fft.process(&mut fa);
    fft.process(&mut fb);

    let mut cross: Vec<Complex<f64>> = fa
        .iter()
        .zip(fb.iter())
        .map(|(x, y)| x * y.conj())
        .collect();
    ifft.process(&mut cross);

    let magnitudes: Vec<f64> = cross.iter().map(|c| c.norm()).collect();
    let mut peak_idx = 0usize;
    let mut peak = 0.0f64;
    for (i, &magnitude) in magnitudes.iter().enumerate() {
        if magnitude > peak {
            peak = magnitude;
            peak_idx = i;
        }
    }

    // Circular correlation wraps negative lags to the top of the array.
    let half = fft_size / 2;
    let lag = if peak_idx > half {
        peak_idx as i64 - fft_size as i64
    } else {
        peak_idx as i64
    };

    let mean = magnitudes.iter().sum::<f64>() / magnitudes.len() as f64;
    let confidence = if mean > 1e-12 {
        (peak / mean).min(1.0)
    } else {
        0.0
    };

    (lag, confidence)
}

fn write_padded(path: &Path, source: &WavData, pad_frames: usize) -> Result<()> {
    let channels = source.spec.channels.max(1) as usize;
    let mut samples = Vec::with_capacity(pad_frames * channels + source.samples.len());
    samples.resize(pad_frames * channels, 0.0);
    samples.extend_from_slice(&source.samples);
    write_wav_i16(path, source.spec, &samples)
        .with_context(|| format!("failed to write aligned stream {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nomusic_core::engine::wav::test_spec;

    /// Deterministic pseudo-noise with a sharp autocorrelation peak.
    fn noise(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed.max(1);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state as f32 / u32::MAX as f32) - 0.5
            })
            .collect()
    }

    fn write_test_wav(path: &Path, samples: &[f32]) {
        write_wav_i16(path, test_spec(1), samples).expect("write test wav");
    }

    #[test]
    fn identical_streams_align_with_zero_lag_and_high_confidence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signal = noise(44_100, 7);
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_test_wav(&a, &signal);
        write_test_wav(&b, &signal);

        let result = align_pair(&a, &b, dir.path()).expect("align");
        assert_eq!(result.lag_samples, 0);
        assert!(result.confidence >= 0.95, "confidence {}", result.confidence);
        assert!(!result.forced_zero);
        assert!(result.aligned_a.exists());
        assert!(result.aligned_b.exists());
    }

    #[test]
    fn delayed_copy_is_detected_and_the_earlier_stream_is_padded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signal = noise(44_100, 21);
        let offset = 1000usize;

        // B carries the same content delayed by `offset` frames, so A is the
        // earlier stream and must receive the padding.
        let mut delayed = vec![0.0f32; offset];
        delayed.extend_from_slice(&signal);

        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_test_wav(&a, &signal);
        write_test_wav(&b, &delayed);

        let result = align_pair(&a, &b, dir.path()).expect("align");
        assert_eq!(result.lag_samples, -(offset as i64));
        assert!(!result.forced_zero);

        let aligned_a = read_wav(&result.aligned_a).expect("read aligned a");
        let aligned_b = read_wav(&result.aligned_b).expect("read aligned b");
        assert_eq!(aligned_a.samples.len(), signal.len() + offset);
        assert_eq!(aligned_b.samples.len(), delayed.len());
        // The pad must be silence.
        assert!(aligned_a.samples[..offset].iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn implausibly_large_lag_is_forced_to_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signal = noise(44_100, 3);
        // 3 s offset exceeds the 2 s plausibility bound.
        let offset = 3 * 44_100;
        let mut delayed = vec![0.0f32; offset];
        delayed.extend_from_slice(&signal);

        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_test_wav(&a, &signal);
        write_test_wav(&b, &delayed);

        let result = align_pair(&a, &b, dir.path()).expect("align");
        assert_eq!(result.lag_samples, 0);
        assert!(result.forced_zero);

        // Nothing was shifted or truncated.
        let aligned_a = read_wav(&result.aligned_a).expect("read aligned a");
        assert_eq!(aligned_a.samples.len(), signal.len());
    }

    #[test]
    fn shared_leading_silence_does_not_mask_a_real_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signal = noise(44_100, 11);
        let quiet = 22_050usize; // 0.5 s of silence on both streams
        let offset = 441usize;

        let mut a_samples = vec![0.0f32; quiet];
        a_samples.extend_from_slice(&signal);
        let mut b_samples = vec![0.0f32; quiet + offset];
        b_samples.extend_from_slice(&signal);

        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_test_wav(&a, &a_samples);
        write_test_wav(&b, &b_samples);

        let result = align_pair(&a, &b, dir.path()).expect("align");
        assert_eq!(result.lag_samples, -(offset as i64));
    }

    #[test]
    fn pure_silence_yields_zero_confidence_and_no_shift() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_test_wav(&a, &vec![0.0f32; 44_100]);
        write_test_wav(&b, &vec![0.0f32; 44_100]);

        let result = align_pair(&a, &b, dir.path()).expect("align");
        assert_eq!(result.lag_samples, 0);
        assert!(result.forced_zero);
        assert_eq!(result.confidence, 0.0);
    }
}
