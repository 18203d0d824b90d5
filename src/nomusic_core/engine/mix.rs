//! Blend the two aligned vocal stems into one track.

use std::path::Path;

use anyhow::{Result, bail};

use super::wav::{read_wav, write_wav_i16};

/// Equal-weight sum of two aligned WAV files with a hard limiter at 0 dBFS.
/// Output keeps the input channel count and sample rate; its duration is the
/// longer of the two inputs (the shorter is treated as trailing silence).
pub(crate) fn mix_pair(a_path: &Path, b_path: &Path, out_path: &Path) -> Result<()> {
    let a = read_wav(a_path)?;
    let b = read_wav(b_path)?;
    if a.spec.sample_rate != b.spec.sample_rate || a.spec.channels != b.spec.channels {
        bail!(
            "cannot mix mismatched formats: {}Hz/{}ch vs {}Hz/{}ch",
            a.spec.sample_rate,
            a.spec.channels,
            b.spec.sample_rate,
            b.spec.channels
        );
    }

    let len = a.samples.len().max(b.samples.len());
    let mut mixed = Vec::with_capacity(len);
    for i in 0..len {
        let sa = a.samples.get(i).copied().unwrap_or(0.0);
        let sb = b.samples.get(i).copied().unwrap_or(0.0);
        mixed.push((sa + sb).clamp(-1.0, 1.0));
    }

    write_wav_i16(out_path, a.spec, &mixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nomusic_core::engine::wav::{read_wav, test_spec, write_wav_i16};

    #[test]
    fn mix_sums_and_keeps_the_longer_duration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        let out = dir.path().join("mix.wav");

        write_wav_i16(&a, test_spec(1), &[0.25, 0.25, 0.25]).expect("write a");
        write_wav_i16(&b, test_spec(1), &[0.25, 0.25, 0.25, 0.5, 0.5]).expect("write b");

        mix_pair(&a, &b, &out).expect("mix");
        let mixed = read_wav(&out).expect("read mix");
        assert_eq!(mixed.samples.len(), 5);
        assert!((mixed.samples[0] - 0.5).abs() < 0.01);
        // Past the end of A only B contributes.
        assert!((mixed.samples[3] - 0.5).abs() < 0.01);
    }

    #[test]
    fn limiter_prevents_clipping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        let out = dir.path().join("mix.wav");

        write_wav_i16(&a, test_spec(2), &[0.9, -0.9, 0.9, -0.9]).expect("write a");
        write_wav_i16(&b, test_spec(2), &[0.9, -0.9, 0.9, -0.9]).expect("write b");

        mix_pair(&a, &b, &out).expect("mix");
        let mixed = read_wav(&out).expect("read mix");
        assert!(mixed.samples.iter().all(|s| s.abs() <= 1.0));
        assert!(mixed.samples[0] > 0.99);
    }

    #[test]
    fn mismatched_formats_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");

        write_wav_i16(&a, test_spec(1), &[0.1]).expect("write a");
        write_wav_i16(&b, test_spec(2), &[0.1, 0.1]).expect("write b");

        assert!(mix_pair(&a, &b, &dir.path().join("mix.wav")).is_err());
    }
}
