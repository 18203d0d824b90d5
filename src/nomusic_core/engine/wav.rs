//! Small WAV helpers shared by the aligner and the mixer. Samples are
//! normalized to f32 in [-1, 1] regardless of the on-disk sample format.

use std::path::Path;

use anyhow::{Context, Result, bail};
use hound::{SampleFormat, WavSpec, WavWriter};

#[derive(Debug, Clone)]
pub(crate) struct WavData {
    pub spec: WavSpec,
    /// Interleaved samples.
    pub samples: Vec<f32>,
}

impl WavData {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.spec.channels.max(1) as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.spec.sample_rate as f64
    }

    /// Downmix to mono by averaging channels; used for correlation only.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.spec.channels.max(1) as usize;
        if channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

pub(crate) fn read_wav(path: &Path) -> Result<WavData> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open WAV {}", path.display()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("failed to read float samples from {}", path.display()))?,
        (SampleFormat::Int, bits) if bits <= 32 => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .with_context(|| format!("failed to read int samples from {}", path.display()))?
        }
        (format, bits) => bail!(
            "unsupported WAV sample format {format:?}/{bits} bit in {}",
            path.display()
        ),
    };

    Ok(WavData { spec, samples })
}

/// Write interleaved f32 samples as 16-bit PCM, the format both separators
/// and ffmpeg agree on.
pub(crate) fn write_wav_i16(path: &Path, spec: WavSpec, samples: &[f32]) -> Result<()> {
    let out_spec = WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, out_spec)
        .with_context(|| format!("failed to create WAV {}", path.display()))?;
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer
            .write_sample((clamped * i16::MAX as f32) as i16)
            .with_context(|| format!("failed to write sample to {}", path.display()))?;
    }
    writer
        .finalize()
        .with_context(|| format!("failed to finalize {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_spec(channels: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i16_wav_round_trips_within_quantization_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..4410)
            .map(|i| (i as f32 * 0.01).sin() * 0.8)
            .collect();
        write_wav_i16(&path, test_spec(1), &samples).expect("write wav");

        let read = read_wav(&path).expect("read wav");
        assert_eq!(read.spec.channels, 1);
        assert_eq!(read.spec.sample_rate, 44_100);
        assert_eq!(read.samples.len(), samples.len());
        for (a, b) in read.samples.iter().zip(&samples) {
            assert!((a - b).abs() < 1.0 / 16_000.0, "{a} vs {b}");
        }
    }

    #[test]
    fn stereo_downmix_averages_channels() {
        let data = WavData {
            spec: test_spec(2),
            samples: vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0],
        };
        assert_eq!(data.frames(), 3);
        assert_eq!(data.to_mono(), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn writer_clamps_out_of_range_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hot.wav");
        write_wav_i16(&path, test_spec(1), &[2.0, -2.0]).expect("write wav");
        let read = read_wav(&path).expect("read wav");
        assert!(read.samples[0] > 0.99);
        assert!(read.samples[1] < -0.99);
    }
}
