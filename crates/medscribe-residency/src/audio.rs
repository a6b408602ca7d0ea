//! Audio normalisation for the speech model.
//!
//! The speech engines expect 16 kHz mono `f32` samples. Callers hand in either
//! raw little-endian PCM16 (what the browser microphone stream sends) or
//! already-decoded samples at any rate; everything is converted here before
//! the manager takes its lock.

use crate::error::{EngineError, EngineResult, ResidencyError, ResidencyResult};
use std::io::Cursor;
use std::time::Duration;

/// Sample rate every speech engine consumes.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Audio as received from the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioInput {
    /// Little-endian signed 16-bit mono PCM
    Pcm16 { bytes: Vec<u8>, sample_rate: u32 },
    /// Decoded mono samples in `[-1.0, 1.0]`
    Samples { samples: Vec<f32>, sample_rate: u32 },
}

impl AudioInput {
    pub fn pcm16(bytes: impl Into<Vec<u8>>, sample_rate: u32) -> Self {
        Self::Pcm16 {
            bytes: bytes.into(),
            sample_rate,
        }
    }

    pub fn samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::Samples {
            samples,
            sample_rate,
        }
    }

    /// Decode a WAV file, downmixing to mono.
    pub fn from_wav_bytes(bytes: &[u8]) -> ResidencyResult<Self> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))
            .map_err(|e| ResidencyError::InvalidInput(format!("failed to parse WAV: {e}")))?;

        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let bits = u32::from(spec.bits_per_sample.max(1));
                let max_val = if bits > 1 {
                    ((1i64 << (bits - 1)) - 1) as f32
                } else {
                    1.0
                };
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| (s as f32 / max_val).clamp(-1.0, 1.0)))
                    .collect::<Result<Vec<f32>, _>>()
            }
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<f32>, _>>(),
        }
        .map_err(|e| ResidencyError::InvalidInput(format!("corrupt WAV sample data: {e}")))?;

        let mono = if channels > 1 {
            samples
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        } else {
            samples
        };

        Ok(Self::Samples {
            samples: mono,
            sample_rate: spec.sample_rate,
        })
    }

    /// Normalise to a 16 kHz clip.
    pub fn into_clip(self) -> ResidencyResult<AudioClip> {
        let (samples, sample_rate) = match self {
            Self::Pcm16 { bytes, sample_rate } => (pcm16_to_f32(&bytes), sample_rate),
            Self::Samples {
                samples,
                sample_rate,
            } => (samples, sample_rate),
        };

        if sample_rate == 0 {
            return Err(ResidencyError::InvalidInput(
                "sample rate must be > 0".to_string(),
            ));
        }

        let samples = if sample_rate == TARGET_SAMPLE_RATE {
            samples
        } else {
            resample_linear(&samples, sample_rate, TARGET_SAMPLE_RATE)
        };

        Ok(AudioClip { samples })
    }
}

/// A mono clip at [`TARGET_SAMPLE_RATE`].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    samples: Vec<f32>,
}

impl AudioClip {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        TARGET_SAMPLE_RATE
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(TARGET_SAMPLE_RATE))
    }

    /// Encode as a 16-bit PCM WAV file for upload.
    pub fn to_wav_bytes(&self) -> EngineResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: TARGET_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut buffer = Vec::with_capacity(44 + self.samples.len() * 2);
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec)
                .map_err(|e| EngineError::Encode(e.to_string()))?;
            for sample in &self.samples {
                let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                writer
                    .write_sample(value)
                    .map_err(|e| EngineError::Encode(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| EngineError::Encode(e.to_string()))?;
        }
        Ok(buffer)
    }
}

/// Convert little-endian PCM16 to `f32` in `[-1.0, 1.0)`. A trailing odd byte
/// is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Output length is `floor(len * to / from)`. Output points are spread evenly
/// over `[0, len]`, and positions past the last input sample hold its value.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if samples.is_empty() || from == 0 {
        return Vec::new();
    }

    let len = samples.len();
    let new_len = (len as f64 * f64::from(to) / f64::from(from)) as usize;
    if new_len == 0 {
        return Vec::new();
    }

    let last = samples[len - 1];
    let step = if new_len > 1 {
        len as f64 / (new_len - 1) as f64
    } else {
        0.0
    };

    (0..new_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx + 1 >= len {
                return last;
            }
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[idx + 1] - samples[idx]) * frac
        })
        .collect()
}
