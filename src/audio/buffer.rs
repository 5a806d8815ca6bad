//! Sound sample storage.
//!
//! Samples are interleaved f32 PCM in [-1, 1] (L, R, L, R, ...). A buffer
//! always holds a whole number of sample frames.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::{debug, warn};

use crate::audio::AudioError;
use crate::core::time::Time;

/// Interleaved f32 audio with channel and sample-rate metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundBuffer {
    data: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl SoundBuffer {
    /// Create an empty buffer.
    pub fn new(channels: u16, sample_rate: u32) -> Result<Self, AudioError> {
        validate_format(channels, sample_rate)?;
        Ok(Self {
            data: Vec::new(),
            channels,
            sample_rate,
        })
    }

    /// Create a buffer from interleaved samples.
    pub fn from_vec(data: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self, AudioError> {
        let mut buffer = Self::new(channels, sample_rate)?;
        buffer.set_from_vector(data, channels, sample_rate)?;
        Ok(buffer)
    }

    /// Sine tone of `frequency` Hz on every channel.
    pub fn sine(
        frequency: f64,
        duration: Time,
        amplitude: f32,
        channels: u16,
        sample_rate: u32,
    ) -> Result<Self, AudioError> {
        validate_format(channels, sample_rate)?;
        let frames = (duration.as_secs_f64() * sample_rate as f64).round().max(0.0) as usize;
        let mut data = Vec::with_capacity(frames * channels as usize);
        for frame in 0..frames {
            let phase = 2.0 * std::f64::consts::PI * frequency * frame as f64 / sample_rate as f64;
            let value = amplitude * phase.sin() as f32;
            data.extend(std::iter::repeat(value).take(channels as usize));
        }
        Ok(Self {
            data,
            channels,
            sample_rate,
        })
    }

    /// Replace the contents with `data`.
    ///
    /// A trailing partial sample frame is dropped with a warning.
    pub fn set_from_vector(&mut self, mut data: Vec<f32>, channels: u16, sample_rate: u32) -> Result<(), AudioError> {
        validate_format(channels, sample_rate)?;
        let remainder = data.len() % channels as usize;
        if remainder != 0 {
            warn!(
                "Dropping {} trailing samples that do not form a whole frame of {} channels",
                remainder, channels
            );
            data.truncate(data.len() - remainder);
        }
        self.data = data;
        self.channels = channels;
        self.sample_rate = sample_rate;
        Ok(())
    }

    /// The interleaved samples.
    pub fn raw_data(&self) -> &[f32] {
        &self.data
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames (samples per channel).
    pub fn sample_frames(&self) -> usize {
        self.data.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration(&self) -> Time {
        Time::from_secs_f64(self.sample_frames() as f64 / self.sample_rate as f64)
    }

    /// Sample at `frame` on `channel`, or silence outside the buffer.
    pub fn sample(&self, frame: usize, channel: u16) -> f32 {
        if channel >= self.channels {
            return 0.0;
        }
        self.data
            .get(frame * self.channels as usize + channel as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Copy with `channels` output channels.
    ///
    /// Mono is duplicated to every channel, anything mixed down to mono is
    /// averaged, and otherwise channels are mapped by index with silence for
    /// channels the source does not have.
    pub fn with_channels(&self, channels: u16) -> Result<Self, AudioError> {
        validate_format(channels, self.sample_rate)?;
        if channels == self.channels {
            return Ok(self.clone());
        }
        let frames = self.sample_frames();
        let mut data = Vec::with_capacity(frames * channels as usize);
        for frame in 0..frames {
            if channels == 1 {
                let sum: f32 = (0..self.channels).map(|c| self.sample(frame, c)).sum();
                data.push(sum / self.channels as f32);
            } else if self.channels == 1 {
                let value = self.sample(frame, 0);
                data.extend(std::iter::repeat(value).take(channels as usize));
            } else {
                data.extend((0..channels).map(|c| self.sample(frame, c)));
            }
        }
        debug!("Adapted sound buffer from {} to {} channels", self.channels, channels);
        Ok(Self {
            data,
            channels,
            sample_rate: self.sample_rate,
        })
    }

    /// Copy at `sample_rate`, using linear interpolation between frames.
    pub fn resampled(&self, sample_rate: u32) -> Result<Self, AudioError> {
        validate_format(self.channels, sample_rate)?;
        if sample_rate == self.sample_rate || self.is_empty() {
            return Ok(Self {
                data: self.data.clone(),
                channels: self.channels,
                sample_rate,
            });
        }
        let frames = self.sample_frames();
        let ratio = self.sample_rate as f64 / sample_rate as f64;
        let out_frames = (frames as f64 / ratio).round().max(1.0) as usize;
        let mut data = Vec::with_capacity(out_frames * self.channels as usize);
        for out in 0..out_frames {
            let position = out as f64 * ratio;
            let index = (position.floor() as usize).min(frames - 1);
            let next = (index + 1).min(frames - 1);
            let fraction = (position - index as f64).clamp(0.0, 1.0) as f32;
            for channel in 0..self.channels {
                let a = self.sample(index, channel);
                let b = self.sample(next, channel);
                data.push(a + (b - a) * fraction);
            }
        }
        debug!("Resampled sound buffer from {} Hz to {} Hz", self.sample_rate, sample_rate);
        Ok(Self {
            data,
            channels: self.channels,
            sample_rate,
        })
    }

    /// Copy matching an output stream's channel count and sample rate.
    pub fn conformed_to(&self, channels: u16, sample_rate: u32) -> Result<Self, AudioError> {
        self.with_channels(channels)?.resampled(sample_rate)
    }

    /// Write as 16-bit PCM WAV.
    pub fn write_wav(&self, path: impl AsRef<Path>) -> Result<(), AudioError> {
        let spec = WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for &sample in &self.data {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer.write_sample(value)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Read a WAV file with integer or float samples.
    pub fn read_wav(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        let data = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Self::from_vec(data, spec.channels, spec.sample_rate)
    }
}

fn validate_format(channels: u16, sample_rate: u32) -> Result<(), AudioError> {
    if channels == 0 {
        return Err(AudioError::InvalidFormat("channel count must be positive".into()));
    }
    if sample_rate == 0 {
        return Err(AudioError::InvalidFormat("sample rate must be positive".into()));
    }
    Ok(())
}
