//! cpal device output for an [`AudioStream`].
//!
//! The device callback runs on cpal's real-time thread. Every callback is
//! forwarded to [`AudioStream::process_buffer`], which timestamps it and lets
//! the listeners (the sound player) fill it. Errors on the callback thread
//! are logged, never propagated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use tracing::{debug, error, info};

use crate::audio::stream::{AudioStream, AudioStreamConfig};
use crate::audio::AudioError;

/// Default output device driving an [`AudioStream`].
pub struct CpalOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    audio: Arc<AudioStream>,
    stream: Option<Stream>,
    error_flag: Arc<AtomicBool>,
}

impl CpalOutput {
    /// Stream format of the default output device with the given buffering.
    pub fn default_stream_config(buffer_size: u32, number_of_buffers: u32) -> Result<AudioStreamConfig, AudioError> {
        let device = default_device()?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::Device(format!("Failed to get default config: {}", e)))?;
        Ok(AudioStreamConfig {
            sample_rate: supported.sample_rate().0,
            output_channels: supported.channels(),
            buffer_size,
            number_of_buffers,
        })
    }

    /// Open the default output device for `audio`'s configuration.
    pub fn new(audio: Arc<AudioStream>) -> Result<Self, AudioError> {
        let device = default_device()?;
        let sample_format = device
            .default_output_config()
            .map_err(|e| AudioError::Device(format!("Failed to get default config: {}", e)))?
            .sample_format();
        let format = *audio.config();
        let config = StreamConfig {
            channels: format.output_channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Fixed(format.buffer_size),
        };
        debug!(
            "Audio config: sample_rate={}, channels={}, format={:?}, buffer_size={}",
            format.sample_rate, format.output_channels, sample_format, format.buffer_size
        );
        Ok(Self {
            device,
            config,
            sample_format,
            audio,
            stream: None,
            error_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn audio_stream(&self) -> &Arc<AudioStream> {
        &self.audio
    }

    /// Start the device stream.
    pub fn play(&mut self) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream_f32()?,
            SampleFormat::I16 => self.build_stream_i16()?,
            other => {
                return Err(AudioError::Device(format!("Unsupported sample format: {:?}", other)));
            }
        };
        stream
            .play()
            .map_err(|e| AudioError::Device(format!("Failed to start stream: {}", e)))?;
        self.stream = Some(stream);
        info!("Audio output started");
        Ok(())
    }

    /// Stop and close the device stream.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("Audio output stopped");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether the device reported an error since the stream was built.
    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::Acquire)
    }

    fn build_stream_f32(&self) -> Result<Stream, AudioError> {
        let audio = Arc::clone(&self.audio);
        let error_flag = Arc::clone(&self.error_flag);
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    audio.process_buffer(data);
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    error_flag.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| AudioError::Device(format!("Failed to build stream: {}", e)))
    }

    fn build_stream_i16(&self) -> Result<Stream, AudioError> {
        let audio = Arc::clone(&self.audio);
        let error_flag = Arc::clone(&self.error_flag);
        let mut scratch: Vec<f32> = Vec::new();
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    audio.process_buffer(&mut scratch);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    error_flag.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| AudioError::Device(format!("Failed to build stream: {}", e)))
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn default_device() -> Result<Device, AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    if let Ok(name) = device.name() {
        info!("Using default audio device: {}", name);
    }
    Ok(device)
}
