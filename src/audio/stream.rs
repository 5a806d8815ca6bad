//! Audio stream source.
//!
//! An [`AudioStream`] is driven by a device callback (or a simulated driver)
//! once per hardware buffer. Each callback fills the buffer through the
//! registered [`OutputListener`]s and publishes `(first sample frame, time)`
//! into the stream's swap data so the synchronizer can model the sample
//! clock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::AudioError;
use crate::core::clock::Clock;
use crate::core::time::Time;
use crate::sync::swap_data::{SwapDataContainer, DEFAULT_CAPACITY};

/// Output stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioStreamConfig {
    pub sample_rate: u32,
    pub output_channels: u16,
    /// Sample frames per hardware buffer.
    pub buffer_size: u32,
    /// Buffers queued between the callback and the speaker.
    pub number_of_buffers: u32,
}

impl Default for AudioStreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            output_channels: 2,
            buffer_size: 256,
            number_of_buffers: 4,
        }
    }
}

impl AudioStreamConfig {
    /// Duration of one hardware buffer.
    pub fn latency_per_buffer(&self) -> Time {
        Time::from_secs_f64(self.buffer_size as f64 / self.sample_rate as f64)
    }

    /// Duration of all queued buffers.
    pub fn total_latency(&self) -> Time {
        self.latency_per_buffer() * self.number_of_buffers as i64
    }

    fn validate(&self) -> Result<(), AudioError> {
        if self.sample_rate == 0 || self.output_channels == 0 || self.buffer_size == 0 {
            return Err(AudioError::InvalidFormat(format!(
                "sample rate, channel count and buffer size must be positive: {:?}",
                self
            )));
        }
        if self.number_of_buffers == 0 {
            return Err(AudioError::InvalidFormat("number of buffers must be positive".into()));
        }
        Ok(())
    }
}

/// Receives every output buffer before it is handed to the device.
///
/// `output` holds interleaved samples, already zeroed, for
/// `output.len() / config.output_channels` sample frames starting at
/// `first_sample_frame`. Listeners mix into it.
pub trait OutputListener: Send + Sync {
    fn on_output(&self, output: &mut [f32], first_sample_frame: u64, config: &AudioStreamConfig);
}

/// Sample-clock swap source.
pub struct AudioStream {
    config: AudioStreamConfig,
    clock: Arc<dyn Clock>,
    swap_data: Arc<SwapDataContainer>,
    listeners: Mutex<Vec<Arc<dyn OutputListener>>>,
    next_sample_frame: AtomicU64,
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("config", &self.config)
            .field("next_sample_frame", &self.next_sample_frame)
            .finish_non_exhaustive()
    }
}

impl AudioStream {
    pub fn new(config: AudioStreamConfig, clock: Arc<dyn Clock>) -> Result<Self, AudioError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            swap_data: SwapDataContainer::shared(DEFAULT_CAPACITY, config.buffer_size as u64),
            listeners: Mutex::new(Vec::new()),
            next_sample_frame: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &AudioStreamConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn latency_per_buffer(&self) -> Time {
        self.config.latency_per_buffer()
    }

    pub fn swap_data(&self) -> &Arc<SwapDataContainer> {
        &self.swap_data
    }

    /// Sample frame the next callback starts at.
    pub fn sample_frame_position(&self) -> u64 {
        self.next_sample_frame.load(Ordering::Acquire)
    }

    pub fn add_output_listener(&self, listener: Arc<dyn OutputListener>) {
        self.listeners.lock().push(listener);
    }

    /// Returns whether `listener` was registered.
    pub fn remove_output_listener(&self, listener: &Arc<dyn OutputListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Fill one device buffer, timestamped with the stream clock.
    pub fn process_buffer(&self, output: &mut [f32]) {
        let now = self.clock.now();
        self.process_buffer_at(output, now);
    }

    /// Fill one device buffer whose callback happened at `time`.
    pub fn process_buffer_at(&self, output: &mut [f32], time: Time) {
        let channels = self.config.output_channels as usize;
        let frames = output.len() / channels;
        output.fill(0.0);
        if frames == 0 {
            return;
        }
        if output.len() % channels != 0 {
            warn!(
                "Audio buffer of {} samples is not a whole number of {}-channel frames",
                output.len(),
                channels
            );
        }

        let first = self.next_sample_frame.fetch_add(frames as u64, Ordering::AcqRel);
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener.on_output(output, first, &self.config);
        }
        self.swap_data.store(first, time);
    }
}

/// Drives an [`AudioStream`] at its nominal buffer rate without a device.
///
/// Either pumped explicitly up to a point in time, which is deterministic
/// on a manual clock, or run on its own thread against the stream clock.
pub struct SimulatedAudioDriver {
    stream: Arc<AudioStream>,
    next_callback: Mutex<Time>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedAudioDriver {
    /// Driver whose first callback happens at `origin`.
    pub fn new(stream: Arc<AudioStream>, origin: Time) -> Self {
        Self {
            stream,
            next_callback: Mutex::new(origin),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> &Arc<AudioStream> {
        &self.stream
    }

    /// Run every callback scheduled at or before `until`. Returns how many ran.
    pub fn pump_until(&self, until: Time) -> usize {
        let config = *self.stream.config();
        let period = config.latency_per_buffer();
        let mut buffer = vec![0.0; (config.buffer_size * config.output_channels as u32) as usize];
        let mut next = self.next_callback.lock();
        let mut count = 0;
        while *next <= until {
            self.stream.process_buffer_at(&mut buffer, *next);
            *next += period;
            count += 1;
        }
        count
    }

    /// Start calling back on a thread named "audio".
    pub fn start(&self) -> Result<(), AudioError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let stream = Arc::clone(&self.stream);
        let running = Arc::clone(&self.running);
        let spawned = std::thread::Builder::new().name("audio".into()).spawn(move || {
            let config = *stream.config();
            let period = config.latency_per_buffer();
            let mut buffer = vec![0.0; (config.buffer_size * config.output_channels as u32) as usize];
            let mut next = stream.clock().now();
            while running.load(Ordering::Acquire) {
                stream.clock().sleep_until(next);
                stream.process_buffer(&mut buffer);
                next += period;
            }
            debug!("Simulated audio driver stopped");
        });
        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                info!("Simulated audio driver started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(AudioError::Device(format!("Failed to spawn audio thread: {}", e)))
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Simulated audio thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for SimulatedAudioDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    struct Constant(f32);

    impl OutputListener for Constant {
        fn on_output(&self, output: &mut [f32], _first: u64, _config: &AudioStreamConfig) {
            for sample in output.iter_mut() {
                *sample += self.0;
            }
        }
    }

    fn stream() -> Arc<AudioStream> {
        let clock = Arc::new(ManualClock::new(Time::ZERO, Time::ZERO));
        Arc::new(AudioStream::new(AudioStreamConfig::default(), clock).unwrap())
    }

    #[test]
    fn test_latency() {
        let config = AudioStreamConfig {
            buffer_size: 480,
            ..AudioStreamConfig::default()
        };
        assert_eq!(config.latency_per_buffer(), Time::from_millis(10));
        assert_eq!(config.total_latency(), Time::from_millis(40));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = Arc::new(ManualClock::new(Time::ZERO, Time::ZERO));
        let config = AudioStreamConfig {
            buffer_size: 0,
            ..AudioStreamConfig::default()
        };
        assert!(AudioStream::new(config, clock).is_err());
    }

    #[test]
    fn test_process_publishes_swap_data() {
        let stream = stream();
        let mut output = vec![1.0; 512];
        stream.process_buffer_at(&mut output, Time::from_millis(1));
        stream.process_buffer_at(&mut output, Time::from_millis(2));

        let data = stream.swap_data().data();
        assert_eq!(data.len(), 2);
        assert_eq!((data[0].unit, data[1].unit), (0, 256));
        assert_eq!(stream.swap_data().next_swap_unit(), 512);
        assert_eq!(stream.sample_frame_position(), 512);
        // zeroed without listeners
        assert!(output.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_listeners_mix() {
        let stream = stream();
        let a: Arc<dyn OutputListener> = Arc::new(Constant(0.25));
        stream.add_output_listener(Arc::clone(&a));
        stream.add_output_listener(Arc::new(Constant(0.5)));
        let mut output = vec![0.0; 8];
        stream.process_buffer_at(&mut output, Time::ZERO);
        assert!(output.iter().all(|&s| s == 0.75));

        assert!(stream.remove_output_listener(&a));
        assert!(!stream.remove_output_listener(&a));
        stream.process_buffer_at(&mut output, Time::from_millis(1));
        assert!(output.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_pump_until() {
        let stream = stream();
        let driver = SimulatedAudioDriver::new(Arc::clone(&stream), Time::ZERO);
        let period = stream.latency_per_buffer();
        assert_eq!(driver.pump_until(period * 9), 10);
        assert_eq!(driver.pump_until(period * 9), 0);
        assert_eq!(stream.swap_data().last_swap_unit(), 9 * 256);
        assert_eq!(stream.swap_data().last_swap_time(), period * 9);
    }
}
