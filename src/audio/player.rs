//! Scheduled sound playback.
//!
//! A [`SoundPlayer`] listens to an [`AudioStream`](crate::audio::AudioStream)
//! and starts emitting its buffer at a queued sample frame. Scheduling is
//! sample-accurate: the callback that contains the scheduled frame starts
//! output at the matching in-buffer offset.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::audio::buffer::SoundBuffer;
use crate::audio::stream::{AudioStreamConfig, OutputListener};
use crate::audio::AudioError;

#[derive(Debug, Default)]
struct PlayerState {
    buffer: Option<Arc<SoundBuffer>>,
    /// Next sample frame of `buffer` to emit.
    position: usize,
    scheduled: Option<u64>,
    playing: bool,
    started_at: Option<u64>,
}

/// Plays one sound buffer starting at a scheduled stream sample frame.
#[derive(Debug)]
pub struct SoundPlayer {
    config: AudioStreamConfig,
    state: Mutex<PlayerState>,
}

impl SoundPlayer {
    /// Player for a stream with `config`.
    pub fn new(config: AudioStreamConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PlayerState::default()),
        }
    }

    /// Set the sound to play, converted to the stream's format.
    ///
    /// Stops any current playback.
    pub fn set_sound_buffer(&self, buffer: &SoundBuffer) -> Result<(), AudioError> {
        let conformed = buffer.conformed_to(self.config.output_channels, self.config.sample_rate)?;
        let mut state = self.state.lock();
        *state = PlayerState {
            buffer: Some(Arc::new(conformed)),
            ..PlayerState::default()
        };
        Ok(())
    }

    pub fn has_sound_buffer(&self) -> bool {
        self.state.lock().buffer.is_some()
    }

    /// Arm playback so the first sample is emitted at stream frame `sample_frame`.
    ///
    /// With `restart` the sound plays from its beginning, otherwise it resumes
    /// where it was stopped.
    pub fn queue_playback(&self, sample_frame: u64, restart: bool) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if state.buffer.is_none() {
            return Err(AudioError::NoSoundBuffer);
        }
        if restart {
            state.position = 0;
        }
        state.scheduled = Some(sample_frame);
        state.playing = false;
        state.started_at = None;
        debug!("Queued sound playback at sample frame {}", sample_frame);
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.scheduled = None;
        state.playing = false;
    }

    pub fn is_playing_or_queued(&self) -> bool {
        let state = self.state.lock();
        state.playing || state.scheduled.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Stream sample frame at which the current playback began.
    pub fn started_at(&self) -> Option<u64> {
        self.state.lock().started_at
    }
}

impl OutputListener for SoundPlayer {
    fn on_output(&self, output: &mut [f32], first_sample_frame: u64, config: &AudioStreamConfig) {
        let channels = config.output_channels as usize;
        let frames = output.len() / channels;
        let mut state = self.state.lock();

        let mut offset = 0;
        if let Some(scheduled) = state.scheduled {
            if first_sample_frame + frames as u64 <= scheduled {
                return;
            }
            if scheduled < first_sample_frame {
                let missed = (first_sample_frame - scheduled) as usize;
                warn!(
                    "Sound playback started {} sample frames late, skipping ahead to stay aligned",
                    missed
                );
                state.position += missed;
            } else {
                offset = (scheduled - first_sample_frame) as usize;
            }
            state.scheduled = None;
            state.playing = true;
            state.started_at = Some(scheduled);
        }
        if !state.playing {
            return;
        }

        let Some(buffer) = state.buffer.clone() else {
            state.playing = false;
            return;
        };
        let source_channels = buffer.channels() as usize;
        let data = buffer.raw_data();
        let available = buffer.sample_frames().saturating_sub(state.position);
        let count = available.min(frames - offset);
        for frame in 0..count {
            let src = (state.position + frame) * source_channels;
            let dst = (offset + frame) * channels;
            for channel in 0..channels.min(source_channels) {
                output[dst + channel] += data[src + channel];
            }
        }
        state.position += count;
        if state.position >= buffer.sample_frames() {
            state.playing = false;
            debug!("Sound playback finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AudioStreamConfig {
        AudioStreamConfig {
            sample_rate: 1_000,
            output_channels: 1,
            buffer_size: 4,
            number_of_buffers: 2,
        }
    }

    fn player(samples: Vec<f32>) -> SoundPlayer {
        let player = SoundPlayer::new(config());
        player
            .set_sound_buffer(&SoundBuffer::from_vec(samples, 1, 1_000).unwrap())
            .unwrap();
        player
    }

    fn callback(player: &SoundPlayer, first: u64) -> Vec<f32> {
        let mut output = vec![0.0; 4];
        player.on_output(&mut output, first, &config());
        output
    }

    #[test]
    fn test_queue_without_buffer_fails() {
        let player = SoundPlayer::new(config());
        assert!(player.queue_playback(0, true).is_err());
        assert!(!player.is_playing_or_queued());
    }

    #[test]
    fn test_starts_at_in_buffer_offset() {
        let player = player(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        player.queue_playback(6, true).unwrap();
        assert!(player.is_playing_or_queued());

        assert_eq!(callback(&player, 0), vec![0.0; 4]);
        assert!(!player.is_playing());
        assert_eq!(callback(&player, 4), vec![0.0, 0.0, 1.0, 2.0]);
        assert!(player.is_playing());
        assert_eq!(player.started_at(), Some(6));
        assert_eq!(callback(&player, 8), vec![3.0, 4.0, 5.0, 0.0]);
        assert!(!player.is_playing_or_queued());
    }

    #[test]
    fn test_late_start_skips_ahead() {
        let player = player(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        player.queue_playback(2, true).unwrap();
        assert_eq!(callback(&player, 4), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_stop_and_resume() {
        let player = player(vec![1.0; 12]);
        player.queue_playback(0, true).unwrap();
        callback(&player, 0);
        player.stop();
        assert!(!player.is_playing_or_queued());
        assert_eq!(callback(&player, 4), vec![0.0; 4]);

        player.queue_playback(8, false).unwrap();
        assert_eq!(callback(&player, 8), vec![1.0; 4]);
        assert_eq!(callback(&player, 12), vec![1.0; 4]);
        assert_eq!(callback(&player, 16), vec![0.0; 4]);
    }
}
