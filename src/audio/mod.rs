pub mod buffer;
pub mod cpal_output;
pub mod player;
pub mod stream;

pub use buffer::SoundBuffer;
pub use cpal_output::CpalOutput;
pub use player::SoundPlayer;
pub use stream::{AudioStream, AudioStreamConfig, OutputListener, SimulatedAudioDriver};

/// Errors raised by audio buffers, streams and devices.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),
    #[error("No sound buffer set")]
    NoSoundBuffer,
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}
