//! Crate-wide error type.

use crate::audio::AudioError;
use crate::core::log::Severity;
use crate::render::RenderError;

/// Errors surfaced by the scheduler, presenter and their collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Display and audio swap data did not satisfy their sync verifiers in time.
    #[error("Display or sound not ready!")]
    NotReady,
    #[error("Sync point is not valid")]
    InvalidSyncPoint,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("Slide rejected: {0}")]
    SlideRejected(String),
    #[error("No slide at index {0}")]
    NoSuchSlide(usize),
    #[error("Invalid slide state: {0}")]
    InvalidState(String),
    #[error("Rendering context is not owned by this thread")]
    ContextNotOwned,
    #[error("Failed to acquire rendering context: {0}")]
    ContextAcquisition(String),
    #[error("Display thread is not running")]
    DisplayThreadNotRunning,
    #[error("Playback is already running")]
    AlreadyPlaying,
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("{severity}: {message}")]
    Aborted { severity: Severity, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
