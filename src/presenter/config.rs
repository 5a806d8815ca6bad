//! Presenter configuration, loadable from TOML.
//!
//! Every section has defaults, so a file only lists what it changes. Times are
//! given in milliseconds:
//!
//! ```toml
//! mode = "RM_SM_Helped"
//! duration_mode = "frame_durations"
//!
//! [sync]
//! required_swap_duration = 500.0
//! ready_timeout = 2000.0
//!
//! [swap]
//! pre_swap_safety_buffer = 2.0
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::core::time::{serde_millis, Time};
use crate::display::DEFAULT_PRE_SWAP_SAFETY_BUFFER;
use crate::error::{Error, Result};
use crate::playback::slide_buffer::{DurationMode, DEFAULT_LATE_START_TOLERANCE};
use crate::sync::data_client::DataClientConfig;
use crate::sync::verifier::VerifierTests;

/// Where slides are rendered, where buffers are swapped, and whether the
/// predicate-driven engine orchestrates playback.
///
/// `RM`/`RT`: render on the main thread / on the display thread.
/// `SM`/`ST`: swap on the main thread / on the display thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum PresenterMode {
    #[serde(rename = "RM_SM")]
    RenderMainSwapMain,
    #[serde(rename = "RM_ST")]
    RenderMainSwapThread,
    #[serde(rename = "RT_ST")]
    RenderThreadSwapThread,
    #[default]
    #[serde(rename = "RM_SM_Helped")]
    RenderMainSwapMainHelped,
    #[serde(rename = "RM_ST_Helped")]
    RenderMainSwapThreadHelped,
    #[serde(rename = "RT_ST_Helped")]
    RenderThreadSwapThreadHelped,
}

impl PresenterMode {
    pub const ALL: [PresenterMode; 6] = [
        PresenterMode::RenderMainSwapMain,
        PresenterMode::RenderMainSwapThread,
        PresenterMode::RenderThreadSwapThread,
        PresenterMode::RenderMainSwapMainHelped,
        PresenterMode::RenderMainSwapThreadHelped,
        PresenterMode::RenderThreadSwapThreadHelped,
    ];

    /// Buffers are swapped by the display thread.
    pub fn swaps_on_thread(self) -> bool {
        !matches!(
            self,
            PresenterMode::RenderMainSwapMain | PresenterMode::RenderMainSwapMainHelped
        )
    }

    /// Slides are queued to the display thread and rendered there.
    pub fn renders_on_thread(self) -> bool {
        matches!(
            self,
            PresenterMode::RenderThreadSwapThread | PresenterMode::RenderThreadSwapThreadHelped
        )
    }

    /// Playback is orchestrated by the predicate-driven engine.
    pub fn is_helped(self) -> bool {
        matches!(
            self,
            PresenterMode::RenderMainSwapMainHelped
                | PresenterMode::RenderMainSwapThreadHelped
                | PresenterMode::RenderThreadSwapThreadHelped
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            PresenterMode::RenderMainSwapMain => "RM_SM",
            PresenterMode::RenderMainSwapThread => "RM_ST",
            PresenterMode::RenderThreadSwapThread => "RT_ST",
            PresenterMode::RenderMainSwapMainHelped => "RM_SM_Helped",
            PresenterMode::RenderMainSwapThreadHelped => "RM_ST_Helped",
            PresenterMode::RenderThreadSwapThreadHelped => "RT_ST_Helped",
        }
    }
}

impl std::fmt::Display for PresenterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// When the display and audio models are trusted.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Swapping history each model is fit on.
    #[serde(with = "serde_millis")]
    pub required_swap_duration: Time,
    /// Allowed display period deviation, as a fraction of the frame period.
    pub display_tolerance: f64,
    /// Allowed audio period deviation, as a fraction of the buffer period.
    pub sound_tolerance: f64,
    #[serde(with = "serde_millis")]
    pub ready_timeout: Time,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            required_swap_duration: Time::from_millis(500),
            display_tolerance: 0.25,
            sound_tolerance: 0.5,
            ready_timeout: Time::from_secs(2),
        }
    }
}

impl SyncConfig {
    pub fn display_client(&self) -> DataClientConfig {
        DataClientConfig {
            collection_duration: self.required_swap_duration,
            tolerance: self.display_tolerance,
            tests: VerifierTests::default(),
        }
    }

    pub fn sound_client(&self) -> DataClientConfig {
        DataClientConfig {
            collection_duration: self.required_swap_duration,
            tolerance: self.sound_tolerance,
            tests: VerifierTests::default(),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout.max(Time::ZERO).to_std()
    }
}

/// How far ahead of the next swap playback starts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AudioLeadConfig {
    /// Frames added to the lead on top of the audio latency.
    pub display_extra_lead_frames: u64,
    /// Added to the stream's buffer latency.
    #[serde(with = "serde_millis")]
    pub audio_latency_offset: Time,
}

impl Default for AudioLeadConfig {
    fn default() -> Self {
        Self {
            display_extra_lead_frames: 1,
            audio_latency_offset: Time::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    /// Swap once the predicted next refresh is this close.
    #[serde(with = "serde_millis")]
    pub pre_swap_safety_buffer: Time,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            pre_swap_safety_buffer: DEFAULT_PRE_SWAP_SAFETY_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlaybackOptions {
    /// Release slide content once the slide left the screen.
    pub deallocate_completed_slides: bool,
    /// Move later slides back when a slide comes on screen late.
    pub propagate_delays: bool,
    /// Slack before a slide counts as a late start. Zero, so any start after
    /// the intended time is late, unless set.
    #[serde(with = "serde_millis")]
    pub late_start_tolerance: Time,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            deallocate_completed_slides: false,
            propagate_delays: false,
            late_start_tolerance: DEFAULT_LATE_START_TOLERANCE,
        }
    }
}

/// Full presenter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct PresenterConfig {
    pub mode: PresenterMode,
    pub duration_mode: DurationMode,
    pub sync: SyncConfig,
    pub audio_lead: AudioLeadConfig,
    pub swap: SwapConfig,
    pub playback: PlaybackOptions,
}

impl PresenterConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: PresenterConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Reject settings no presentation can run with.
    pub fn validate(&self) -> Result<()> {
        if self.sync.required_swap_duration <= Time::ZERO {
            return Err(Error::Config("required_swap_duration must be positive".into()));
        }
        if self.sync.display_tolerance <= 0.0 || self.sync.sound_tolerance <= 0.0 {
            return Err(Error::Config("sync tolerances must be positive".into()));
        }
        if self.swap.pre_swap_safety_buffer < Time::ZERO {
            return Err(Error::Config("pre_swap_safety_buffer must not be negative".into()));
        }
        Ok(())
    }
}
