//! Slides: units of visual presentation with intended and actual timing.

use std::fmt;
use std::sync::Arc;

use crate::core::time::Time;
use crate::render::backend::SlideContent;
use crate::render::fence::FenceSync;

/// Rendering state of a slide.
///
/// A slide moves strictly forward through
/// `NotStarted -> RenderStarted -> [RenderComplete ->] OnScreen -> Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlideState {
    NotStarted,
    /// Drawing commands were issued; the GPU has not reported completion.
    RenderStarted,
    /// The GPU fence signalled.
    RenderComplete,
    OnScreen,
    Finished,
}

impl SlideState {
    /// Whether a swap can bring the slide on screen.
    pub fn is_rendered(self) -> bool {
        matches!(self, SlideState::RenderStarted | SlideState::RenderComplete)
    }
}

/// Requested presentation duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideDuration {
    Frames(u64),
    Time(Time),
}

impl SlideDuration {
    pub fn is_positive(self) -> bool {
        match self {
            SlideDuration::Frames(frames) => frames > 0,
            SlideDuration::Time(time) => time > Time::ZERO,
        }
    }

    /// `(time, frames)` at `frame_period`. A time is rounded to the nearest
    /// frame count, never below one.
    pub fn resolve(self, frame_period: Time) -> (Time, u64) {
        match self {
            SlideDuration::Frames(frames) => (frame_period * frames as i64, frames),
            SlideDuration::Time(time) => (time, frames_for(time, frame_period)),
        }
    }
}

/// Frames covering `time`: rounded to nearest, at least 1.
pub fn frames_for(time: Time, frame_period: Time) -> u64 {
    (time / frame_period).round().max(1.0) as u64
}

/// Start and duration in both time and frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlideTimingInfo {
    pub start_time: Time,
    pub time_duration: Time,
    pub start_frame: u64,
    pub frame_duration: u64,
}

impl SlideTimingInfo {
    /// Durations of a slide that is still on screen.
    pub(crate) fn open_ended(start_time: Time, start_frame: u64) -> Self {
        Self {
            start_time,
            time_duration: Time::MAX,
            start_frame,
            frame_duration: u64::MAX,
        }
    }

    /// Whether the durations are the on-screen sentinels.
    pub fn is_open_ended(&self) -> bool {
        self.frame_duration == u64::MAX
    }
}

/// How the slide was rendered relative to its swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresentationInfo {
    pub render_start_time: Option<Time>,
    pub render_complete_time: Option<Time>,
    /// The swap that brought the slide on screen happened before the GPU
    /// finished rendering it.
    pub swapped_before_rendering_complete: bool,
}

/// Snapshot of a slide, safe to hand out while playback continues.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideRecord {
    pub index: usize,
    pub name: String,
    pub state: SlideState,
    pub intended: SlideTimingInfo,
    pub actual: SlideTimingInfo,
    pub presentation: PresentationInfo,
    pub dropped: bool,
}

/// Called on the thread that observed the swap bringing a slide on screen.
pub type SlidePresentedCallback = Arc<dyn Fn(&SlideRecord) + Send + Sync>;

/// A slide waiting to be added to a [`SlideBuffer`](super::SlideBuffer).
pub struct Slide {
    pub(crate) name: String,
    pub(crate) content: Option<SlideContent>,
    pub(crate) duration: SlideDuration,
    pub(crate) on_presented: Option<SlidePresentedCallback>,
    pub(crate) intended: SlideTimingInfo,
    pub(crate) actual: SlideTimingInfo,
    pub(crate) presentation: PresentationInfo,
    pub(crate) fence: FenceSync,
    pub(crate) state: SlideState,
    pub(crate) dropped: bool,
}

impl Slide {
    /// A slide named `name` (empty for the default `"Slide N"`).
    pub fn new(name: impl Into<String>, content: SlideContent, duration: SlideDuration) -> Self {
        Self {
            name: name.into(),
            content: Some(content),
            duration,
            on_presented: None,
            intended: SlideTimingInfo::default(),
            actual: SlideTimingInfo::default(),
            presentation: PresentationInfo::default(),
            fence: FenceSync::new(),
            state: SlideState::NotStarted,
            dropped: false,
        }
    }

    pub fn with_presented_callback(mut self, callback: SlidePresentedCallback) -> Self {
        self.on_presented = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SlideState {
        self.state
    }

    pub fn intended(&self) -> &SlideTimingInfo {
        &self.intended
    }

    pub fn actual(&self) -> &SlideTimingInfo {
        &self.actual
    }

    pub fn presentation(&self) -> &PresentationInfo {
        &self.presentation
    }

    /// Forget everything about the last presentation.
    pub(crate) fn reset_presentation_info(&mut self) {
        self.actual = SlideTimingInfo::default();
        self.presentation = PresentationInfo::default();
        self.fence.clear();
        self.state = SlideState::NotStarted;
        self.dropped = false;
    }

    pub(crate) fn record(&self, index: usize) -> SlideRecord {
        SlideRecord {
            index,
            name: self.name.clone(),
            state: self.state,
            intended: self.intended,
            actual: self.actual,
            presentation: self.presentation,
            dropped: self.dropped,
        }
    }
}

impl fmt::Debug for Slide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slide")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("intended", &self.intended)
            .field("actual", &self.actual)
            .field("presentation", &self.presentation)
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Time = Time::from_nanos(16_666_667);

    #[test]
    fn test_duration_resolution() {
        assert_eq!(frames_for(Time::from_millis(50), PERIOD), 3);
        assert_eq!(frames_for(Time::from_millis(100), PERIOD), 6);
        assert_eq!(frames_for(Time::from_millis(1), PERIOD), 1);
        assert_eq!(
            SlideDuration::Frames(4).resolve(PERIOD),
            (PERIOD * 4, 4)
        );
        assert_eq!(
            SlideDuration::Time(Time::from_millis(58)).resolve(PERIOD),
            (Time::from_millis(58), 3)
        );
    }

    #[test]
    fn test_non_positive_durations() {
        assert!(!SlideDuration::Frames(0).is_positive());
        assert!(!SlideDuration::Time(Time::ZERO).is_positive());
        assert!(!SlideDuration::Time(Time::from_millis(-5)).is_positive());
        assert!(SlideDuration::Time(Time::from_nanos(1)).is_positive());
    }

    #[test]
    fn test_reset_presentation_info() {
        let mut slide = Slide::new("a", SlideContent::draw(|_| {}), SlideDuration::Frames(2));
        slide.state = SlideState::Finished;
        slide.actual = SlideTimingInfo {
            start_time: Time::from_millis(5),
            time_duration: Time::from_millis(33),
            start_frame: 7,
            frame_duration: 2,
        };
        slide.presentation.render_start_time = Some(Time::from_millis(1));
        slide.presentation.swapped_before_rendering_complete = true;
        slide.dropped = true;

        slide.reset_presentation_info();
        assert_eq!(slide.state(), SlideState::NotStarted);
        assert_eq!(*slide.actual(), SlideTimingInfo::default());
        assert_eq!(*slide.presentation(), PresentationInfo::default());
        assert!(!slide.fence.is_syncing());
        assert!(!slide.dropped);
    }
}
