//! Ordered slides bound to one display.
//!
//! The buffer owns every slide's state machine. Render callbacks run with the
//! buffer unlocked: the content is cloned out, rendered, and the resulting
//! fence is stored back under the lock.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, error, trace, warn};

use crate::core::log::{LogPolicy, Severity};
use crate::core::time::Time;
use crate::display::{Display, DisplayCommand, QueuedFrameResult};
use crate::error::{Error, Result};
use crate::playback::slide::{
    frames_for, Slide, SlideDuration, SlidePresentedCallback, SlideRecord, SlideState, SlideTimingInfo,
};
use crate::render::backend::{GpuFence, RenderTarget, SlideContent};
use crate::sync::swap_data::SwapData;

/// Default slack before a slide counts as starting late. Any start after the
/// intended time is late unless a tolerance is configured.
pub const DEFAULT_LATE_START_TOLERANCE: Time = Time::ZERO;

/// Which duration of each slide is authoritative when laying out starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationMode {
    /// Frame counts are rounded from time durations.
    #[default]
    TimeDurations,
    /// Time durations follow from frame counts.
    FrameDurations,
}

/// Timing errors found after a presentation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentationErrors {
    /// Slides, other than the last, shown for a different number of frames
    /// than intended.
    pub incorrect_frame_counts: usize,
    /// Slides swapped in before the GPU finished rendering them.
    pub late_copies_to_back_buffer: usize,
    /// Slides that came on screen after their intended start time.
    pub late_starts: usize,
    pub dropped_slides: usize,
    pub names_of_slides_with_errors: Vec<String>,
}

impl PresentationErrors {
    pub fn total_errors(&self) -> usize {
        self.incorrect_frame_counts + self.late_copies_to_back_buffer + self.late_starts + self.dropped_slides
    }
}

/// A slide brought on screen, with its callback to run once unlocked.
pub(crate) struct SwappedIn {
    pub record: SlideRecord,
    pub callback: Option<SlidePresentedCallback>,
}

impl SwappedIn {
    pub fn notify(self) {
        if let Some(callback) = self.callback {
            callback(&self.record);
        }
    }
}

/// Ordered slides with their intended and actual timing.
///
/// # Thread Safety
///
/// All slide state lives behind one mutex, so the buffer can be shared
/// (`Arc<SlideBuffer>`) with display-thread completion callbacks.
pub struct SlideBuffer {
    display: Arc<Display>,
    slides: Mutex<Vec<Slide>>,
    policy: LogPolicy,
    late_start_tolerance: Time,
}

impl SlideBuffer {
    pub fn new(display: Arc<Display>) -> Self {
        Self {
            display,
            slides: Mutex::new(Vec::new()),
            policy: LogPolicy::new(),
            late_start_tolerance: DEFAULT_LATE_START_TOLERANCE,
        }
    }

    pub fn with_policy(mut self, policy: LogPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Let slides start up to `tolerance` after their intended time before
    /// they count as late starts.
    pub fn with_late_start_tolerance(mut self, tolerance: Time) -> Self {
        self.late_start_tolerance = tolerance;
        self
    }

    pub fn display(&self) -> &Arc<Display> {
        &self.display
    }

    pub fn frame_period(&self) -> Time {
        self.display.frame_period()
    }

    /// Append `slide` and return its index.
    ///
    /// # Errors
    ///
    /// Returns `Error::SlideRejected` for a non-positive duration.
    pub fn add(&self, mut slide: Slide) -> Result<usize> {
        if !slide.duration.is_positive() {
            let message = format!("Rejected slide '{}' with non-positive duration {:?}", slide.name, slide.duration);
            self.policy.report(Severity::Warning, &message)?;
            return Err(Error::SlideRejected(message));
        }
        let mut slides = self.slides.lock();
        let index = slides.len();
        if slide.name.is_empty() {
            slide.name = format!("Slide {}", index);
        }
        let (time_duration, frame_duration) = slide.duration.resolve(self.frame_period());
        slide.intended = SlideTimingInfo {
            time_duration,
            frame_duration,
            ..SlideTimingInfo::default()
        };
        debug!(
            "Added slide '{}' ({} frames, {})",
            slide.name, frame_duration, time_duration
        );
        slides.push(slide);
        Ok(index)
    }

    /// Allocate a framebuffer of the display's size, draw it once with `draw`
    /// and append it as a slide. Requires the rendering context.
    pub fn add_framebuffer_slide(
        &self,
        name: impl Into<String>,
        duration: SlideDuration,
        draw: impl FnMut(&mut dyn RenderTarget),
    ) -> Result<usize> {
        let (width, height) = self.display.resolution();
        let framebuffer = self.display.create_framebuffer(width, height)?;
        self.display.draw_framebuffer(&framebuffer, draw)?;
        self.add(Slide::new(name, SlideContent::Framebuffer(framebuffer), duration))
    }

    pub fn len(&self) -> usize {
        self.slides.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slides.lock().is_empty()
    }

    /// Remove every slide.
    pub fn clear(&self) {
        self.slides.lock().clear();
    }

    /// Index of the first slide called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.slides.lock().iter().position(|s| s.name == name)
    }

    pub fn record(&self, index: usize) -> Option<SlideRecord> {
        self.slides.lock().get(index).map(|s| s.record(index))
    }

    pub fn record_by_name(&self, name: &str) -> Option<SlideRecord> {
        let slides = self.slides.lock();
        slides
            .iter()
            .position(|s| s.name == name)
            .map(|index| slides[index].record(index))
    }

    pub fn records(&self) -> Vec<SlideRecord> {
        self.slides
            .lock()
            .iter()
            .enumerate()
            .map(|(index, s)| s.record(index))
            .collect()
    }

    pub fn state(&self, index: usize) -> Option<SlideState> {
        self.slides.lock().get(index).map(|s| s.state)
    }

    /// Change the duration of the last slide. Allowed until it is on screen.
    pub fn set_last_slide_duration(&self, duration: SlideDuration) -> Result<()> {
        if !duration.is_positive() {
            let message = format!("Rejected non-positive last slide duration {:?}", duration);
            self.policy.report(Severity::Warning, &message)?;
            return Err(Error::SlideRejected(message));
        }
        let frame_period = self.frame_period();
        let mut slides = self.slides.lock();
        let Some(slide) = slides.last_mut() else {
            return Err(Error::InvalidState("no slides".into()));
        };
        if matches!(slide.state, SlideState::OnScreen | SlideState::Finished) {
            return Err(Error::InvalidState(format!(
                "slide '{}' is already {:?}",
                slide.name, slide.state
            )));
        }
        let (time_duration, frame_duration) = duration.resolve(frame_period);
        slide.duration = duration;
        slide.intended.time_duration = time_duration;
        slide.intended.frame_duration = frame_duration;
        Ok(())
    }

    /// Reset every slide to `NotStarted` with no actual timing.
    pub fn reset_presentation_info(&self) {
        for slide in self.slides.lock().iter_mut() {
            slide.reset_presentation_info();
        }
    }

    /// Lay out intended starts from `start_frame` at `start_time`, with frame
    /// durations rounded from each slide's time duration.
    pub fn set_intended_starts_using_time_durations(&self, start_time: Time, start_frame: u64) {
        let frame_period = self.frame_period();
        let mut slides = self.slides.lock();
        for slide in slides.iter_mut() {
            slide.intended.frame_duration = frames_for(slide.intended.time_duration, frame_period);
        }
        lay_out(&mut slides, 0, start_time, start_frame, frame_period);
    }

    /// Lay out intended starts from `start_frame` at `start_time`, with time
    /// durations derived from each slide's frame duration.
    pub fn set_intended_starts_using_frame_durations(&self, start_time: Time, start_frame: u64) {
        let frame_period = self.frame_period();
        let mut slides = self.slides.lock();
        for slide in slides.iter_mut() {
            slide.intended.time_duration = frame_period * slide.intended.frame_duration as i64;
        }
        lay_out(&mut slides, 0, start_time, start_frame, frame_period);
    }

    pub fn set_intended_starts(&self, mode: DurationMode, start_time: Time, start_frame: u64) {
        match mode {
            DurationMode::TimeDurations => self.set_intended_starts_using_time_durations(start_time, start_frame),
            DurationMode::FrameDurations => self.set_intended_starts_using_frame_durations(start_time, start_frame),
        }
    }

    /// Re-lay out slides from `first` on, keeping their frame durations.
    pub(crate) fn set_intended_starts_from(&self, first: usize, start_time: Time, start_frame: u64) {
        let frame_period = self.frame_period();
        lay_out(&mut self.slides.lock(), first, start_time, start_frame, frame_period);
    }

    /// First slide after `after` that was not dropped.
    pub(crate) fn next_active_index(&self, after: Option<usize>) -> Option<usize> {
        let first = after.map_or(0, |i| i + 1);
        let slides = self.slides.lock();
        (first..slides.len()).find(|&i| !slides[i].dropped)
    }

    /// First slide after `after` that has not been rendered or dropped.
    pub(crate) fn next_unrendered_index(&self, after: Option<usize>) -> Option<usize> {
        let first = after.map_or(0, |i| i + 1);
        let slides = self.slides.lock();
        (first..slides.len()).find(|&i| !slides[i].dropped && slides[i].state == SlideState::NotStarted)
    }

    /// Draw slide `index` into the back buffer and start its fence sync.
    ///
    /// Renders on the calling thread when it owns the rendering context,
    /// otherwise on the display thread through its command queue.
    pub fn render_slide(&self, index: usize) -> Result<()> {
        let content = {
            let slides = self.slides.lock();
            let slide = slides.get(index).ok_or(Error::NoSuchSlide(index))?;
            if slide.state == SlideState::Finished || slide.dropped {
                return Err(Error::InvalidState(format!(
                    "cannot render slide '{}' in state {:?}",
                    slide.name, slide.state
                )));
            }
            slide
                .content
                .clone()
                .ok_or_else(|| Error::InvalidState(format!("slide '{}' was deallocated", slide.name)))?
        };

        let started = self.display.now();
        let fence = match render_on_owner(&self.display, content) {
            Ok(fence) => fence,
            Err(e) => {
                error!("Failed to render slide {}: {}", index, e);
                return Err(e);
            }
        };

        let mut slides = self.slides.lock();
        let slide = slides.get_mut(index).ok_or(Error::NoSuchSlide(index))?;
        slide.fence.start_sync(fence, started);
        slide.presentation.render_start_time = Some(started);
        slide.presentation.render_complete_time = None;
        if matches!(slide.state, SlideState::NotStarted | SlideState::RenderComplete) {
            slide.state = SlideState::RenderStarted;
        }
        trace!("Rendered slide '{}' at {}", slide.name, started);
        Ok(())
    }

    /// Poll the fence of a rendering slide. Returns whether rendering completed.
    pub(crate) fn poll_render(&self, index: usize) -> bool {
        let mut slides = self.slides.lock();
        match slides.get_mut(index) {
            Some(slide) => poll_fence(slide),
            None => false,
        }
    }

    /// Mark slide `index` as handed to the display thread and return what to
    /// queue and its intended start frame.
    pub(crate) fn take_for_queue(&self, index: usize, now: Time) -> Result<(SlideContent, u64)> {
        let mut slides = self.slides.lock();
        let slide = slides.get_mut(index).ok_or(Error::NoSuchSlide(index))?;
        if slide.state != SlideState::NotStarted {
            return Err(Error::InvalidState(format!(
                "slide '{}' is already {:?}",
                slide.name, slide.state
            )));
        }
        let content = slide
            .content
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("slide '{}' was deallocated", slide.name)))?;
        slide.state = SlideState::RenderStarted;
        slide.presentation.render_start_time = Some(now);
        Ok((content, slide.intended.start_frame))
    }

    /// Record how the display thread rendered a queued slide.
    pub(crate) fn apply_queued_result(&self, index: usize, result: &QueuedFrameResult) {
        let mut slides = self.slides.lock();
        let Some(slide) = slides.get_mut(index) else {
            return;
        };
        if slide.state != SlideState::RenderStarted || !result.render_time_valid {
            return;
        }
        slide.presentation.render_complete_time = Some(result.render_complete_time);
        if result.render_complete_time <= result.start_time {
            slide.state = SlideState::RenderComplete;
        }
    }

    /// Slide `index` came on screen with `swap`.
    pub(crate) fn swapped_in(&self, index: usize, swap: SwapData) -> Result<Option<SwappedIn>> {
        let mut slides = self.slides.lock();
        let slide = slides.get_mut(index).ok_or(Error::NoSuchSlide(index))?;
        if slide.state == SlideState::RenderStarted {
            poll_fence(slide);
        }
        match slide.state {
            SlideState::RenderStarted => {
                slide.presentation.swapped_before_rendering_complete = true;
                warn!("Slide '{}' swapped in before rendering completed", slide.name);
            }
            SlideState::RenderComplete => {
                slide.presentation.swapped_before_rendering_complete = false;
            }
            state => {
                self.policy.report(
                    Severity::Error,
                    format!("Slide '{}' swapped in from inactive state {:?}", slide.name, state),
                )?;
                return Ok(None);
            }
        }
        slide.actual = SlideTimingInfo::open_ended(swap.time, swap.unit);
        slide.state = SlideState::OnScreen;
        if swap.unit != slide.intended.start_frame {
            debug!(
                "Slide '{}' intended for frame {} came on screen at {}",
                slide.name, slide.intended.start_frame, swap.unit
            );
        }
        Ok(Some(SwappedIn {
            record: slide.record(index),
            callback: slide.on_presented.clone(),
        }))
    }

    /// Slide `index` left the screen with `swap`.
    pub(crate) fn swapped_out(&self, index: usize, swap: SwapData) -> Result<()> {
        let mut slides = self.slides.lock();
        let slide = slides.get_mut(index).ok_or(Error::NoSuchSlide(index))?;
        if slide.state != SlideState::OnScreen {
            return self.policy.report(
                Severity::Error,
                format!("Slide '{}' swapped out from state {:?}", slide.name, slide.state),
            );
        }
        slide.actual.time_duration = swap.time - slide.actual.start_time;
        slide.actual.frame_duration = swap.unit.saturating_sub(slide.actual.start_frame);
        slide.state = SlideState::Finished;
        slide.fence.clear();
        Ok(())
    }

    /// Skip a slide whose intended window has passed without it being shown.
    pub(crate) fn drop_slide(&self, index: usize) {
        let mut slides = self.slides.lock();
        if let Some(slide) = slides.get_mut(index) {
            if slide.state == SlideState::NotStarted && !slide.dropped {
                slide.dropped = true;
                error!(
                    "Dropped slide '{}': its frames {}..{} have passed",
                    slide.name,
                    slide.intended.start_frame,
                    slide.intended.start_frame + slide.intended.frame_duration
                );
            }
        }
    }

    /// Release the content of a finished slide.
    pub(crate) fn deallocate(&self, index: usize) {
        let mut slides = self.slides.lock();
        if let Some(slide) = slides.get_mut(index) {
            if slide.state == SlideState::Finished && slide.content.take().is_some() {
                trace!("Deallocated slide '{}'", slide.name);
            }
        }
    }

    /// Count timing errors of the last presentation.
    pub fn check_for_presentation_errors(&self) -> PresentationErrors {
        let slides = self.slides.lock();
        let last = slides.len().saturating_sub(1);
        let mut errors = PresentationErrors::default();
        for (index, slide) in slides.iter().enumerate() {
            let mut failed = false;
            if slide.dropped {
                errors.dropped_slides += 1;
                failed = true;
            }
            if matches!(slide.state, SlideState::OnScreen | SlideState::Finished) {
                if index != last
                    && slide.state == SlideState::Finished
                    && slide.actual.frame_duration != slide.intended.frame_duration
                {
                    errors.incorrect_frame_counts += 1;
                    failed = true;
                }
                if slide.presentation.swapped_before_rendering_complete {
                    errors.late_copies_to_back_buffer += 1;
                    failed = true;
                }
                if slide.actual.start_time > slide.intended.start_time + self.late_start_tolerance {
                    errors.late_starts += 1;
                    failed = true;
                }
            }
            if failed && !errors.names_of_slides_with_errors.contains(&slide.name) {
                errors.names_of_slides_with_errors.push(slide.name.clone());
            }
        }
        errors
    }
}

impl std::fmt::Debug for SlideBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlideBuffer")
            .field("slides", &*self.slides.lock())
            .finish_non_exhaustive()
    }
}

fn lay_out(slides: &mut [Slide], first: usize, start_time: Time, start_frame: u64, frame_period: Time) {
    let mut frame = start_frame;
    for slide in slides.iter_mut().skip(first) {
        slide.intended.start_frame = frame;
        slide.intended.start_time = start_time + frame_period * (frame - start_frame) as i64;
        frame += slide.intended.frame_duration;
    }
}

fn poll_fence(slide: &mut Slide) -> bool {
    if slide.state != SlideState::RenderStarted {
        return slide.state == SlideState::RenderComplete;
    }
    if slide.fence.update_sync() {
        slide.state = SlideState::RenderComplete;
        slide.presentation.render_complete_time = slide.fence.complete_time();
        return true;
    }
    if slide.fence.sync_failed() {
        error!("Fence sync failed for slide '{}'", slide.name);
    }
    false
}

/// Render `content` with the rendering context, wherever it is.
fn render_on_owner(display: &Arc<Display>, content: SlideContent) -> Result<Box<dyn GpuFence>> {
    if display.rendering_on_this_thread() || !display.thread().is_running() {
        display.render_content(&content)?;
        return display.insert_fence();
    }
    let slot: Arc<Mutex<Option<Result<Box<dyn GpuFence>>>>> = Arc::new(Mutex::new(None));
    let target = slot.clone();
    let owner = display.clone();
    let queued = display.thread().queue_command(
        DisplayCommand::ExecuteFunction(Box::new(move || {
            let result = owner.render_content(&content).and_then(|_| owner.insert_fence());
            *target.lock() = Some(result);
        })),
        true,
    );
    let result = slot.lock().take();
    match result {
        Some(result) => result,
        None if !queued => Err(Error::DisplayThreadNotRunning),
        None => Err(Error::ContextAcquisition("render command produced no fence".into())),
    }
}
