//! Predicate-driven playback.
//!
//! The engine is polled from one thread. Each iteration first handles swaps
//! ([`PredicatePlayback::update_playback_swapping`]), then rendering
//! ([`PredicatePlayback::update_playback_rendering`]). Whether to swap and
//! whether to render are left to the configured predicates, so the same loop
//! serves swapping on the calling thread and swapping on the display thread.
//!
//! With the queued renderer, slides are handed to the display thread with
//! their start frame; the display thread renders them right before their swap
//! and reports back through a crossbeam channel drained on every iteration.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::core::time::Time;
use crate::display::{Display, QueuedFrameResult};
use crate::error::{Error, Result};
use crate::playback::helper::PlaybackHelper;
use crate::playback::predicates::{PredicateInput, RenderPredicate, SwapPredicate};
use crate::playback::slide::SlideRecord;
use crate::playback::slide_buffer::{DurationMode, SlideBuffer};
use crate::sync::data_client::{DataClient, DataClientConfig};
use crate::sync::swap_data::SwapData;

/// Where slides are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RendererStrategy {
    /// Into the back buffer, on whichever thread owns the rendering context.
    #[default]
    Direct,
    /// Queued on the display thread, rendered right before their swap.
    Queued,
}

/// Predicates and options of a [`PredicatePlayback`].
pub struct PlaybackConfig {
    pub should_swap: Option<Box<dyn SwapPredicate>>,
    pub has_swapped: Option<Box<dyn SwapPredicate>>,
    pub render_next: Box<dyn RenderPredicate>,
    pub re_render_current: Option<Box<dyn RenderPredicate>>,
    pub deallocate_completed_slides: bool,
    pub propagate_delays: bool,
    pub duration_mode: DurationMode,
    pub renderer: RendererStrategy,
}

impl PlaybackConfig {
    pub fn new(render_next: impl RenderPredicate + 'static) -> Self {
        Self {
            should_swap: None,
            has_swapped: None,
            render_next: Box::new(render_next),
            re_render_current: None,
            deallocate_completed_slides: false,
            propagate_delays: false,
            duration_mode: DurationMode::default(),
            renderer: RendererStrategy::default(),
        }
    }

    pub fn with_should_swap(mut self, predicate: impl SwapPredicate + 'static) -> Self {
        self.should_swap = Some(Box::new(predicate));
        self
    }

    pub fn with_has_swapped(mut self, predicate: impl SwapPredicate + 'static) -> Self {
        self.has_swapped = Some(Box::new(predicate));
        self
    }

    pub fn with_re_render_current(mut self, predicate: impl RenderPredicate + 'static) -> Self {
        self.re_render_current = Some(Box::new(predicate));
        self
    }

    pub fn with_deallocate_completed_slides(mut self, deallocate: bool) -> Self {
        self.deallocate_completed_slides = deallocate;
        self
    }

    pub fn with_propagate_delays(mut self, propagate: bool) -> Self {
        self.propagate_delays = propagate;
        self
    }

    pub fn with_duration_mode(mut self, mode: DurationMode) -> Self {
        self.duration_mode = mode;
        self
    }

    pub fn with_renderer(mut self, renderer: RendererStrategy) -> Self {
        self.renderer = renderer;
        self
    }
}

impl fmt::Debug for PlaybackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackConfig")
            .field("should_swap", &self.should_swap.is_some())
            .field("has_swapped", &self.has_swapped.is_some())
            .field("re_render_current", &self.re_render_current.is_some())
            .field("deallocate_completed_slides", &self.deallocate_completed_slides)
            .field("propagate_delays", &self.propagate_delays)
            .field("duration_mode", &self.duration_mode)
            .field("renderer", &self.renderer)
            .finish_non_exhaustive()
    }
}

/// Drives a [`PlaybackHelper`] from swap and render predicates.
pub struct PredicatePlayback {
    helper: PlaybackHelper,
    display: Arc<Display>,
    config: PlaybackConfig,
    client: DataClient,
    last_seen_unit: u64,
    swapped_this_iteration: bool,
    last_queued: Option<usize>,
    queued_tx: Sender<(usize, QueuedFrameResult)>,
    queued_rx: Receiver<(usize, QueuedFrameResult)>,
}

impl PredicatePlayback {
    /// Create an engine over `buffer`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` unless exactly one of the should-swap and
    /// has-swapped predicates is set, or if queued rendering is combined with
    /// swapping on the calling thread.
    pub fn new(buffer: Arc<SlideBuffer>, mut config: PlaybackConfig, client_config: DataClientConfig) -> Result<Self> {
        match (&config.should_swap, &config.has_swapped) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "both a should-swap and a has-swapped predicate are set".into(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "one of a should-swap or a has-swapped predicate is required".into(),
                ))
            }
            _ => {}
        }
        if config.renderer == RendererStrategy::Queued {
            if config.should_swap.is_some() {
                return Err(Error::Config(
                    "queued rendering needs the display thread to swap".into(),
                ));
            }
            if config.propagate_delays {
                warn!("Delays are not propagated to frames already queued on the display thread");
                config.propagate_delays = false;
            }
        }
        let display = buffer.display().clone();
        let client = DataClient::new(display.swap_data().clone(), display.frame_period(), client_config);
        let (queued_tx, queued_rx) = channel::unbounded();
        Ok(Self {
            helper: PlaybackHelper::new(buffer),
            display,
            config,
            client,
            last_seen_unit: 0,
            swapped_this_iteration: false,
            last_queued: None,
            queued_tx,
            queued_rx,
        })
    }

    pub fn helper(&self) -> &PlaybackHelper {
        &self.helper
    }

    pub fn buffer(&self) -> &Arc<SlideBuffer> {
        self.helper.buffer()
    }

    pub fn is_playing(&self) -> bool {
        self.helper.is_playing()
    }

    /// Lay out intended starts from `start_frame` at `start_time`, start the
    /// helper and render the first slide if it is already due.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` for an empty buffer, and rendering errors.
    pub fn start(&mut self, start_time: Time, start_frame: u64) -> Result<()> {
        let buffer = self.helper.buffer().clone();
        if buffer.is_empty() {
            return Err(Error::InvalidState("no slides to play".into()));
        }
        self.stop();
        while self.queued_rx.try_recv().is_ok() {}

        self.helper.start_playing();
        buffer.set_intended_starts(self.config.duration_mode, start_time, start_frame);
        self.last_seen_unit = self.display.last_frame_number();
        self.swapped_this_iteration = false;
        self.last_queued = None;
        info!(
            "Playing {} slides from frame {} at {}",
            buffer.len(),
            start_frame,
            start_time
        );
        self.render_if_due(false)
    }

    /// Stop playing and cancel frames queued on the display thread.
    pub fn stop(&mut self) {
        if self.config.renderer == RendererStrategy::Queued && self.helper.is_playing() {
            self.display.thread().clear_queued_frames();
        }
        self.helper.stop_playing();
    }

    /// Swap (or notice a swap) and do the bookkeeping that follows it.
    /// Returns whether a new swap was handled.
    pub fn update_playback_swapping(&mut self) -> Result<bool> {
        self.swapped_this_iteration = false;
        if !self.helper.is_playing() {
            return Ok(false);
        }
        if self.config.renderer == RendererStrategy::Queued {
            self.apply_queued_results()?;
        }

        let swapped = if let Some(predicate) = self.config.should_swap.as_mut() {
            if predicate.check(&self.display) {
                self.display.swap_buffers()?;
                true
            } else {
                false
            }
        } else if let Some(predicate) = self.config.has_swapped.as_mut() {
            predicate.check(&self.display)
        } else {
            false
        };
        if !swapped {
            return Ok(false);
        }
        let Some(swap) = self.display.last_swap_data() else {
            return Ok(false);
        };
        if swap.unit <= self.last_seen_unit {
            return Ok(false);
        }
        self.last_seen_unit = swap.unit;
        self.swapped_this_iteration = true;

        match self.config.renderer {
            RendererStrategy::Direct => {
                let previous = self.helper.current_slide_index();
                if self.helper.buffer_swap(swap)? {
                    self.after_advance(previous);
                }
                if !self.config.propagate_delays && self.helper.is_playing() {
                    self.helper.drop_missed_slides(self.display.swap_data().next_swap_unit());
                }
            }
            RendererStrategy::Queued => {
                self.helper.finish_if_elapsed(swap)?;
            }
        }
        if self.helper.is_playing() {
            self.render_if_due(true)?;
        }
        Ok(true)
    }

    /// Poll fences and render ahead of the next swap when the predicates say so.
    pub fn update_playback_rendering(&mut self) -> Result<()> {
        if !self.helper.is_playing() {
            return Ok(());
        }
        if self.config.renderer == RendererStrategy::Direct {
            self.helper.update_playback();
        }
        if !self.swapped_this_iteration {
            self.render_if_due(false)?;
        }
        if self.config.renderer == RendererStrategy::Direct && self.config.re_render_current.is_some() {
            let has_swapped = self.swapped_this_iteration;
            let render = {
                let input = self.predicate_input(has_swapped, self.helper.next_slide_index());
                let view = input.view();
                self.config
                    .re_render_current
                    .as_mut()
                    .is_some_and(|predicate| predicate.check(&view))
            };
            if render {
                self.helper.re_render_current_slide()?;
            }
        }
        Ok(())
    }

    /// One full iteration. Returns whether playback is still running.
    pub fn update(&mut self) -> Result<bool> {
        self.update_playback_swapping()?;
        self.update_playback_rendering()?;
        Ok(self.helper.is_playing())
    }

    fn after_advance(&mut self, previous: Option<usize>) {
        if self.config.propagate_delays {
            self.helper.set_intended_starts_from_current_slide();
        }
        if self.config.deallocate_completed_slides {
            if let Some(previous) = previous {
                self.helper.buffer().deallocate(previous);
            }
        }
    }

    fn apply_queued_results(&mut self) -> Result<()> {
        while let Ok((index, result)) = self.queued_rx.try_recv() {
            if !self.helper.is_playing() {
                continue;
            }
            self.helper.buffer().apply_queued_result(index, &result);
            let previous = self.helper.current_slide_index();
            let swap = SwapData::new(result.actual_start_frame, result.start_time);
            self.helper.advance_to(index, swap)?;
            self.after_advance(previous);
        }
        Ok(())
    }

    fn render_if_due(&mut self, has_swapped: bool) -> Result<()> {
        match self.config.renderer {
            RendererStrategy::Direct => {
                let next = self.helper.next_slide_index();
                if self.check_render_next(has_swapped, next) {
                    self.helper.render_next_slide()?;
                }
            }
            RendererStrategy::Queued => {
                let buffer = self.helper.buffer().clone();
                while let Some(next) = buffer.next_unrendered_index(self.last_queued) {
                    if !self.check_render_next(has_swapped, Some(next)) {
                        break;
                    }
                    let (content, start_frame) = buffer.take_for_queue(next, self.display.now())?;
                    let results = self.queued_tx.clone();
                    self.display.thread().queue_frame(content, start_frame, move |result| {
                        if results.send((next, result)).is_err() {
                            debug!("Discarded queued frame result for slide {} after playback ended", next);
                        }
                    });
                    debug!("Queued slide {} for frame {}", next, start_frame);
                    self.last_queued = Some(next);
                }
            }
        }
        Ok(())
    }

    fn check_render_next(&mut self, has_swapped: bool, next: Option<usize>) -> bool {
        let input = self.predicate_input(has_swapped, next);
        let view = input.view();
        self.config.render_next.check(&view)
    }

    fn predicate_input(&self, has_swapped: bool, next: Option<usize>) -> OwnedInput {
        let buffer = self.helper.buffer();
        let predicted_next_swap_time = if self.client.model_usable() {
            self.client.predict_next_swap_time()
        } else {
            None
        };
        OwnedInput {
            has_swapped,
            current_slide: self.helper.current_slide_index().and_then(|i| buffer.record(i)),
            next_slide: next.and_then(|i| buffer.record(i)),
            last_swap: self.display.last_swap_data(),
            next_swap_unit: self.display.swap_data().next_swap_unit(),
            predicted_next_swap_time,
            frame_period: self.display.frame_period(),
        }
    }
}

impl fmt::Debug for PredicatePlayback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicatePlayback")
            .field("helper", &self.helper)
            .field("config", &self.config)
            .field("last_seen_unit", &self.last_seen_unit)
            .finish_non_exhaustive()
    }
}

/// Snapshot backing a [`PredicateInput`].
struct OwnedInput {
    has_swapped: bool,
    current_slide: Option<SlideRecord>,
    next_slide: Option<SlideRecord>,
    last_swap: Option<SwapData>,
    next_swap_unit: u64,
    predicted_next_swap_time: Option<Time>,
    frame_period: Time,
}

impl OwnedInput {
    fn view(&self) -> PredicateInput<'_> {
        PredicateInput {
            has_swapped: self.has_swapped,
            current_slide: self.current_slide.as_ref(),
            next_slide: self.next_slide.as_ref(),
            last_swap: self.last_swap,
            next_swap_unit: self.next_swap_unit,
            predicted_next_swap_time: self.predicted_next_swap_time,
            frame_period: self.frame_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{ManualClock, SystemClock};
    use crate::playback::predicates::{FrameCounted, ThreadHasSwapped};
    use crate::playback::slide::{Slide, SlideDuration, SlideState};
    use crate::render::backend::SlideContent;
    use crate::render::headless::{HeadlessBackend, HeadlessConfig};
    use std::time::{Duration, Instant};

    const PERIOD: Time = Time::from_nanos(16_666_667);

    fn manual_buffer(frames: &[u64]) -> Arc<SlideBuffer> {
        let clock = Arc::new(ManualClock::new(Time::ZERO, Time::ZERO));
        let backend = Arc::new(HeadlessBackend::new(clock.clone(), HeadlessConfig::default()));
        let display = Arc::new(Display::new(backend, clock).unwrap());
        let buffer = Arc::new(SlideBuffer::new(display));
        for (i, &n) in frames.iter().enumerate() {
            buffer
                .add(Slide::new(format!("S{}", i), SlideContent::draw(|_| {}), SlideDuration::Frames(n)))
                .unwrap();
        }
        buffer
    }

    fn always_swap(_: &Display) -> bool {
        true
    }

    fn run(engine: &mut PredicatePlayback) {
        for _ in 0..200 {
            if !engine.update().unwrap() {
                return;
            }
        }
        panic!("playback did not finish");
    }

    #[test]
    fn test_requires_exactly_one_swap_predicate() {
        let buffer = manual_buffer(&[1]);
        let neither = PlaybackConfig::new(FrameCounted::new());
        assert!(matches!(
            PredicatePlayback::new(buffer.clone(), neither, DataClientConfig::default()),
            Err(Error::Config(_))
        ));
        let both = PlaybackConfig::new(FrameCounted::new())
            .with_should_swap(always_swap)
            .with_has_swapped(always_swap);
        assert!(PredicatePlayback::new(buffer.clone(), both, DataClientConfig::default()).is_err());
        let queued_on_main = PlaybackConfig::new(FrameCounted::new())
            .with_should_swap(always_swap)
            .with_renderer(RendererStrategy::Queued);
        assert!(PredicatePlayback::new(buffer, queued_on_main, DataClientConfig::default()).is_err());
    }

    #[test]
    fn test_start_with_empty_buffer_fails() {
        let buffer = manual_buffer(&[]);
        let config = PlaybackConfig::new(FrameCounted::new()).with_should_swap(always_swap);
        let mut engine = PredicatePlayback::new(buffer, config, DataClientConfig::default()).unwrap();
        assert!(matches!(engine.start(Time::ZERO, 1), Err(Error::InvalidState(_))));
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_clean_run_on_main_thread() {
        let buffer = manual_buffer(&[3, 6]);
        let config = PlaybackConfig::new(FrameCounted::new())
            .with_should_swap(always_swap)
            .with_duration_mode(DurationMode::FrameDurations);
        let mut engine = PredicatePlayback::new(buffer.clone(), config, DataClientConfig::default()).unwrap();
        engine.start(PERIOD * 2, 2).unwrap();
        run(&mut engine);

        let records = buffer.records();
        assert_eq!(records[0].actual.start_frame, 2);
        assert_eq!(records[0].actual.frame_duration, 3);
        assert_eq!(records[1].actual.start_frame, 5);
        assert_eq!(records[1].actual.frame_duration, 6);
        assert!(records.iter().all(|r| r.state == SlideState::Finished));
        assert!(records.iter().all(|r| !r.presentation.swapped_before_rendering_complete));
        assert_eq!(buffer.check_for_presentation_errors().total_errors(), 0);
    }

    #[test]
    fn test_late_render_propagates_delay() {
        let buffer = manual_buffer(&[3, 6]);
        let late_first = |input: &PredicateInput<'_>| match input.pending_next_slide() {
            Some(slide) if slide.index == 0 => slide.intended.start_frame + 2 <= input.next_swap_unit,
            Some(slide) => slide.intended.start_frame <= input.next_swap_unit,
            None => false,
        };
        let config = PlaybackConfig::new(late_first)
            .with_should_swap(always_swap)
            .with_propagate_delays(true);
        let mut engine = PredicatePlayback::new(buffer.clone(), config, DataClientConfig::default()).unwrap();
        engine.start(PERIOD * 2, 2).unwrap();
        run(&mut engine);

        let records = buffer.records();
        assert_eq!(records[0].actual.start_frame, 4);
        assert_eq!(records[1].intended.start_frame, 7);
        assert_eq!(records[1].actual.start_frame, 7);
        assert_eq!(records[1].actual.frame_duration, 6);
        let errors = buffer.check_for_presentation_errors();
        assert_eq!(errors.late_starts, 1);
        assert_eq!(errors.names_of_slides_with_errors, vec!["S0".to_string()]);
    }

    #[test]
    fn test_missed_slide_dropped_without_propagation() {
        let buffer = manual_buffer(&[1, 1, 2]);
        let skip_middle = |input: &PredicateInput<'_>| match input.pending_next_slide() {
            Some(slide) if slide.index == 1 => false,
            Some(slide) => slide.intended.start_frame <= input.next_swap_unit,
            None => false,
        };
        let config = PlaybackConfig::new(skip_middle).with_should_swap(always_swap);
        let mut engine = PredicatePlayback::new(buffer.clone(), config, DataClientConfig::default()).unwrap();
        engine.start(PERIOD * 2, 2).unwrap();
        run(&mut engine);

        let records = buffer.records();
        assert!(records[1].dropped);
        assert_eq!(records[2].state, SlideState::Finished);
        assert_eq!(buffer.check_for_presentation_errors().dropped_slides, 1);
    }

    #[test]
    fn test_completed_slides_deallocated() {
        let buffer = manual_buffer(&[1, 1]);
        let config = PlaybackConfig::new(FrameCounted::new())
            .with_should_swap(always_swap)
            .with_deallocate_completed_slides(true);
        let mut engine = PredicatePlayback::new(buffer.clone(), config, DataClientConfig::default()).unwrap();
        engine.start(PERIOD, 1).unwrap();
        run(&mut engine);
        assert!(matches!(buffer.render_slide(0), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_queued_frames_on_display_thread() {
        let clock = Arc::new(SystemClock::new());
        let backend = Arc::new(HeadlessBackend::new(
            clock.clone(),
            HeadlessConfig {
                refresh_period: Time::from_millis(5),
                ..HeadlessConfig::default()
            },
        ));
        let display = Arc::new(Display::new(backend, clock).unwrap());
        let buffer = Arc::new(SlideBuffer::new(display.clone()));
        for name in ["a", "b"] {
            buffer
                .add(Slide::new(name, SlideContent::draw(|_| {}), SlideDuration::Frames(2)))
                .unwrap();
        }
        display.set_autoswap(true).unwrap();
        assert!(display.wait_for_swap(Duration::from_secs(2)));

        let config = PlaybackConfig::new(FrameCounted::with_lookahead(2))
            .with_has_swapped(ThreadHasSwapped::new(&display))
            .with_renderer(RendererStrategy::Queued);
        let mut engine = PredicatePlayback::new(buffer.clone(), config, DataClientConfig::default()).unwrap();
        let start = display.last_frame_number() + 5;
        engine.start(display.now(), start).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.update().unwrap() {
            assert!(Instant::now() < deadline, "queued playback did not finish");
            std::thread::sleep(Duration::from_micros(200));
        }
        engine.stop();
        display.set_autoswap(false).unwrap();

        let records = buffer.records();
        assert!(records.iter().all(|r| r.state == SlideState::Finished));
        assert!(records[0].actual.start_frame >= start);
        assert!(records[1].actual.start_frame > records[0].actual.start_frame);
    }
}
