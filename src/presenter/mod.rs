//! Audiovisual presenter: starts slides and sound together.
//!
//! The presenter owns a slide buffer bound to a display and, optionally, a
//! sound player listening to an audio stream. Starting a presentation waits
//! until both swap sources are modelled well enough, picks a display frame
//! far enough ahead to cover the audio latency, and derives from the joint
//! sync point the sample frame at which the sound must be emitted.
//!
//! Six modes cross where slides are rendered (main or display thread), where
//! buffers are swapped (main or display thread), and whether the
//! predicate-driven engine orchestrates playback. The three hand-written
//! modes are kept for comparison with the engine.

pub mod config;

pub use config::{AudioLeadConfig, PlaybackOptions, PresenterConfig, PresenterMode, SwapConfig, SyncConfig};

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver};
use tracing::{debug, error, info, warn};

use crate::audio::{AudioStream, OutputListener, SoundBuffer, SoundPlayer};
use crate::core::time::Time;
use crate::display::{Display, QueuedFrameResult, SwapTiming};
use crate::error::{Error, Result};
use crate::playback::engine::{PlaybackConfig, PredicatePlayback, RendererStrategy};
use crate::playback::helper::PlaybackHelper;
use crate::playback::predicates::{FrameCounted, MainThreadShouldSwap, ThreadHasSwapped};
use crate::playback::slide::SlideState;
use crate::playback::slide_buffer::{DurationMode, PresentationErrors, SlideBuffer};
use crate::sync::data_client::DataClient;
use crate::sync::domain::{DomainSynchronizer, SyncPoint};
use crate::sync::swap_data::{PolledSwapListener, SwapData};

/// Synchronizer client name of the display.
pub const DISPLAY_CLIENT: &str = "disp";
/// Synchronizer client name of the audio stream.
pub const SOUND_CLIENT: &str = "ss";

/// Display frames between the last swap and the presentation start.
///
/// One frame to reach the next swap, enough frames to cover `audio_latency`,
/// plus `extra` frames of margin.
pub fn lead_frames(audio_latency: Time, frame_period: Time, extra: u64) -> u64 {
    if frame_period <= Time::ZERO {
        return 1 + extra;
    }
    let latency_frames = (audio_latency / frame_period).ceil().max(0.0) as u64;
    1 + latency_frames + extra
}

/// Presents a slide buffer with an aligned sound.
pub struct AvPresenter {
    config: PresenterConfig,
    display: Arc<Display>,
    audio: Option<Arc<AudioStream>>,
    player: Option<Arc<SoundPlayer>>,
    listener: Option<Arc<dyn OutputListener>>,
    buffer: Arc<SlideBuffer>,
    synchronizer: DomainSynchronizer,
    run: Option<Run>,
    sync_point: Option<SyncPoint>,
    scheduled_sample_frame: Option<u64>,
}

impl AvPresenter {
    /// Create a presenter for `display` and, if given, `audio`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid configuration.
    pub fn new(display: Arc<Display>, audio: Option<Arc<AudioStream>>, config: PresenterConfig) -> Result<Self> {
        config.validate()?;
        let buffer = Arc::new(
            SlideBuffer::new(display.clone()).with_late_start_tolerance(config.playback.late_start_tolerance),
        );

        let mut synchronizer = DomainSynchronizer::new();
        synchronizer.add_client(
            DISPLAY_CLIENT,
            Arc::new(DataClient::new(
                display.swap_data().clone(),
                display.frame_period(),
                config.sync.display_client(),
            )),
        );

        let (player, listener) = match &audio {
            Some(stream) => {
                synchronizer.add_client(
                    SOUND_CLIENT,
                    Arc::new(DataClient::new(
                        stream.swap_data().clone(),
                        stream.latency_per_buffer(),
                        config.sync.sound_client(),
                    )),
                );
                let player = Arc::new(SoundPlayer::new(*stream.config()));
                let listener: Arc<dyn OutputListener> = player.clone();
                stream.add_output_listener(listener.clone());
                (Some(player), Some(listener))
            }
            None => (None, None),
        };

        debug!("Presenter created in mode {}", config.mode);
        Ok(Self {
            config,
            display,
            audio,
            player,
            listener,
            buffer,
            synchronizer,
            run: None,
            sync_point: None,
            scheduled_sample_frame: None,
        })
    }

    pub fn config(&self) -> &PresenterConfig {
        &self.config
    }

    pub fn display(&self) -> &Arc<Display> {
        &self.display
    }

    pub fn slide_buffer(&self) -> &Arc<SlideBuffer> {
        &self.buffer
    }

    pub fn synchronizer(&self) -> &DomainSynchronizer {
        &self.synchronizer
    }

    pub fn sound_player(&self) -> Option<&Arc<SoundPlayer>> {
        self.player.as_ref()
    }

    /// Sync point of the current or last presentation.
    pub fn sync_point(&self) -> Option<&SyncPoint> {
        self.sync_point.as_ref()
    }

    /// Stream sample frame the sound was queued at.
    pub fn scheduled_sample_frame(&self) -> Option<u64> {
        self.scheduled_sample_frame
    }

    /// Set the sound played with the slides.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the presenter has no audio stream.
    pub fn set_sound_buffer(&self, sound: &SoundBuffer) -> Result<()> {
        let Some(player) = &self.player else {
            return Err(Error::Config("presenter has no audio stream".into()));
        };
        player.set_sound_buffer(sound)?;
        Ok(())
    }

    /// Audio buffering between the callback and the speaker, with the offset.
    pub fn audio_total_latency(&self) -> Time {
        match &self.audio {
            Some(stream) => stream.config().total_latency() + self.config.audio_lead.audio_latency_offset,
            None => Time::ZERO,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.run.as_ref().is_some_and(Run::is_playing)
    }

    /// Start the presentation.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidState` - the slide buffer is empty
    /// * `Error::AlreadyPlaying` - a presentation is running
    /// * `Error::NotReady` - display or sound were not ready in time
    /// * `Error::InvalidSyncPoint` - a model became unusable before the start
    ///
    /// Rendering context and audio errors are passed through. Every failure is
    /// logged.
    pub fn start_playing(&mut self) -> Result<()> {
        if self.is_playing() {
            warn!("Presentation is already playing");
            return Err(Error::AlreadyPlaying);
        }
        if self.buffer.is_empty() {
            error!("No slides to present");
            return Err(Error::InvalidState("slide buffer is empty".into()));
        }
        self.run = None;
        let mode = self.config.mode;

        self.prepare_threads(mode)?;
        if !self.wait_until_ready(mode) {
            error!("{}", Error::NotReady);
            return Err(Error::NotReady);
        }

        let frame_period = self.display.frame_period();
        let latency = self.audio_total_latency();
        let lead = lead_frames(latency, frame_period, self.config.audio_lead.display_extra_lead_frames);
        let start_frame = self.display.last_frame_number() + lead;
        let sync_point = self.synchronizer.sync_point(DISPLAY_CLIENT, start_frame);
        if !sync_point.valid {
            error!("Sync point for frame {} is not valid", start_frame);
            return Err(Error::InvalidSyncPoint);
        }
        let start_time = sync_point.time;
        self.arm_player(&sync_point, latency)?;

        let run = match self.start_run(mode, start_time, start_frame) {
            Ok(run) => run,
            Err(e) => {
                error!("Failed to start {} presentation: {}", mode, e);
                if let Some(player) = &self.player {
                    player.stop();
                }
                return Err(e);
            }
        };
        info!(
            "Presenting {} slides in mode {} from frame {} at {} (lead {} frames)",
            self.buffer.len(),
            mode,
            start_frame,
            start_time,
            lead
        );
        self.run = Some(run);
        self.sync_point = Some(sync_point);
        Ok(())
    }

    /// Advance the presentation. Returns whether it is still playing.
    pub fn update_playback(&mut self) -> Result<bool> {
        let Some(run) = self.run.as_mut() else {
            return Ok(false);
        };
        let playing = run.update()?;
        if !playing {
            debug!("Presentation finished");
        }
        Ok(playing)
    }

    /// Stop the presentation, cancel queued frames and stop the sound.
    /// Stopping a stopped presentation does nothing.
    pub fn stop_playing(&mut self) {
        if let Some(mut run) = self.run.take() {
            run.stop();
            info!("Presentation stopped");
        }
        if let Some(player) = &self.player {
            player.stop();
        }
    }

    pub fn check_for_presentation_errors(&self) -> PresentationErrors {
        self.buffer.check_for_presentation_errors()
    }

    fn prepare_threads(&self, mode: PresenterMode) -> Result<()> {
        if mode.swaps_on_thread() {
            self.display
                .thread()
                .set_pre_swap_safety_buffer(self.config.swap.pre_swap_safety_buffer);
            if let Err(e) = self.display.set_autoswap(true) {
                error!("Failed to hand the rendering context to the display thread: {}", e);
                return Err(e);
            }
            return Ok(());
        }
        if let Err(e) = self.display.set_autoswap(false) {
            error!("Failed to take the rendering context back from the display thread: {}", e);
            return Err(e);
        }
        if !self.display.rendering_on_this_thread() {
            if let Err(e) = self.display.acquire_context() {
                error!("Failed to acquire the rendering context: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait for every client to be ready. In swap-on-main modes nobody else
    /// swaps, so the wait keeps swapping the display.
    fn wait_until_ready(&self, mode: PresenterMode) -> bool {
        let timeout = self.config.sync.ready_timeout();
        if mode.swaps_on_thread() {
            return self.synchronizer.wait_until_all_ready(timeout);
        }
        let display = self.display.clone();
        self.synchronizer.wait_until_all_ready_with(timeout, || {
            if let Err(e) = display.swap_buffers() {
                warn!("Swap while waiting for sync failed: {}", e);
            }
        })
    }

    /// Queue the sound so its first sample is heard at the sync point.
    fn arm_player(&mut self, sync_point: &SyncPoint, latency: Time) -> Result<()> {
        self.scheduled_sample_frame = None;
        let (Some(stream), Some(player)) = (&self.audio, &self.player) else {
            return Ok(());
        };
        if !player.has_sound_buffer() {
            debug!("No sound buffer set, presenting without sound");
            return Ok(());
        }
        let Some(sound) = sync_point.client(SOUND_CLIENT) else {
            error!("Sync point has no sound stream prediction");
            return Err(Error::InvalidSyncPoint);
        };
        let latency_frames = (latency.as_secs_f64() * stream.config().sample_rate as f64).round() as u64;
        let sample_frame = sound.predicted_unit.saturating_sub(latency_frames);
        if let Err(e) = player.queue_playback(sample_frame, true) {
            error!("Failed to arm the sound player: {}", e);
            return Err(e.into());
        }
        debug!(
            "Sound queued at sample frame {} ({} at the sync point, {} latency frames)",
            sample_frame, sound.predicted_unit, latency_frames
        );
        self.scheduled_sample_frame = Some(sample_frame);
        Ok(())
    }

    fn start_run(&self, mode: PresenterMode, start_time: Time, start_frame: u64) -> Result<Run> {
        if mode.is_helped() {
            let mut engine = PredicatePlayback::new(
                self.buffer.clone(),
                self.engine_config(mode),
                self.config.sync.display_client(),
            )?;
            engine.start(start_time, start_frame)?;
            return Ok(Run::Helped(engine));
        }
        let mut run = ManualRun::new(self.buffer.clone(), mode, &self.config);
        run.start(self.config.duration_mode, start_time, start_frame)?;
        Ok(Run::Manual(run))
    }

    fn engine_config(&self, mode: PresenterMode) -> PlaybackConfig {
        let config = match mode {
            PresenterMode::RenderThreadSwapThreadHelped => PlaybackConfig::new(FrameCounted::with_lookahead(2))
                .with_has_swapped(ThreadHasSwapped::new(&self.display))
                .with_renderer(RendererStrategy::Queued),
            _ if mode.swaps_on_thread() => {
                PlaybackConfig::new(FrameCounted::new()).with_has_swapped(ThreadHasSwapped::new(&self.display))
            }
            _ => PlaybackConfig::new(FrameCounted::new()).with_should_swap(MainThreadShouldSwap::new(
                &self.display,
                self.config.sync.display_client(),
                self.config.swap.pre_swap_safety_buffer,
            )),
        };
        config
            .with_deallocate_completed_slides(self.config.playback.deallocate_completed_slides)
            .with_propagate_delays(self.config.playback.propagate_delays)
            .with_duration_mode(self.config.duration_mode)
    }
}

impl Drop for AvPresenter {
    fn drop(&mut self) {
        self.stop_playing();
        if let (Some(stream), Some(listener)) = (&self.audio, &self.listener) {
            stream.remove_output_listener(listener);
        }
    }
}

impl fmt::Debug for AvPresenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvPresenter")
            .field("config", &self.config)
            .field("slides", &self.buffer.len())
            .field("has_audio", &self.audio.is_some())
            .field("playing", &self.is_playing())
            .finish_non_exhaustive()
    }
}

enum Run {
    Helped(PredicatePlayback),
    Manual(ManualRun),
}

impl Run {
    fn is_playing(&self) -> bool {
        match self {
            Run::Helped(engine) => engine.is_playing(),
            Run::Manual(run) => run.helper.is_playing(),
        }
    }

    fn update(&mut self) -> Result<bool> {
        match self {
            Run::Helped(engine) => engine.update(),
            Run::Manual(run) => run.update(),
        }
    }

    fn stop(&mut self) {
        match self {
            Run::Helped(engine) => engine.stop(),
            Run::Manual(run) => run.stop(),
        }
    }
}

/// Playback written out per mode, without predicates.
struct ManualRun {
    mode: PresenterMode,
    display: Arc<Display>,
    helper: PlaybackHelper,
    swap_timing: SwapTiming,
    swap_listener: PolledSwapListener,
    last_seen_unit: u64,
    results: Option<Receiver<(usize, QueuedFrameResult)>>,
    propagate_delays: bool,
    deallocate_completed_slides: bool,
}

impl ManualRun {
    fn new(buffer: Arc<SlideBuffer>, mode: PresenterMode, config: &PresenterConfig) -> Self {
        let display = buffer.display().clone();
        let mut propagate_delays = config.playback.propagate_delays;
        if mode.renders_on_thread() && propagate_delays {
            warn!("Delays are not propagated to frames already queued on the display thread");
            propagate_delays = false;
        }
        Self {
            mode,
            swap_timing: SwapTiming::new(
                display.swap_data().clone(),
                display.frame_period(),
                config.sync.display_client(),
                config.swap.pre_swap_safety_buffer,
            ),
            swap_listener: PolledSwapListener::new(display.swap_data().clone()),
            display,
            helper: PlaybackHelper::new(buffer),
            last_seen_unit: 0,
            results: None,
            propagate_delays,
            deallocate_completed_slides: config.playback.deallocate_completed_slides,
        }
    }

    fn start(&mut self, mode: DurationMode, start_time: Time, start_frame: u64) -> Result<()> {
        let buffer = self.helper.buffer().clone();
        self.helper.start_playing();
        buffer.set_intended_starts(mode, start_time, start_frame);
        self.last_seen_unit = self.display.last_frame_number();
        self.swap_listener.reset();

        if self.mode.renders_on_thread() {
            let (tx, rx) = channel::unbounded();
            for index in 0..buffer.len() {
                let (content, frame) = buffer.take_for_queue(index, self.display.now())?;
                let results = tx.clone();
                self.display.thread().queue_frame(content, frame, move |result| {
                    if results.send((index, result)).is_err() {
                        debug!("Discarded queued frame result for slide {} after the run ended", index);
                    }
                });
            }
            self.results = Some(rx);
            return Ok(());
        }
        self.render_next_if_due()
    }

    fn update(&mut self) -> Result<bool> {
        if !self.helper.is_playing() {
            return Ok(false);
        }
        match self.mode {
            PresenterMode::RenderMainSwapMain => {
                self.helper.update_playback();
                if self.swap_timing.should_swap(self.display.now()) {
                    let swap = self.display.swap_buffers()?;
                    self.after_swap(swap)?;
                }
                self.render_next_if_due()?;
            }
            PresenterMode::RenderThreadSwapThread => {
                self.apply_queued_results()?;
                if self.swap_listener.has_swapped(true) {
                    if let Some(swap) = self.new_swap() {
                        self.helper.finish_if_elapsed(swap)?;
                    }
                }
            }
            _ => {
                self.helper.update_playback();
                if self.swap_listener.has_swapped(true) {
                    if let Some(swap) = self.new_swap() {
                        self.after_swap(swap)?;
                    }
                }
                self.render_next_if_due()?;
            }
        }
        Ok(self.helper.is_playing())
    }

    fn stop(&mut self) {
        if self.mode.renders_on_thread() && self.helper.is_playing() {
            self.display.thread().clear_queued_frames();
        }
        self.helper.stop_playing();
        self.results = None;
    }

    fn new_swap(&mut self) -> Option<SwapData> {
        let swap = self.display.last_swap_data()?;
        if swap.unit <= self.last_seen_unit {
            return None;
        }
        self.last_seen_unit = swap.unit;
        Some(swap)
    }

    fn after_swap(&mut self, swap: SwapData) -> Result<()> {
        self.last_seen_unit = self.last_seen_unit.max(swap.unit);
        let previous = self.helper.current_slide_index();
        if self.helper.buffer_swap(swap)? {
            if self.propagate_delays {
                self.helper.set_intended_starts_from_current_slide();
            }
            self.deallocate(previous);
        }
        if self.helper.is_playing() && !self.propagate_delays {
            self.helper.drop_missed_slides(self.display.swap_data().next_swap_unit());
        }
        Ok(())
    }

    fn apply_queued_results(&mut self) -> Result<()> {
        let Some(results) = self.results.clone() else {
            return Ok(());
        };
        while let Ok((index, result)) = results.try_recv() {
            self.helper.buffer().apply_queued_result(index, &result);
            let previous = self.helper.current_slide_index();
            self.helper
                .advance_to(index, SwapData::new(result.actual_start_frame, result.start_time))?;
            self.deallocate(previous);
        }
        Ok(())
    }

    fn deallocate(&self, previous: Option<usize>) {
        if let (true, Some(previous)) = (self.deallocate_completed_slides, previous) {
            self.helper.buffer().deallocate(previous);
        }
    }

    /// Render the next slide once the next swap reaches its start frame.
    fn render_next_if_due(&mut self) -> Result<()> {
        if !self.helper.is_playing() {
            return Ok(());
        }
        let Some(next) = self.helper.next_slide_index() else {
            return Ok(());
        };
        let Some(record) = self.helper.buffer().record(next) else {
            return Ok(());
        };
        if record.state != SlideState::NotStarted {
            return Ok(());
        }
        let next_unit = self.display.swap_data().next_swap_unit();
        if record.intended.start_frame > next_unit {
            return Ok(());
        }
        if record.intended.start_frame < next_unit {
            error!(
                "Slide '{}' intended for frame {} rendered when the next swap reaches {}",
                record.name, record.intended.start_frame, next_unit
            );
        }
        self.helper.render_next_slide()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioStreamConfig, SimulatedAudioDriver};
    use crate::core::clock::{Clock, ManualClock, SystemClock};
    use crate::playback::slide::{Slide, SlideDuration};
    use crate::render::backend::SlideContent;
    use crate::render::headless::{HeadlessBackend, HeadlessConfig};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    const PERIOD: Time = Time::from_nanos(16_666_667);
    const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
    const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

    fn manual_display(headless: HeadlessConfig) -> (Arc<ManualClock>, Arc<Display>) {
        let clock = Arc::new(ManualClock::new(Time::ZERO, Time::from_micros(100)));
        let backend = Arc::new(HeadlessBackend::new(clock.clone(), headless));
        let display = Arc::new(Display::new(backend, clock.clone()).unwrap());
        (clock, display)
    }

    fn scenario_config(mode: PresenterMode) -> PresenterConfig {
        PresenterConfig {
            mode,
            sync: SyncConfig {
                required_swap_duration: Time::from_millis(80),
                ready_timeout: Time::from_secs(2),
                ..SyncConfig::default()
            },
            swap: SwapConfig {
                pre_swap_safety_buffer: Time::from_millis(2),
            },
            ..PresenterConfig::default()
        }
    }

    fn add_red_green(presenter: &AvPresenter, red: SlideContent) {
        let buffer = presenter.slide_buffer();
        buffer
            .add(Slide::new("S0", red, SlideDuration::Time(Time::from_millis(50))))
            .unwrap();
        buffer
            .add(Slide::new(
                "S1",
                SlideContent::draw(|target| target.clear(GREEN)),
                SlideDuration::Time(Time::from_millis(100)),
            ))
            .unwrap();
    }

    fn play_to_end(presenter: &mut AvPresenter) {
        for _ in 0..100_000 {
            if !presenter.update_playback().unwrap() {
                return;
            }
        }
        panic!("presentation did not finish");
    }

    fn chosen_start_frame(presenter: &AvPresenter) -> u64 {
        presenter.sync_point().unwrap().client(DISPLAY_CLIENT).unwrap().predicted_unit
    }

    fn assert_clean_two_slide_run(presenter: &AvPresenter) {
        let records = presenter.slide_buffer().records();
        let start = chosen_start_frame(presenter);
        assert_eq!(records[0].intended.frame_duration, 3);
        assert_eq!(records[1].intended.frame_duration, 6);
        assert_eq!(records[0].actual.start_frame, start);
        assert_eq!(records[1].actual.start_frame, start + 3);
        assert_eq!(records[1].actual.start_frame + records[1].actual.frame_duration - start, 9);
        assert!(records.iter().all(|r| !r.presentation.swapped_before_rendering_complete));
        assert!(records.iter().all(|r| r.state == SlideState::Finished));
        assert_eq!(presenter.check_for_presentation_errors().total_errors(), 0);
    }

    #[test]
    fn test_clean_two_slide_run_helped() {
        let (_clock, display) = manual_display(HeadlessConfig::default());
        let mut presenter =
            AvPresenter::new(display, None, scenario_config(PresenterMode::RenderMainSwapMainHelped)).unwrap();
        add_red_green(&presenter, SlideContent::draw(|target| target.clear(RED)));

        presenter.start_playing().unwrap();
        assert!(presenter.is_playing());
        play_to_end(&mut presenter);
        assert_clean_two_slide_run(&presenter);
    }

    #[test]
    fn test_clean_two_slide_run_hand_written() {
        let (_clock, display) = manual_display(HeadlessConfig::default());
        let mut presenter =
            AvPresenter::new(display, None, scenario_config(PresenterMode::RenderMainSwapMain)).unwrap();
        add_red_green(&presenter, SlideContent::draw(|target| target.clear(RED)));

        presenter.start_playing().unwrap();
        play_to_end(&mut presenter);
        assert_clean_two_slide_run(&presenter);
    }

    #[test]
    fn test_delayed_first_render_propagates() {
        let (clock, display) = manual_display(HeadlessConfig::default());
        let mut config = scenario_config(PresenterMode::RenderMainSwapMainHelped);
        config.playback.propagate_delays = true;
        let mut presenter = AvPresenter::new(display, None, config).unwrap();

        let delayed = Arc::new(AtomicBool::new(false));
        let slow_clock = clock.clone();
        add_red_green(
            &presenter,
            SlideContent::draw(move |target| {
                target.clear(RED);
                if !delayed.swap(true, Ordering::SeqCst) {
                    slow_clock.advance(PERIOD * 2 + Time::from_millis(1));
                }
            }),
        );

        presenter.start_playing().unwrap();
        play_to_end(&mut presenter);

        let start = chosen_start_frame(&presenter);
        let records = presenter.slide_buffer().records();
        assert_eq!(records[0].actual.start_frame, start + 2);
        assert_eq!(records[1].intended.start_frame, records[0].actual.start_frame + 3);
        assert_eq!(records[1].actual.start_frame, records[1].intended.start_frame);
        assert_eq!(records[1].actual.frame_duration, 6);
        let errors = presenter.check_for_presentation_errors();
        assert_eq!(errors.late_starts, 1);
        assert_eq!(errors.names_of_slides_with_errors, vec!["S0".to_string()]);
    }

    #[test]
    fn test_sync_not_achieved() {
        let (_clock, display) = manual_display(HeadlessConfig {
            refreshes_per_swap: vec![1, 3, 2],
            ..HeadlessConfig::default()
        });
        let mut config = scenario_config(PresenterMode::RenderMainSwapMainHelped);
        config.sync.required_swap_duration = Time::from_millis(160);
        config.sync.ready_timeout = Time::from_millis(50);
        let mut presenter = AvPresenter::new(display, None, config).unwrap();
        add_red_green(&presenter, SlideContent::draw(|target| target.clear(RED)));

        let err = presenter.start_playing().unwrap_err();
        assert!(matches!(err, Error::NotReady));
        assert_eq!(err.to_string(), "Display or sound not ready!");
        assert!(!presenter.is_playing());
        assert!(presenter.sync_point().is_none());
        for record in presenter.slide_buffer().records() {
            assert_eq!(record.state, SlideState::NotStarted);
            assert_eq!(record.intended.start_frame, 0);
            assert_eq!(record.actual, Default::default());
        }
    }

    #[test]
    fn test_empty_buffer_fails_immediately() {
        let (_clock, display) = manual_display(HeadlessConfig::default());
        let mut presenter = AvPresenter::new(display, None, PresenterConfig::default()).unwrap();
        assert!(matches!(presenter.start_playing(), Err(Error::InvalidState(_))));
        assert!(!presenter.is_playing());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (_clock, display) = manual_display(HeadlessConfig::default());
        let mut presenter =
            AvPresenter::new(display, None, scenario_config(PresenterMode::RenderMainSwapMainHelped)).unwrap();
        add_red_green(&presenter, SlideContent::draw(|target| target.clear(RED)));
        presenter.stop_playing();
        presenter.start_playing().unwrap();
        presenter.update_playback().unwrap();
        presenter.stop_playing();
        assert!(!presenter.is_playing());
        presenter.stop_playing();
        assert!(!presenter.update_playback().unwrap());
    }

    #[test]
    fn test_audio_lead_frames() {
        let audio = AudioStreamConfig {
            sample_rate: 48_000,
            output_channels: 2,
            buffer_size: 256,
            number_of_buffers: 4,
        };
        let latency = audio.total_latency();
        assert!((latency.as_millis_f64() - 21.333).abs() < 0.01);
        assert_eq!(lead_frames(latency, PERIOD, 1), 4);
        assert_eq!(lead_frames(Time::ZERO, PERIOD, 1), 2);
    }

    #[test]
    fn test_sound_without_stream_rejected() {
        let (_clock, display) = manual_display(HeadlessConfig::default());
        let presenter = AvPresenter::new(display, None, PresenterConfig::default()).unwrap();
        let sound = SoundBuffer::sine(440.0, Time::from_millis(10), 0.5, 1, 48_000).unwrap();
        assert!(matches!(presenter.set_sound_buffer(&sound), Err(Error::Config(_))));
        assert_eq!(presenter.audio_total_latency(), Time::ZERO);
    }

    #[test]
    fn test_display_thread_modes_with_sound() {
        for mode in [
            PresenterMode::RenderMainSwapThread,
            PresenterMode::RenderThreadSwapThread,
            PresenterMode::RenderMainSwapThreadHelped,
            PresenterMode::RenderThreadSwapThreadHelped,
        ] {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
            let backend = Arc::new(HeadlessBackend::new(clock.clone(), HeadlessConfig::default()));
            let display = Arc::new(Display::new(backend, clock.clone()).unwrap());
            let audio = Arc::new(
                AudioStream::new(
                    AudioStreamConfig {
                        sample_rate: 48_000,
                        output_channels: 2,
                        buffer_size: 1024,
                        number_of_buffers: 2,
                    },
                    clock.clone(),
                )
                .unwrap(),
            );
            let driver = SimulatedAudioDriver::new(audio.clone(), clock.now());
            driver.start().unwrap();

            let mut config = scenario_config(mode);
            config.sync.required_swap_duration = Time::from_millis(200);
            config.sync.ready_timeout = Time::from_secs(5);
            // wall-clock swap times scatter around the predicted ones
            config.playback.late_start_tolerance = Time::from_millis(4);
            let mut presenter = AvPresenter::new(display.clone(), Some(audio), config).unwrap();
            presenter
                .set_sound_buffer(&SoundBuffer::sine(440.0, Time::from_millis(100), 0.5, 1, 48_000).unwrap())
                .unwrap();
            for name in ["a", "b"] {
                presenter
                    .slide_buffer()
                    .add(Slide::new(name, SlideContent::draw(|t| t.clear(RED)), SlideDuration::Frames(3)))
                    .unwrap();
            }

            presenter.start_playing().unwrap();
            let sync_point = presenter.sync_point().unwrap().clone();
            assert!(sync_point.valid);
            assert!(sync_point.client(SOUND_CLIENT).is_some());

            let deadline = Instant::now() + Duration::from_secs(5);
            while presenter.update_playback().unwrap() {
                assert!(Instant::now() < deadline, "{} presentation did not finish", mode);
                std::thread::sleep(Duration::from_millis(1));
            }

            let records = presenter.slide_buffer().records();
            assert!(records.iter().all(|r| r.state == SlideState::Finished), "{}", mode);
            assert_eq!(records[0].actual.start_frame, chosen_start_frame(&presenter), "{}", mode);
            assert_eq!(records[0].actual.frame_duration, 3, "{}", mode);
            assert_eq!(records[1].actual.start_frame, records[0].actual.start_frame + 3, "{}", mode);
            let errors = presenter.check_for_presentation_errors();
            assert_eq!(errors.total_errors(), 0, "{}: {:?}", mode, errors);
            let player = presenter.sound_player().unwrap();
            assert!(presenter.scheduled_sample_frame().is_some(), "{}", mode);
            assert_eq!(player.started_at(), presenter.scheduled_sample_frame());

            presenter.stop_playing();
            driver.stop();
            display.set_autoswap(false).unwrap();
        }
    }
}
