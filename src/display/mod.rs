//! The display: a swap source wrapping a GPU backend.
//!
//! Every buffer swap is timestamped and published to the display's swap data
//! container as `(frame number, time)`. Frame numbers count physical
//! refreshes: a swap that took two refresh periods advances the counter by
//! two, so a missed refresh shows up in the data.

pub mod swap_timing;
pub mod thread;

pub use swap_timing::{SwapTiming, DEFAULT_PRE_SWAP_SAFETY_BUFFER};
pub use thread::{DisplayCommand, DisplayThread, QueuedFrameResult, UpdateEvent};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::core::clock::Clock;
use crate::core::time::Time;
use crate::error::{Error, Result};
use crate::render::backend::{Framebuffer, GpuBackend, GpuFence, RenderTarget, SlideContent};
use crate::render::context::RenderingContext;
use crate::sync::data_client::{DataClient, DataClientConfig};
use crate::sync::swap_data::{PolledSwapListener, SwapData, SwapDataContainer, DEFAULT_CAPACITY};

/// Callback invoked after every swap.
pub type SwapListener = Arc<dyn Fn(SwapData) + Send + Sync>;

#[derive(Debug, Default)]
struct SwapState {
    frame: u64,
    last_time: Option<Time>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SwapOptions {
    flush_after_swap: bool,
    finish_after_swap: bool,
}

/// State shared between the display handle and its thread.
pub(crate) struct DisplayCore {
    backend: Arc<dyn GpuBackend>,
    clock: Arc<dyn Clock>,
    context: RenderingContext,
    swap_data: Arc<SwapDataContainer>,
    frame_period: Time,
    swap_state: Mutex<SwapState>,
    options: Mutex<SwapOptions>,
    listeners: Mutex<Vec<SwapListener>>,
}

impl DisplayCore {
    fn ensure_context(&self) -> Result<()> {
        if self.context.is_current() {
            Ok(())
        } else {
            error!("Drawing called without owning the rendering context");
            Err(Error::ContextNotOwned)
        }
    }

    /// Present the back buffer and publish the swap.
    pub(crate) fn swap_buffers(&self) -> Result<SwapData> {
        self.ensure_context()?;
        let data = {
            let mut state = self.swap_state.lock();
            self.backend.present()?;
            let options = *self.options.lock();
            if options.flush_after_swap {
                self.backend.flush();
            }
            if options.finish_after_swap {
                self.backend.finish();
            }
            let time = self.clock.now();
            let advance = match state.last_time {
                Some(previous) => ((time - previous) / self.frame_period).round().max(1.0) as u64,
                None => 1,
            };
            state.frame += advance;
            state.last_time = Some(time);
            self.swap_data.store(state.frame, time);
            SwapData::new(state.frame, time)
        };
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener(data);
        }
        Ok(data)
    }

    pub(crate) fn render_content(&self, content: &SlideContent) -> Result<()> {
        self.ensure_context()?;
        self.backend.draw_back_buffer(&mut |target| content.render(target))?;
        Ok(())
    }

    pub(crate) fn insert_fence(&self) -> Result<Box<dyn GpuFence>> {
        self.ensure_context()?;
        Ok(self.backend.insert_fence()?)
    }

    pub(crate) fn now(&self) -> Time {
        self.clock.now()
    }

    pub(crate) fn context(&self) -> &RenderingContext {
        &self.context
    }

    pub(crate) fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub(crate) fn swap_data(&self) -> &Arc<SwapDataContainer> {
        &self.swap_data
    }

    pub(crate) fn frame_period(&self) -> Time {
        self.frame_period
    }
}

/// A swapping display.
///
/// # Thread Safety
///
/// `Display` is shared (`Arc<Display>`) between the presenter and the display
/// thread. Drawing and swapping require the calling thread to own the
/// rendering context; the creating thread owns it initially.
pub struct Display {
    core: Arc<DisplayCore>,
    thread: DisplayThread,
    swap_check: Mutex<PolledSwapListener>,
}

impl Display {
    /// Create a display over `backend` and acquire the rendering context on
    /// the calling thread.
    pub fn new(backend: Arc<dyn GpuBackend>, clock: Arc<dyn Clock>) -> Result<Self> {
        let swap_data = SwapDataContainer::shared(DEFAULT_CAPACITY, 1);
        let frame_period = backend.refresh_period();
        let core = Arc::new(DisplayCore {
            backend,
            clock,
            context: RenderingContext::new(),
            swap_data: swap_data.clone(),
            frame_period,
            swap_state: Mutex::new(SwapState::default()),
            options: Mutex::new(SwapOptions::default()),
            listeners: Mutex::new(Vec::new()),
        });
        core.context.acquire()?;
        debug!(
            "Display created on {} backend, frame period {}",
            core.backend.name(),
            frame_period
        );
        Ok(Self {
            thread: DisplayThread::new(core.clone()),
            swap_check: Mutex::new(PolledSwapListener::new(swap_data)),
            core,
        })
    }

    /// Present the back buffer, timestamp the swap and publish it.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContextNotOwned` if the calling thread does not own the
    /// rendering context, or the backend's error if presenting failed.
    pub fn swap_buffers(&self) -> Result<SwapData> {
        self.core.swap_buffers()
    }

    /// Back buffer size in pixels.
    pub fn resolution(&self) -> (u32, u32) {
        self.core.backend.resolution()
    }

    /// Nominal time between two refreshes.
    pub fn frame_period(&self) -> Time {
        self.core.frame_period
    }

    /// Number of the last refresh a swap happened on; 0 before the first swap.
    pub fn last_frame_number(&self) -> u64 {
        self.core.swap_data.last_swap_unit()
    }

    pub fn last_swap_data(&self) -> Option<SwapData> {
        self.core.swap_data.last_swap_data()
    }

    pub fn swap_data(&self) -> &Arc<SwapDataContainer> {
        &self.core.swap_data
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.core.clock
    }

    pub fn now(&self) -> Time {
        self.core.clock.now()
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.core.backend
    }

    pub fn thread(&self) -> &DisplayThread {
        &self.thread
    }

    /// Whether the calling thread owns the rendering context.
    pub fn rendering_on_this_thread(&self) -> bool {
        self.core.context.is_current()
    }

    pub fn acquire_context(&self) -> Result<()> {
        self.core.context.acquire()
    }

    pub fn release_context(&self) -> bool {
        self.core.context.release()
    }

    pub fn set_flush_after_swap(&self, flush: bool) {
        self.core.options.lock().flush_after_swap = flush;
    }

    pub fn set_finish_after_swap(&self, finish: bool) {
        self.core.options.lock().finish_after_swap = finish;
    }

    pub fn add_swap_listener(&self, listener: SwapListener) {
        self.core.listeners.lock().push(listener);
    }

    /// Whether a swap happened since the previous call.
    pub fn has_swapped_since_last_check(&self) -> bool {
        self.swap_check.lock().has_swapped(true)
    }

    /// Spin (yielding) until the next swap or `timeout`.
    pub fn wait_for_swap(&self, timeout: Duration) -> bool {
        PolledSwapListener::new(self.core.swap_data.clone()).wait_for_swap(timeout, true)
    }

    /// Spin (yielding) until the swap data satisfy a default sync verifier.
    pub fn wait_for_stable_swapping(&self, timeout: Duration) -> bool {
        let client = DataClient::new(
            self.core.swap_data.clone(),
            self.core.frame_period,
            DataClientConfig::default(),
        );
        let deadline = Instant::now() + timeout;
        loop {
            if client.all_ready() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }

    /// Start or stop swapping on the display thread.
    ///
    /// Starting hands the rendering context to the display thread; stopping
    /// takes it back to the calling thread.
    pub fn set_autoswap(&self, autoswap: bool) -> Result<()> {
        if autoswap {
            self.thread.start_thread()?;
            self.thread.hand_over_context()?;
            self.thread.set_swapping(true);
        } else {
            self.thread.set_swapping(false);
            if self.thread.is_running() {
                self.thread.take_back_context()?;
            }
        }
        Ok(())
    }

    /// Draw into the back buffer.
    pub fn draw(&self, mut draw: impl FnMut(&mut dyn RenderTarget)) -> Result<()> {
        self.core.ensure_context()?;
        self.core.backend.draw_back_buffer(&mut draw)?;
        Ok(())
    }

    /// Render slide content into the back buffer.
    pub fn render_content(&self, content: &SlideContent) -> Result<()> {
        self.core.render_content(content)
    }

    pub fn create_framebuffer(&self, width: u32, height: u32) -> Result<Framebuffer> {
        self.core.ensure_context()?;
        Ok(self.core.backend.create_framebuffer(width, height)?)
    }

    pub fn draw_framebuffer(&self, framebuffer: &Framebuffer, mut draw: impl FnMut(&mut dyn RenderTarget)) -> Result<()> {
        self.core.ensure_context()?;
        self.core.backend.draw_framebuffer(framebuffer, &mut draw)?;
        Ok(())
    }

    /// Insert a fence after all work submitted so far.
    pub fn insert_fence(&self) -> Result<Box<dyn GpuFence>> {
        self.core.insert_fence()
    }

    pub fn flush(&self) {
        self.core.backend.flush();
    }

    pub fn finish(&self) {
        self.core.backend.finish();
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        self.thread.stop_thread(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::render::headless::{HeadlessBackend, HeadlessConfig};
    use std::sync::atomic::{AtomicU64, Ordering};

    const PERIOD: Time = Time::from_nanos(16_666_667);

    fn manual_display() -> (Arc<ManualClock>, Display) {
        let clock = Arc::new(ManualClock::new(Time::ZERO, Time::ZERO));
        let backend = Arc::new(HeadlessBackend::new(clock.clone(), HeadlessConfig::default()));
        let display = Display::new(backend, clock.clone()).unwrap();
        (clock, display)
    }

    #[test]
    fn test_swap_publishes_frame_and_time() {
        let (_clock, display) = manual_display();
        assert_eq!(display.last_frame_number(), 0);
        let first = display.swap_buffers().unwrap();
        assert_eq!(first, SwapData::new(1, PERIOD));
        let second = display.swap_buffers().unwrap();
        assert_eq!(second, SwapData::new(2, PERIOD * 2));
        assert_eq!(display.last_frame_number(), 2);
        assert_eq!(display.swap_data().len(), 2);
    }

    #[test]
    fn test_missed_refreshes_advance_counter() {
        let (clock, display) = manual_display();
        display.swap_buffers().unwrap();
        clock.advance(PERIOD * 2 + Time::from_millis(1));
        let data = display.swap_buffers().unwrap();
        assert_eq!(data.unit, 4);
        assert_eq!(data.time, PERIOD * 4);
    }

    #[test]
    fn test_has_swapped_since_last_check() {
        let (_clock, display) = manual_display();
        assert!(!display.has_swapped_since_last_check());
        display.swap_buffers().unwrap();
        assert!(display.has_swapped_since_last_check());
        assert!(!display.has_swapped_since_last_check());
    }

    #[test]
    fn test_swap_listener_called() {
        let (_clock, display) = manual_display();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        display.add_swap_listener(Arc::new(move |data| {
            counter.store(data.unit, Ordering::SeqCst);
        }));
        display.swap_buffers().unwrap();
        display.swap_buffers().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drawing_requires_context() {
        let (_clock, display) = manual_display();
        assert!(display.rendering_on_this_thread());
        assert!(display.release_context());
        assert!(matches!(display.swap_buffers(), Err(Error::ContextNotOwned)));
        assert!(matches!(display.draw(|t| t.clear([1.0; 4])), Err(Error::ContextNotOwned)));
        display.acquire_context().unwrap();
        display.draw(|t| t.clear([1.0; 4])).unwrap();
    }

    #[test]
    fn test_stable_swapping_after_regular_swaps() {
        let (_clock, display) = manual_display();
        assert!(!display.wait_for_stable_swapping(Duration::from_millis(1)));
        for _ in 0..60 {
            display.swap_buffers().unwrap();
        }
        assert!(display.wait_for_stable_swapping(Duration::from_millis(100)));
    }
}
