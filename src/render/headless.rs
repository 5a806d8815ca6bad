//! Software backend with simulated vertical blanking.
//!
//! Drawing goes into RGBA8 pixel buffers in memory. [`GpuBackend::present`]
//! sleeps (through the injected [`Clock`]) until the next simulated refresh
//! boundary, so on a [`ManualClock`](crate::core::clock::ManualClock) swaps
//! land exactly on multiples of the refresh period. Rendering completes
//! `gpu_latency` after submission.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

use crate::core::clock::Clock;
use crate::core::time::Time;
use crate::render::backend::{
    Color, FenceStatus, Framebuffer, FramebufferStorage, GpuBackend, GpuFence, RenderError, RenderTarget,
};

/// Headless backend settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_period: Time,
    /// Time from submission until rendered work completes.
    pub gpu_latency: Time,
    /// Refreshes each successive swap waits for, cycled. `[1]` swaps on every
    /// refresh; irregular patterns simulate an unstable display.
    pub refreshes_per_swap: Vec<u32>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            refresh_period: Time::from_nanos(16_666_667),
            gpu_latency: Time::ZERO,
            refreshes_per_swap: vec![1],
        }
    }
}

/// RGBA8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]]
    }

    fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels[i..i + 4].copy_from_slice(&rgba);
    }
}

fn to_rgba8(color: Color) -> [u8; 4] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

/// Framebuffer storage of the headless backend.
#[derive(Debug)]
pub struct HeadlessFramebuffer {
    pixels: Mutex<PixelBuffer>,
}

impl HeadlessFramebuffer {
    pub fn snapshot(&self) -> PixelBuffer {
        self.pixels.lock().clone()
    }
}

impl FramebufferStorage for HeadlessFramebuffer {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`RenderTarget`] over a pixel buffer.
pub struct SoftwareTarget<'a> {
    buffer: &'a mut PixelBuffer,
}

impl<'a> SoftwareTarget<'a> {
    pub fn new(buffer: &'a mut PixelBuffer) -> Self {
        Self { buffer }
    }
}

impl RenderTarget for SoftwareTarget<'_> {
    fn size(&self) -> (u32, u32) {
        (self.buffer.width, self.buffer.height)
    }

    fn clear(&mut self, color: Color) {
        let rgba = to_rgba8(color);
        for chunk in self.buffer.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&rgba);
        }
    }

    fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Color) {
        let rgba = to_rgba8(color);
        let x_end = x.saturating_add(width).min(self.buffer.width);
        let y_end = y.saturating_add(height).min(self.buffer.height);
        for py in y..y_end {
            for px in x..x_end {
                self.buffer.set_pixel(px, py, rgba);
            }
        }
    }

    fn draw_framebuffer(&mut self, framebuffer: &Framebuffer) {
        let Some(storage) = framebuffer.storage::<HeadlessFramebuffer>() else {
            tracing::error!("Framebuffer was not created by the headless backend");
            return;
        };
        let source = storage.pixels.lock();
        if source.width == 0 || source.height == 0 {
            return;
        }
        let (width, height) = (self.buffer.width, self.buffer.height);
        for y in 0..height {
            let sy = (y as u64 * source.height as u64 / height as u64) as u32;
            for x in 0..width {
                let sx = (x as u64 * source.width as u64 / width as u64) as u32;
                self.buffer.set_pixel(x, y, source.pixel(sx, sy));
            }
        }
    }
}

#[derive(Debug)]
struct HeadlessState {
    back: PixelBuffer,
    front: PixelBuffer,
    swap_interval: u32,
    swaps: u64,
    /// Completion time of the most recently submitted work.
    last_completion: Time,
}

/// In-memory [`GpuBackend`].
pub struct HeadlessBackend {
    clock: Arc<dyn Clock>,
    config: HeadlessConfig,
    origin: Time,
    state: Mutex<HeadlessState>,
}

impl HeadlessBackend {
    pub fn new(clock: Arc<dyn Clock>, config: HeadlessConfig) -> Self {
        let origin = clock.now();
        let mut config = config;
        if config.refreshes_per_swap.is_empty() {
            config.refreshes_per_swap.push(1);
        }
        if config.refresh_period <= Time::ZERO {
            config.refresh_period = HeadlessConfig::default().refresh_period;
        }
        Self {
            state: Mutex::new(HeadlessState {
                back: PixelBuffer::new(config.width, config.height),
                front: PixelBuffer::new(config.width, config.height),
                swap_interval: 1,
                swaps: 0,
                last_completion: origin,
            }),
            clock,
            config,
            origin,
        }
    }

    /// Contents currently on screen.
    pub fn front_buffer(&self) -> PixelBuffer {
        self.state.lock().front.clone()
    }

    pub fn back_buffer(&self) -> PixelBuffer {
        self.state.lock().back.clone()
    }

    pub fn swap_count(&self) -> u64 {
        self.state.lock().swaps
    }

    fn submit(&self, state: &mut HeadlessState) {
        let done = self.clock.now() + self.config.gpu_latency;
        state.last_completion = state.last_completion.max(done);
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn resolution(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn refresh_period(&self) -> Time {
        self.config.refresh_period
    }

    fn set_swap_interval(&self, interval: u32) -> Result<(), RenderError> {
        self.state.lock().swap_interval = interval;
        Ok(())
    }

    fn present(&self) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        if state.swap_interval > 0 {
            let pattern = &self.config.refreshes_per_swap;
            let refreshes = pattern[(state.swaps % pattern.len() as u64) as usize].max(1) as i64
                * state.swap_interval as i64;
            let period = self.config.refresh_period.as_nanos();
            let elapsed = (self.clock.now() - self.origin).as_nanos().max(0);
            let boundary = (elapsed / period + refreshes) * period;
            self.clock.sleep_until(self.origin + Time::from_nanos(boundary));
        }
        state.front = state.back.clone();
        state.swaps += 1;
        Ok(())
    }

    fn flush(&self) {}

    fn finish(&self) {
        let done = self.state.lock().last_completion;
        self.clock.sleep_until(done);
    }

    fn draw_back_buffer(&self, draw: &mut dyn FnMut(&mut dyn RenderTarget)) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        draw(&mut SoftwareTarget::new(&mut state.back));
        self.submit(&mut state);
        Ok(())
    }

    fn create_framebuffer(&self, width: u32, height: u32) -> Result<Framebuffer, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidFramebuffer(format!(
                "{}x{} framebuffer",
                width, height
            )));
        }
        let storage = Arc::new(HeadlessFramebuffer {
            pixels: Mutex::new(PixelBuffer::new(width, height)),
        });
        Ok(Framebuffer::new(width, height, storage))
    }

    fn draw_framebuffer(
        &self,
        framebuffer: &Framebuffer,
        draw: &mut dyn FnMut(&mut dyn RenderTarget),
    ) -> Result<(), RenderError> {
        let storage = framebuffer
            .storage::<HeadlessFramebuffer>()
            .ok_or_else(|| RenderError::InvalidFramebuffer("not a headless framebuffer".to_string()))?;
        {
            let mut pixels = storage.pixels.lock();
            draw(&mut SoftwareTarget::new(&mut pixels));
        }
        let mut state = self.state.lock();
        self.submit(&mut state);
        Ok(())
    }

    fn insert_fence(&self) -> Result<Box<dyn GpuFence>, RenderError> {
        let complete_at = self.state.lock().last_completion;
        Ok(Box::new(HeadlessFence {
            clock: self.clock.clone(),
            complete_at,
        }))
    }
}

struct HeadlessFence {
    clock: Arc<dyn Clock>,
    complete_at: Time,
}

impl GpuFence for HeadlessFence {
    fn poll(&mut self) -> FenceStatus {
        if self.clock.now() >= self.complete_at {
            FenceStatus::Signaled(self.complete_at)
        } else {
            FenceStatus::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::render::backend::{BLACK, WHITE};

    fn manual_backend(config: HeadlessConfig) -> (Arc<ManualClock>, HeadlessBackend) {
        let clock = Arc::new(ManualClock::new(Time::ZERO, Time::ZERO));
        let backend = HeadlessBackend::new(clock.clone(), config);
        (clock, backend)
    }

    #[test]
    fn test_present_waits_for_refresh_boundary() {
        let (clock, backend) = manual_backend(HeadlessConfig::default());
        clock.advance(Time::from_millis(5));
        backend.present().unwrap();
        assert_eq!(clock.peek(), Time::from_nanos(16_666_667));
        backend.present().unwrap();
        assert_eq!(clock.peek(), Time::from_nanos(33_333_334));
        assert_eq!(backend.swap_count(), 2);
    }

    #[test]
    fn test_irregular_refresh_pattern() {
        let (clock, backend) = manual_backend(HeadlessConfig {
            refreshes_per_swap: vec![1, 3],
            ..HeadlessConfig::default()
        });
        backend.present().unwrap();
        let first = clock.peek();
        backend.present().unwrap();
        assert_eq!(clock.peek() - first, Time::from_nanos(3 * 16_666_667));
    }

    #[test]
    fn test_swap_interval_zero_does_not_wait() {
        let (clock, backend) = manual_backend(HeadlessConfig::default());
        backend.set_swap_interval(0).unwrap();
        backend.present().unwrap();
        assert_eq!(clock.peek(), Time::ZERO);
    }

    #[test]
    fn test_back_buffer_becomes_front_on_present() {
        let (_clock, backend) = manual_backend(HeadlessConfig::default());
        backend
            .draw_back_buffer(&mut |target| {
                target.clear(BLACK);
                target.fill_rect(0, 0, 2, 2, WHITE);
            })
            .unwrap();
        assert_eq!(backend.front_buffer().pixel(0, 0), [0, 0, 0, 0]);
        backend.present().unwrap();
        let front = backend.front_buffer();
        assert_eq!(front.pixel(1, 1), [255, 255, 255, 255]);
        assert_eq!(front.pixel(2, 2), [0, 0, 0, 255]);
    }

    #[test]
    fn test_framebuffer_blit_scales() {
        let (_clock, backend) = manual_backend(HeadlessConfig {
            width: 4,
            height: 4,
            ..HeadlessConfig::default()
        });
        let framebuffer = backend.create_framebuffer(2, 2).unwrap();
        backend
            .draw_framebuffer(&framebuffer, &mut |target| {
                target.clear(BLACK);
                target.fill_rect(1, 0, 1, 1, WHITE);
            })
            .unwrap();
        backend.draw_back_buffer(&mut |target| target.draw_framebuffer(&framebuffer)).unwrap();
        let back = backend.back_buffer();
        assert_eq!(back.pixel(3, 0), [255, 255, 255, 255]);
        assert_eq!(back.pixel(2, 1), [255, 255, 255, 255]);
        assert_eq!(back.pixel(0, 0), [0, 0, 0, 255]);
        assert!(backend.create_framebuffer(0, 3).is_err());
    }

    #[test]
    fn test_fence_completes_after_latency() {
        let (clock, backend) = manual_backend(HeadlessConfig {
            gpu_latency: Time::from_millis(4),
            ..HeadlessConfig::default()
        });
        backend.draw_back_buffer(&mut |target| target.clear(WHITE)).unwrap();
        let mut fence = backend.insert_fence().unwrap();
        assert_eq!(fence.poll(), FenceStatus::Pending);
        clock.advance(Time::from_millis(4));
        assert_eq!(fence.poll(), FenceStatus::Signaled(Time::from_millis(4)));
    }
}
