//! GPU abstraction shared by the display, the display thread and the slide
//! buffer.
//!
//! A [`GpuBackend`] owns a persistent back buffer. Drawing goes into the back
//! buffer through a [`RenderTarget`]; [`GpuBackend::present`] makes it visible
//! at the next refresh and blocks until that refresh, the way a vsynced
//! buffer swap does.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::core::time::Time;

/// RGBA color with components in `0.0..=1.0`.
pub type Color = [f32; 4];

pub const BLACK: Color = [0.0, 0.0, 0.0, 1.0];
pub const WHITE: Color = [1.0, 1.0, 1.0, 1.0];

/// Error type for rendering operations
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Surface error: {0}")]
    Surface(String),
    #[error("Device error: {0}")]
    Device(String),
    #[error("Invalid framebuffer: {0}")]
    InvalidFramebuffer(String),
    #[error("Drawing called without owning the rendering context")]
    ContextNotOwned,
}

/// Drawing operations available inside a render callback.
pub trait RenderTarget {
    /// Target size in pixels.
    fn size(&self) -> (u32, u32);

    /// Fill the whole target with `color`.
    fn clear(&mut self, color: Color);

    /// Fill a rectangle given in pixels, clipped to the target.
    fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Color);

    /// Copy `framebuffer` onto the whole target, scaling as needed.
    fn draw_framebuffer(&mut self, framebuffer: &Framebuffer);
}

/// Backend-specific pixel storage behind a [`Framebuffer`].
pub trait FramebufferStorage: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Offscreen image allocated by a backend.
///
/// Cloning is cheap and shares the storage; the storage is released when the
/// last clone is dropped.
#[derive(Clone)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    storage: Arc<dyn FramebufferStorage>,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32, storage: Arc<dyn FramebufferStorage>) -> Self {
        Self {
            width,
            height,
            storage,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Downcast the storage to a backend's concrete type.
    pub fn storage<T: FramebufferStorage>(&self) -> Option<&T> {
        self.storage.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Draw callback invoked with the rendering context current.
pub type DrawFn = Arc<dyn Fn(&mut dyn RenderTarget) + Send + Sync>;

/// What a slide or queued frame shows: a pre-rendered framebuffer or a draw
/// callback run at render time.
#[derive(Clone)]
pub enum SlideContent {
    Framebuffer(Framebuffer),
    Draw(DrawFn),
}

impl SlideContent {
    pub fn draw<F>(f: F) -> Self
    where
        F: Fn(&mut dyn RenderTarget) + Send + Sync + 'static,
    {
        SlideContent::Draw(Arc::new(f))
    }

    /// Render this content onto `target`.
    pub fn render(&self, target: &mut dyn RenderTarget) {
        match self {
            SlideContent::Framebuffer(framebuffer) => target.draw_framebuffer(framebuffer),
            SlideContent::Draw(draw) => draw(target),
        }
    }

    pub fn framebuffer(&self) -> Option<&Framebuffer> {
        match self {
            SlideContent::Framebuffer(framebuffer) => Some(framebuffer),
            SlideContent::Draw(_) => None,
        }
    }
}

impl fmt::Debug for SlideContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlideContent::Framebuffer(framebuffer) => f.debug_tuple("Framebuffer").field(framebuffer).finish(),
            SlideContent::Draw(_) => f.write_str("Draw(..)"),
        }
    }
}

/// State of a GPU fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    /// Work before the fence completed at the given time.
    Signaled(Time),
    Failed,
}

/// Handle to a fence inserted after submitted GPU work.
pub trait GpuFence: Send {
    fn poll(&mut self) -> FenceStatus;
}

/// A window-system/GPU pair the display swaps.
///
/// # Thread Safety
///
/// Backends are shared between the main thread and the display thread. Which
/// thread may draw is enforced one level up by the display's rendering
/// context, not by the backend.
pub trait GpuBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Back buffer size in pixels.
    fn resolution(&self) -> (u32, u32);

    /// Nominal time between two refreshes.
    fn refresh_period(&self) -> Time;

    /// Refreshes per swap; 0 disables waiting for vertical blank.
    fn set_swap_interval(&self, interval: u32) -> Result<(), RenderError>;

    /// Make the back buffer visible, blocking until the swap happens.
    fn present(&self) -> Result<(), RenderError>;

    /// Submit pending GPU commands without waiting.
    fn flush(&self);

    /// Wait for all submitted GPU work to complete.
    fn finish(&self);

    /// Draw into the back buffer.
    fn draw_back_buffer(&self, draw: &mut dyn FnMut(&mut dyn RenderTarget)) -> Result<(), RenderError>;

    fn create_framebuffer(&self, width: u32, height: u32) -> Result<Framebuffer, RenderError>;

    /// Draw into a framebuffer previously created by this backend.
    fn draw_framebuffer(
        &self,
        framebuffer: &Framebuffer,
        draw: &mut dyn FnMut(&mut dyn RenderTarget),
    ) -> Result<(), RenderError>;

    /// Insert a fence after all work submitted so far.
    fn insert_fence(&self) -> Result<Box<dyn GpuFence>, RenderError>;
}
