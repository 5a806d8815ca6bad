pub mod backend;
pub mod context;
pub mod fence;
pub mod headless;
pub mod shader;
pub mod wgpu_backend;

pub use backend::{
    Color, DrawFn, FenceStatus, Framebuffer, FramebufferStorage, GpuBackend, GpuFence, RenderError, RenderTarget,
    SlideContent,
};
pub use context::RenderingContext;
pub use fence::FenceSync;
pub use headless::{HeadlessBackend, HeadlessConfig, PixelBuffer};
pub use wgpu_backend::WgpuBackend;
