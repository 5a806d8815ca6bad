//! wgpu backend presenting to a winit window.
//!
//! The back buffer is an offscreen texture that persists across swaps.
//! [`GpuBackend::present`] blits it onto the acquired surface texture and
//! presents; with a vsynced present mode acquisition blocks on the
//! presentation engine, which paces the caller to the refresh rate.
//! Fences are implemented with `Queue::on_submitted_work_done`.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use wgpu::*;
use winit::window::Window;

use crate::core::clock::Clock;
use crate::core::time::Time;
use crate::render::backend::{
    Color as RgbaColor, FenceStatus, Framebuffer, FramebufferStorage, GpuBackend, GpuFence, RenderError,
    RenderTarget,
};
use crate::render::shader::{compile_shader, BLIT_SHADER};

const DEFAULT_REFRESH_PERIOD: Time = Time::from_nanos(16_666_667);

/// A sampled, renderable texture.
#[derive(Debug)]
struct GpuImage {
    texture: Texture,
    view: TextureView,
    bind_group: BindGroup,
    width: u32,
    height: u32,
}

/// Framebuffer storage of the wgpu backend.
#[derive(Debug)]
pub struct WgpuFramebuffer {
    image: GpuImage,
}

impl FramebufferStorage for WgpuFramebuffer {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`GpuBackend`] drawing with wgpu into a window surface.
pub struct WgpuBackend {
    clock: Arc<dyn Clock>,
    window: Arc<Window>,
    device: Arc<Device>,
    queue: Queue,
    surface: Surface<'static>,
    surface_config: Mutex<SurfaceConfiguration>,
    pipeline: RenderPipeline,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    back_buffer: Mutex<GpuImage>,
    refresh_period: Time,
}

impl WgpuBackend {
    /// Create a backend drawing into `window`.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Surface` if no surface can be created for the
    /// window and `RenderError::Device` if no adapter or device is available.
    pub fn new(window: Arc<Window>, clock: Arc<dyn Clock>) -> Result<Self, RenderError> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| RenderError::Surface(e.to_string()))?;

        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RenderError::Device("No adapter found".to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &DeviceDescriptor {
                label: Some("avstim device"),
                required_features: Features::empty(),
                required_limits: Limits::default(),
            },
            None,
        ))
        .map_err(|e| RenderError::Device(e.to_string()))?;
        let device = Arc::new(device);

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| RenderError::Surface("Surface reports no formats".to_string()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(CompositeAlphaMode::Auto);

        let size = window.inner_size();
        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &surface_config);

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("Blit Bind Group Layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Texture {
                        multisampled: false,
                        view_dimension: TextureViewDimension::D2,
                        sample_type: TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Sampler(SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("Blit Sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        let shader = compile_shader(&device, BLIT_SHADER);
        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("Blit Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Blit Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: PipelineCompilationOptions::default(),
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(ColorTargetState {
                    format: surface_format,
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
                compilation_options: PipelineCompilationOptions::default(),
            }),
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState::default(),
            multiview: None,
        });

        let back_buffer = create_image(
            &device,
            &bind_group_layout,
            &sampler,
            surface_format,
            surface_config.width,
            surface_config.height,
            "Back Buffer",
        );

        let refresh_period = window
            .current_monitor()
            .and_then(|monitor| monitor.refresh_rate_millihertz())
            .filter(|&mhz| mhz > 0)
            .map(|mhz| Time::from_nanos_f64(1e12 / mhz as f64))
            .unwrap_or(DEFAULT_REFRESH_PERIOD);
        info!(
            "wgpu backend on {:?}: {}x{} {:?}, refresh period {}",
            adapter.get_info().backend,
            surface_config.width,
            surface_config.height,
            surface_format,
            refresh_period
        );

        Ok(Self {
            clock,
            window,
            device,
            queue,
            surface,
            surface_config: Mutex::new(surface_config),
            pipeline,
            bind_group_layout,
            sampler,
            back_buffer: Mutex::new(back_buffer),
            refresh_period,
        })
    }

    /// Resize the surface and the back buffer. The back buffer content is lost.
    pub fn resize(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let mut config = self.surface_config.lock();
        config.width = width;
        config.height = height;
        self.surface.configure(&self.device, &config);
        *self.back_buffer.lock() = create_image(
            &self.device,
            &self.bind_group_layout,
            &self.sampler,
            config.format,
            width,
            height,
            "Back Buffer",
        );
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    fn format(&self) -> TextureFormat {
        self.surface_config.lock().format
    }

    fn draw_into(
        &self,
        view: &TextureView,
        size: (u32, u32),
        draw: &mut dyn FnMut(&mut dyn RenderTarget),
    ) {
        let encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("Draw Encoder"),
        });
        let mut target = WgpuTarget {
            backend: self,
            view,
            size,
            encoder,
        };
        draw(&mut target);
        self.queue.submit(std::iter::once(target.encoder.finish()));
    }
}

fn create_image(
    device: &Device,
    layout: &BindGroupLayout,
    sampler: &Sampler,
    format: TextureFormat,
    width: u32,
    height: u32,
    label: &str,
) -> GpuImage {
    let texture = device.create_texture(&TextureDescriptor {
        label: Some(label),
        size: Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format,
        usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&TextureViewDescriptor::default());
    let bind_group = device.create_bind_group(&BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &[
            BindGroupEntry {
                binding: 0,
                resource: BindingResource::TextureView(&view),
            },
            BindGroupEntry {
                binding: 1,
                resource: BindingResource::Sampler(sampler),
            },
        ],
    });
    GpuImage {
        texture,
        view,
        bind_group,
        width,
        height,
    }
}

fn blit(
    encoder: &mut CommandEncoder,
    pipeline: &RenderPipeline,
    target: &TextureView,
    source: &BindGroup,
    viewport: (f32, f32, f32, f32),
) {
    let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
        label: Some("Blit Pass"),
        color_attachments: &[Some(RenderPassColorAttachment {
            view: target,
            resolve_target: None,
            ops: Operations {
                load: LoadOp::Load,
                store: StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        occlusion_query_set: None,
        timestamp_writes: None,
    });
    let (x, y, w, h) = viewport;
    pass.set_viewport(x, y, w, h, 0.0, 1.0);
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, source, &[]);
    pass.draw(0..3, 0..1);
}

struct WgpuTarget<'a> {
    backend: &'a WgpuBackend,
    view: &'a TextureView,
    size: (u32, u32),
    encoder: CommandEncoder,
}

impl RenderTarget for WgpuTarget<'_> {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn clear(&mut self, color: RgbaColor) {
        let [r, g, b, a] = color.map(f64::from);
        let _pass = self.encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("Clear Pass"),
            color_attachments: &[Some(RenderPassColorAttachment {
                view: self.view,
                resolve_target: None,
                ops: Operations {
                    load: LoadOp::Clear(wgpu::Color { r, g, b, a }),
                    store: StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
    }

    fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: RgbaColor) {
        let (tw, th) = self.size;
        let x_end = x.saturating_add(width).min(tw);
        let y_end = y.saturating_add(height).min(th);
        if x >= x_end || y >= y_end {
            return;
        }
        let backend = self.backend;
        let texel = create_image(
            &backend.device,
            &backend.bind_group_layout,
            &backend.sampler,
            TextureFormat::Rgba8Unorm,
            1,
            1,
            "Fill Texel",
        );
        backend.queue.write_texture(
            ImageCopyTexture {
                texture: &texel.texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            &color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8),
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        blit(
            &mut self.encoder,
            &backend.pipeline,
            self.view,
            &texel.bind_group,
            (x as f32, y as f32, (x_end - x) as f32, (y_end - y) as f32),
        );
    }

    fn draw_framebuffer(&mut self, framebuffer: &Framebuffer) {
        let Some(storage) = framebuffer.storage::<WgpuFramebuffer>() else {
            warn!("Framebuffer was not created by the wgpu backend");
            return;
        };
        let (w, h) = self.size;
        blit(
            &mut self.encoder,
            &self.backend.pipeline,
            self.view,
            &storage.image.bind_group,
            (0.0, 0.0, w as f32, h as f32),
        );
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn resolution(&self) -> (u32, u32) {
        let back = self.back_buffer.lock();
        (back.width, back.height)
    }

    fn refresh_period(&self) -> Time {
        self.refresh_period
    }

    fn set_swap_interval(&self, interval: u32) -> Result<(), RenderError> {
        let mut config = self.surface_config.lock();
        config.present_mode = if interval == 0 {
            PresentMode::AutoNoVsync
        } else {
            PresentMode::AutoVsync
        };
        self.surface.configure(&self.device, &config);
        Ok(())
    }

    fn present(&self) -> Result<(), RenderError> {
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(SurfaceError::Lost | SurfaceError::Outdated) => {
                self.surface.configure(&self.device, &self.surface_config.lock());
                return Err(RenderError::Surface("Surface lost, reconfigured".to_string()));
            }
            Err(e) => return Err(RenderError::Surface(e.to_string())),
        };
        let view = frame.texture.create_view(&TextureViewDescriptor::default());
        let mut encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("Present Encoder"),
        });
        {
            let back = self.back_buffer.lock();
            let config = self.surface_config.lock();
            blit(
                &mut encoder,
                &self.pipeline,
                &view,
                &back.bind_group,
                (0.0, 0.0, config.width as f32, config.height as f32),
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        self.window.pre_present_notify();
        frame.present();
        Ok(())
    }

    fn flush(&self) {
        let _ = self.device.poll(Maintain::Poll);
    }

    fn finish(&self) {
        let _ = self.device.poll(Maintain::Wait);
    }

    fn draw_back_buffer(&self, draw: &mut dyn FnMut(&mut dyn RenderTarget)) -> Result<(), RenderError> {
        let back = self.back_buffer.lock();
        self.draw_into(&back.view, (back.width, back.height), draw);
        Ok(())
    }

    fn create_framebuffer(&self, width: u32, height: u32) -> Result<Framebuffer, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidFramebuffer(format!(
                "{}x{} framebuffer",
                width, height
            )));
        }
        let image = create_image(
            &self.device,
            &self.bind_group_layout,
            &self.sampler,
            self.format(),
            width,
            height,
            "Slide Framebuffer",
        );
        Ok(Framebuffer::new(width, height, Arc::new(WgpuFramebuffer { image })))
    }

    fn draw_framebuffer(
        &self,
        framebuffer: &Framebuffer,
        draw: &mut dyn FnMut(&mut dyn RenderTarget),
    ) -> Result<(), RenderError> {
        let storage = framebuffer
            .storage::<WgpuFramebuffer>()
            .ok_or_else(|| RenderError::InvalidFramebuffer("not a wgpu framebuffer".to_string()))?;
        self.draw_into(
            &storage.image.view,
            (storage.image.width, storage.image.height),
            draw,
        );
        Ok(())
    }

    fn insert_fence(&self) -> Result<Box<dyn GpuFence>, RenderError> {
        let signaled_at = Arc::new(AtomicI64::new(i64::MIN));
        let clock = self.clock.clone();
        let flag = signaled_at.clone();
        self.queue.on_submitted_work_done(move || {
            flag.store(clock.now().as_nanos(), Ordering::SeqCst);
        });
        Ok(Box::new(WgpuFence {
            device: self.device.clone(),
            signaled_at,
        }))
    }
}

struct WgpuFence {
    device: Arc<Device>,
    signaled_at: Arc<AtomicI64>,
}

impl GpuFence for WgpuFence {
    fn poll(&mut self) -> FenceStatus {
        let _ = self.device.poll(Maintain::Poll);
        match self.signaled_at.load(Ordering::SeqCst) {
            i64::MIN => FenceStatus::Pending,
            nanos => FenceStatus::Signaled(Time::from_nanos(nanos)),
        }
    }
}
