//! WGSL shaders for the wgpu backend.

use wgpu::*;

/// Fullscreen blit.
///
/// Shader Interface:
/// - Input: vertex_index (builtin) - three vertices of a triangle covering the viewport
/// - Texture: source image (binding 0)
/// - Sampler: source sampler (binding 1)
/// - Output: sampled color
///
/// The viewport selects the destination rectangle, so the same pipeline
/// copies a framebuffer onto the whole back buffer or a solid color texel
/// into a rectangle.
pub const BLIT_SHADER: &str = r#"
    @group(0) @binding(0) var t_source: texture_2d<f32>;
    @group(0) @binding(1) var s_source: sampler;

    struct VertexOutput {
        @location(0) tex_coords: vec2<f32>,
        @builtin(position) clip_position: vec4<f32>,
    };

    @vertex
    fn vs_main(@builtin(vertex_index) in_vertex_index: u32) -> VertexOutput {
        var out: VertexOutput;
        let x = f32((in_vertex_index << 1u) & 2u);
        let y = f32(in_vertex_index & 2u);
        out.clip_position = vec4<f32>(x * 2.0 - 1.0, 1.0 - y * 2.0, 0.0, 1.0);
        out.tex_coords = vec2<f32>(x, y);
        return out;
    }

    @fragment
    fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
        return textureSample(t_source, s_source, in.tex_coords);
    }
"#;

/// Compile a shader module from WGSL source
pub fn compile_shader(device: &Device, source: &str) -> ShaderModule {
    device.create_shader_module(ShaderModuleDescriptor {
        label: Some("Blit Shader"),
        source: ShaderSource::Wgsl(source.into()),
    })
}
