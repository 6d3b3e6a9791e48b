//! [`GpuDevice`] over `wgpu`.
//!
//! The device keeps the same stateful surface as the headless device and
//! turns it into `wgpu` objects:
//!
//! - Every draw and clear records its own render pass into a frame encoder.
//!   Pipelines are cached per program, vertex layout, target formats and
//!   fixed-function state.
//! - Uniform values are packed per draw into a frame arena and bound at a
//!   dynamic offset (group 0). Samplers live in group 1, the lights block in
//!   group 2.
//! - Queue writes (buffer and texture uploads) flush the recorded commands
//!   first, so each draw observes the data that was current when it was
//!   issued.
//! - The display is an offscreen `Rgba8Unorm` texture; hosts copy it to their
//!   surface through [`WgpuDevice::display_texture`].

use std::borrow::Cow;
use std::num::NonZeroU64;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::headless::validate_program;
use super::{
    Attachment, BufferId, BufferKind, ClearRequest, CullMode, DeviceStats, DrawCall, FramebufferDesc, FramebufferId,
    FrontFace, GpuDevice, IndexFormat, ProgramId, ProgramKind, ProgramSource, ReadTarget, ReadbackSource,
    ReadbackStatus, Rect, TextureDesc, TextureId, UniformData, UniformSlot,
};
use crate::errors::{Result, TrellisError};
use crate::renderer::context::LIGHTS_BLOCK_SLOT;
use crate::renderer::settings::DeviceCapabilities;
use crate::resources::attribute::{AttributeFormat, ComponentType};
use crate::resources::material::{BlendFactor, BlendOperation, BlendState, CompareFunction};
use crate::resources::texture::{FilterMode, TextureFormat, TextureSampler, WrapMode};

const UNIFORM_ARENA_SIZE: usize = 4 << 20;
const DISPLAY_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
const DISPLAY_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24Plus;
const INSTANCE_MATRIX: &str = "instanceMatrix";

// ============================================================================
// Format mapping
// ============================================================================

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
        // Depth24Plus cannot be copied out; 32-bit float keeps depth readable.
        TextureFormat::Depth24Plus | TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

fn has_stencil(format: TextureFormat) -> bool {
    format == TextureFormat::Depth24PlusStencil8
}

fn texture_usage(format: TextureFormat) -> wgpu::TextureUsages {
    let base = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT;
    if has_stencil(format) {
        base
    } else {
        base | wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST
    }
}

fn compare_function(func: CompareFunction) -> wgpu::CompareFunction {
    match func {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::Src => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Dst => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn blend_operation(operation: BlendOperation) -> wgpu::BlendOperation {
    match operation {
        BlendOperation::Add => wgpu::BlendOperation::Add,
        BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
        BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOperation::Min => wgpu::BlendOperation::Min,
        BlendOperation::Max => wgpu::BlendOperation::Max,
    }
}

fn blend_state(blend: &BlendState) -> wgpu::BlendState {
    let component = |c: &crate::resources::material::BlendComponent| {
        // Min/Max ignore the factors and require them to be One.
        let (src, dst) = match c.operation {
            BlendOperation::Min | BlendOperation::Max => (wgpu::BlendFactor::One, wgpu::BlendFactor::One),
            _ => (blend_factor(c.src), blend_factor(c.dst)),
        };
        wgpu::BlendComponent {
            src_factor: src,
            dst_factor: dst,
            operation: blend_operation(c.operation),
        }
    };
    wgpu::BlendState {
        color: component(&blend.color),
        alpha: component(&blend.alpha),
    }
}

fn address_mode(mode: WrapMode) -> wgpu::AddressMode {
    match mode {
        WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

fn filter_mode(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

fn mipmap_filter_mode(mode: FilterMode) -> wgpu::MipmapFilterMode {
    match mode {
        FilterMode::Nearest => wgpu::MipmapFilterMode::Nearest,
        FilterMode::Linear => wgpu::MipmapFilterMode::Linear,
    }
}

fn vertex_format(format: AttributeFormat) -> Option<wgpu::VertexFormat> {
    use wgpu::VertexFormat as V;
    use ComponentType as C;

    Some(match (format.component, format.item_size, format.normalized) {
        (C::F32, 1, _) => V::Float32,
        (C::F32, 2, _) => V::Float32x2,
        (C::F32, 3, _) => V::Float32x3,
        (C::F32, 4, _) => V::Float32x4,
        (C::U32, 1, _) => V::Uint32,
        (C::U32, 2, _) => V::Uint32x2,
        (C::U32, 3, _) => V::Uint32x3,
        (C::U32, 4, _) => V::Uint32x4,
        (C::I32, 1, _) => V::Sint32,
        (C::I32, 2, _) => V::Sint32x2,
        (C::I32, 3, _) => V::Sint32x3,
        (C::I32, 4, _) => V::Sint32x4,
        (C::U16, 2, true) => V::Unorm16x2,
        (C::U16, 4, true) => V::Unorm16x4,
        (C::U16, 2, false) => V::Uint16x2,
        (C::U16, 4, false) => V::Uint16x4,
        (C::I16, 2, true) => V::Snorm16x2,
        (C::I16, 4, true) => V::Snorm16x4,
        (C::I16, 2, false) => V::Sint16x2,
        (C::I16, 4, false) => V::Sint16x4,
        (C::U8, 2, true) => V::Unorm8x2,
        (C::U8, 4, true) => V::Unorm8x4,
        (C::U8, 2, false) => V::Uint8x2,
        (C::U8, 4, false) => V::Uint8x4,
        (C::I8, 2, true) => V::Snorm8x2,
        (C::I8, 4, true) => V::Snorm8x4,
        (C::I8, 2, false) => V::Sint8x2,
        (C::I8, 4, false) => V::Sint8x4,
        _ => return None,
    })
}

/// Shader location of a named vertex attribute.
fn attribute_location(name: &str) -> Option<u32> {
    match name {
        "position" => Some(0),
        "normal" => Some(1),
        "uv" => Some(2),
        "color" => Some(3),
        _ => None,
    }
}

const fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

// ============================================================================
// Uniform packing
// ============================================================================

#[derive(Debug, Clone)]
struct UniformMember {
    name: String,
    offset: usize,
    size: usize,
}

/// Byte layout of a program's uniform struct, in declaration order.
#[derive(Debug, Clone, Default)]
struct UniformLayout {
    members: Vec<UniformMember>,
    size: usize,
}

impl UniformLayout {
    fn new(slots: &[UniformSlot]) -> Self {
        let mut members = Vec::with_capacity(slots.len());
        let mut cursor = 0;
        for slot in slots {
            let Some((align, size)) = slot.kind.layout(slot.array_len) else {
                continue;
            };
            let offset = align_up(cursor, align);
            members.push(UniformMember {
                name: slot.name.clone(),
                offset,
                size,
            });
            cursor = offset + size;
        }
        Self {
            members,
            size: align_up(cursor.max(16), 16),
        }
    }

    fn pack(&self, values: &FxHashMap<String, UniformData>) -> Vec<u8> {
        let mut out = vec![0_u8; self.size];
        for member in &self.members {
            let Some(value) = values.get(&member.name) else {
                continue;
            };
            let bytes = encode_uniform(value);
            let len = bytes.len().min(member.size);
            out[member.offset..member.offset + len].copy_from_slice(&bytes[..len]);
        }
        out
    }
}

/// Uniform-block bytes of one value. Arrays use a 16-byte element stride.
fn encode_uniform(value: &UniformData) -> Vec<u8> {
    let floats = |v: &[f32]| bytemuck::cast_slice::<f32, u8>(v).to_vec();
    match value {
        UniformData::Float(v) => v.to_le_bytes().to_vec(),
        UniformData::Int(v) => v.to_le_bytes().to_vec(),
        UniformData::UInt(v) => v.to_le_bytes().to_vec(),
        UniformData::Vec2(v) => floats(&v.to_array()),
        UniformData::Vec3(v) => floats(&v.to_array()),
        UniformData::Vec4(v) => floats(&v.to_array()),
        UniformData::Mat3(m) => {
            let columns: Vec<f32> = (0..3).flat_map(|i| m.col(i).extend(0.0).to_array()).collect();
            floats(&columns)
        }
        UniformData::Mat4(m) => floats(&m.to_cols_array()),
        UniformData::FloatArray(values) => {
            let padded: Vec<f32> = values.iter().flat_map(|&v| [v, 0.0, 0.0, 0.0]).collect();
            floats(&padded)
        }
        UniformData::Vec4Array(values) => {
            let flat: Vec<f32> = values.iter().flat_map(|v| v.to_array()).collect();
            floats(&flat)
        }
        UniformData::Sampler(_) => Vec::new(),
    }
}

/// Per-frame uniform storage. Each draw's block is appended at an aligned
/// offset and the whole arena is written once before submission.
struct UniformArena {
    buffer: wgpu::Buffer,
    data: Vec<u8>,
    alignment: usize,
}

impl UniformArena {
    fn new(device: &wgpu::Device) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment.max(1) as usize;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Uniform Arena"),
            size: UNIFORM_ARENA_SIZE as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            data: Vec::with_capacity(64 << 10),
            alignment,
        }
    }

    /// Dynamic offset of the appended block, `None` when the arena is full.
    fn push(&mut self, bytes: &[u8]) -> Option<u32> {
        let offset = align_up(self.data.len(), self.alignment);
        if offset + bytes.len() > UNIFORM_ARENA_SIZE {
            return None;
        }
        self.data.resize(offset, 0);
        self.data.extend_from_slice(bytes);
        u32::try_from(offset).ok()
    }
}

// ============================================================================
// Resources
// ============================================================================

#[derive(Debug, Clone)]
struct SamplerSlot {
    name: String,
    /// Depth texture compared against a reference (shadow maps).
    shadow: bool,
}

struct WgpuProgram {
    label: String,
    kind: ProgramKind,
    module: wgpu::ShaderModule,
    uniforms: UniformLayout,
    values: FxHashMap<String, UniformData>,
    samplers: Vec<SamplerSlot>,
    uses_lights: bool,
    sampler_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniform_group: wgpu::BindGroup,
}

struct WgpuBuffer {
    kind: BufferKind,
    buffer: wgpu::Buffer,
    size: usize,
}

struct WgpuTexture {
    texture: wgpu::Texture,
    /// Whole mip chain, depth aspect only for depth formats.
    view: wgpu::TextureView,
    format: TextureFormat,
    mip_levels: u32,
    sampler: wgpu::Sampler,
    /// CPU copy of the base level, so byte-range updates can be widened to
    /// whole texels.
    bytes: Vec<u8>,
}

enum WgpuAttachment {
    Texture(TextureId),
    Storage(wgpu::Texture, TextureFormat),
}

struct WgpuFramebuffer {
    width: u32,
    height: u32,
    samples: u32,
    color: Option<WgpuAttachment>,
    depth: Option<WgpuAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FixedState {
    depth_test: bool,
    depth_write: bool,
    depth_func: CompareFunction,
    blend: Option<BlendState>,
    cull: CullMode,
    front_face: FrontFace,
    /// `(factor, units)` as raw bits.
    polygon_offset: Option<(u32, u32)>,
    color_write: bool,
}

impl Default for FixedState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_func: CompareFunction::LessEqual,
            blend: None,
            cull: CullMode::Back,
            front_face: FrontFace::Ccw,
            polygon_offset: None,
            color_write: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VertexKey {
    /// `None` for the per-instance matrix, which spans four locations.
    location: Option<u32>,
    format: wgpu::VertexFormat,
    stride: u64,
    per_instance: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: u32,
    vertices: SmallVec<[VertexKey; 6]>,
    color: Option<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
    samples: u32,
    state: FixedState,
}

/// Views and formats of the framebuffer a pass renders into.
struct PassTarget {
    width: u32,
    height: u32,
    samples: u32,
    color: Option<(wgpu::TextureView, TextureFormat)>,
    depth: Option<(wgpu::TextureView, TextureFormat)>,
}

fn base_level_view(texture: &wgpu::Texture) -> wgpu::TextureView {
    texture.create_view(&wgpu::TextureViewDescriptor {
        label: Some("Attachment View"),
        base_mip_level: 0,
        mip_level_count: Some(1),
        ..Default::default()
    })
}

fn sampling_view(texture: &wgpu::Texture, format: TextureFormat) -> wgpu::TextureView {
    let aspect = if format.is_depth() {
        wgpu::TextureAspect::DepthOnly
    } else {
        wgpu::TextureAspect::All
    };
    texture.create_view(&wgpu::TextureViewDescriptor {
        label: Some("Sampling View"),
        aspect,
        ..Default::default()
    })
}

// ============================================================================
// Mipmaps
// ============================================================================

const MIP_BLIT_WGSL: &str = r"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    var corners = array<vec2<f32>, 3>(vec2<f32>(-1.0, -1.0), vec2<f32>(3.0, -1.0), vec2<f32>(-1.0, 3.0));
    var out: VertexOutput;
    out.position = vec4<f32>(corners[index], 0.0, 1.0);
    out.uv = vec2<f32>(corners[index].x * 0.5 + 0.5, 0.5 - corners[index].y * 0.5);
    return out;
}

@group(0) @binding(0) var t_source: texture_2d<f32>;
@group(0) @binding(1) var s_source: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(t_source, s_source, in.uv);
}
";

struct MipmapGenerator {
    shader: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    pipelines: FxHashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl MipmapGenerator {
    fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Mipmap Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(MIP_BLIT_WGSL)),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Mipmap Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Mipmap Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self {
            shader,
            layout,
            sampler,
            pipelines: FxHashMap::default(),
        }
    }

    fn pipeline(&mut self, device: &wgpu::Device, format: wgpu::TextureFormat) -> &wgpu::RenderPipeline {
        let (shader, layout) = (&self.shader, &self.layout);
        self.pipelines.entry(format).or_insert_with(|| {
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Mipmap Pipeline Layout"),
                bind_group_layouts: &[layout],
                immediate_size: 0,
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Mipmap Pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            })
        })
    }

    fn generate(
        &mut self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        texture: &wgpu::Texture,
        mip_levels: u32,
    ) {
        if mip_levels < 2 {
            return;
        }
        let format = texture.format();
        self.pipeline(device, format);
        let Some(pipeline) = self.pipelines.get(&format) else {
            return;
        };

        for level in 0..mip_levels - 1 {
            let level_view = |mip: u32| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("Mip Level"),
                    base_mip_level: mip,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            };
            let src = level_view(level);
            let dst = level_view(level + 1);
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Mipmap Bind Group"),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&src),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Mipmap Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &dst,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
    }
}

// ============================================================================
// Readback
// ============================================================================

struct WgpuReadback {
    device: wgpu::Device,
    buffer: wgpu::Buffer,
    mapped: flume::Receiver<std::result::Result<(), String>>,
    row_bytes: usize,
    padded_row_bytes: usize,
    rows: usize,
}

impl ReadbackSource for WgpuReadback {
    fn poll(&mut self) -> ReadbackStatus {
        let _ = self.device.poll(wgpu::PollType::Poll);
        match self.mapped.try_recv() {
            Ok(Ok(())) => {
                let mut bytes = Vec::with_capacity(self.row_bytes * self.rows);
                {
                    let view = self.buffer.slice(..).get_mapped_range();
                    for row in view.chunks(self.padded_row_bytes).take(self.rows) {
                        bytes.extend_from_slice(&row[..self.row_bytes.min(row.len())]);
                    }
                }
                self.buffer.unmap();
                ReadbackStatus::Ready(bytes)
            }
            Ok(Err(message)) => ReadbackStatus::Failed(message),
            Err(flume::TryRecvError::Empty) => ReadbackStatus::Pending,
            Err(flume::TryRecvError::Disconnected) => ReadbackStatus::Failed("readback already consumed".to_owned()),
        }
    }
}

struct FailedReadback(Option<String>);

impl ReadbackSource for FailedReadback {
    fn poll(&mut self) -> ReadbackStatus {
        ReadbackStatus::Failed(self.0.take().unwrap_or_else(|| "readback already consumed".to_owned()))
    }
}

fn failed(message: impl Into<String>) -> Box<dyn ReadbackSource> {
    Box::new(FailedReadback(Some(message.into())))
}

// ============================================================================
// Device
// ============================================================================

/// Hardware device.
///
/// ```rust,ignore
/// let device = WgpuDevice::new(1280, 720)?;
/// let mut renderer = Renderer::new(device, RendererSettings::default());
/// renderer.render(&mut scene, camera, &mut assets)?;
/// let frame = renderer.device().display_texture();
/// ```
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: DeviceCapabilities,
    stats: DeviceStats,
    float32_filterable: bool,
    next_id: u32,

    display: WgpuFramebuffer,
    programs: FxHashMap<u32, WgpuProgram>,
    buffers: FxHashMap<u32, WgpuBuffer>,
    textures: FxHashMap<u32, WgpuTexture>,
    framebuffers: FxHashMap<u32, WgpuFramebuffer>,
    pipelines: FxHashMap<PipelineKey, wgpu::RenderPipeline>,

    uniforms: UniformArena,
    lights_layout: wgpu::BindGroupLayout,
    lights_groups: FxHashMap<u32, wgpu::BindGroup>,
    white: wgpu::TextureView,
    blank_depth: wgpu::TextureView,
    white_sampler: wgpu::Sampler,
    comparison_sampler: wgpu::Sampler,
    mipmaps: MipmapGenerator,
    encoder: Option<wgpu::CommandEncoder>,

    current_program: Option<ProgramId>,
    texture_units: Vec<Option<TextureId>>,
    uniform_slots: FxHashMap<u32, BufferId>,
    bound_framebuffer: Option<FramebufferId>,
    state: FixedState,
    viewport: Rect,
    scissor: Option<Rect>,
    stencil_test: bool,
    clip_planes: u32,
}

impl WgpuDevice {
    /// Requests an adapter and device, blocking until both are ready.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        pollster::block_on(Self::new_async(width, height))
    }

    pub async fn new_async(width: u32, height: u32) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| TrellisError::AdapterRequestFailed(e.to_string()))?;

        let required_features = adapter.features() & wgpu::Features::FLOAT32_FILTERABLE;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Trellis Device"),
                required_features,
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            })
            .await?;

        let info = adapter.get_info();
        log::info!("Using {} ({:?})", info.name, info.backend);
        Ok(Self::from_parts(device, queue, width, height))
    }

    /// Wraps a device the host already owns.
    #[must_use]
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue, width: u32, height: u32) -> Self {
        device.on_uncaptured_error(Arc::new(|error| log::error!("wgpu: {error}")));

        let limits = device.limits();
        let capabilities = DeviceCapabilities {
            max_texture_size: limits.max_texture_dimension_2d,
            max_texture_units: limits.max_sampled_textures_per_shader_stage.min(16),
            ..DeviceCapabilities::default()
        };
        let float32_filterable = device.features().contains(wgpu::Features::FLOAT32_FILTERABLE);
        let (width, height) = (width.max(1), height.max(1));

        let lights_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Lights Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let white = Self::solid_texture(&device, &queue);
        let blank_depth = Self::blank_depth_texture(&device, &queue);
        let white_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Placeholder Sampler"),
            ..Default::default()
        });
        let comparison_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Shadow Comparison Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });

        let display = WgpuFramebuffer {
            width,
            height,
            samples: 1,
            color: Some(Self::storage(&device, width, height, DISPLAY_FORMAT, 1)),
            depth: Some(Self::storage(&device, width, height, DISPLAY_DEPTH_FORMAT, 1)),
        };

        Self {
            uniforms: UniformArena::new(&device),
            mipmaps: MipmapGenerator::new(&device),
            texture_units: vec![None; capabilities.max_texture_units as usize],
            capabilities,
            stats: DeviceStats::default(),
            float32_filterable,
            next_id: 1,
            display,
            programs: FxHashMap::default(),
            buffers: FxHashMap::default(),
            textures: FxHashMap::default(),
            framebuffers: FxHashMap::default(),
            pipelines: FxHashMap::default(),
            lights_layout,
            lights_groups: FxHashMap::default(),
            white,
            blank_depth,
            white_sampler,
            comparison_sampler,
            encoder: None,
            current_program: None,
            uniform_slots: FxHashMap::default(),
            bound_framebuffer: None,
            state: FixedState::default(),
            viewport: Rect::from_size(width, height),
            scissor: None,
            stencil_test: false,
            clip_planes: 0,
            device,
            queue,
        }
    }

    #[must_use]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The display color attachment (`Rgba8Unorm`, `COPY_SRC`).
    #[must_use]
    pub fn display_texture(&self) -> Option<&wgpu::Texture> {
        match &self.display.color {
            Some(WgpuAttachment::Storage(texture, _)) => Some(texture),
            _ => None,
        }
    }

    /// Reallocates the display attachments. Contents become undefined.
    pub fn resize(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        self.flush();
        self.display = WgpuFramebuffer {
            width,
            height,
            samples: 1,
            color: Some(Self::storage(&self.device, width, height, DISPLAY_FORMAT, 1)),
            depth: Some(Self::storage(&self.device, width, height, DISPLAY_DEPTH_FORMAT, 1)),
        };
    }

    #[must_use]
    pub fn stencil_test_enabled(&self) -> bool {
        self.stencil_test
    }

    #[must_use]
    pub fn clip_plane_count(&self) -> u32 {
        self.clip_planes
    }

    fn solid_texture(device: &wgpu::Device, queue: &wgpu::Queue) -> wgpu::TextureView {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("White Placeholder"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[255, 255, 255, 255],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    /// 1x1 depth texture at the far plane, so an unbound shadow map never
    /// shadows anything.
    fn blank_depth_texture(device: &wgpu::Device, queue: &wgpu::Queue) -> wgpu::TextureView {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Blank Shadow Map"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Blank Shadow Map Clear"),
        });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Blank Shadow Map Clear"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
        }
        queue.submit(std::iter::once(encoder.finish()));
        view
    }

    fn storage(device: &wgpu::Device, width: u32, height: u32, format: TextureFormat, samples: u32) -> WgpuAttachment {
        let usage = if samples > 1 {
            wgpu::TextureUsages::RENDER_ATTACHMENT
        } else if has_stencil(format) {
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
        } else {
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Framebuffer Storage"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: samples.max(1),
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(format),
            usage,
            view_formats: &[],
        });
        WgpuAttachment::Storage(texture, format)
    }

    fn create_sampler(&self, sampler: &TextureSampler) -> wgpu::Sampler {
        let all_linear = sampler.mag_filter == FilterMode::Linear
            && sampler.min_filter == FilterMode::Linear
            && sampler.mipmap_filter == FilterMode::Linear;
        self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Texture Sampler"),
            address_mode_u: address_mode(sampler.wrap_s),
            address_mode_v: address_mode(sampler.wrap_t),
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter_mode(sampler.mag_filter),
            min_filter: filter_mode(sampler.min_filter),
            mipmap_filter: mipmap_filter_mode(sampler.mipmap_filter),
            anisotropy_clamp: if all_linear { sampler.anisotropy.clamp(1, 16) } else { 1 },
            ..Default::default()
        })
    }

    fn create_wgpu_texture(&self, width: u32, height: u32, format: TextureFormat, mip_levels: u32) -> wgpu::Texture {
        let max_levels = 32 - width.max(height).max(1).leading_zeros();
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_levels.clamp(1, max_levels),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(format),
            usage: texture_usage(format),
            view_formats: &[],
        })
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        self.encoder.take().unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        })
    }

    /// Writes the uniform arena and submits everything recorded so far.
    fn flush(&mut self) {
        if !self.uniforms.data.is_empty() {
            self.queue.write_buffer(&self.uniforms.buffer, 0, &self.uniforms.data);
            self.uniforms.data.clear();
        }
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    /// Submits pending commands before a queue write would overtake them.
    fn flush_before_write(&mut self) {
        if self.encoder.is_some() {
            self.flush();
        }
    }

    fn framebuffer(&self, framebuffer: Option<FramebufferId>) -> Option<&WgpuFramebuffer> {
        match framebuffer {
            None => Some(&self.display),
            Some(id) => self.framebuffers.get(&id.0),
        }
    }

    fn attachment_texture<'a>(&'a self, attachment: &'a WgpuAttachment) -> Option<(&'a wgpu::Texture, TextureFormat)> {
        match attachment {
            WgpuAttachment::Storage(texture, format) => Some((texture, *format)),
            WgpuAttachment::Texture(id) => self.textures.get(&id.0).map(|t| (&t.texture, t.format)),
        }
    }

    fn pass_target(&self, framebuffer: Option<FramebufferId>) -> Option<PassTarget> {
        let fb = self.framebuffer(framebuffer)?;
        let view = |attachment: &Option<WgpuAttachment>| {
            attachment
                .as_ref()
                .and_then(|a| self.attachment_texture(a))
                .map(|(texture, format)| (base_level_view(texture), format))
        };
        Some(PassTarget {
            width: fb.width,
            height: fb.height,
            samples: fb.samples,
            color: view(&fb.color),
            depth: view(&fb.depth),
        })
    }

    /// Vertex buffer layout of a draw, in the order buffers are set.
    fn vertex_keys(&self, call: &DrawCall) -> Option<SmallVec<[VertexKey; 6]>> {
        let mut keys = SmallVec::new();
        for binding in &call.vertices {
            let location = if binding.per_instance && binding.name == INSTANCE_MATRIX {
                None
            } else if let Some(location) = attribute_location(&binding.name) {
                Some(location)
            } else {
                continue;
            };
            let format = if location.is_none() {
                wgpu::VertexFormat::Float32x4
            } else if let Some(format) = vertex_format(binding.format) {
                format
            } else {
                log::error!("Attribute '{}' has no vertex format for {:?}", binding.name, binding.format);
                return None;
            };
            let stride = (binding.format.component.size() * binding.format.item_size as usize) as u64;
            keys.push(VertexKey {
                location,
                format,
                stride,
                per_instance: binding.per_instance,
            });
        }
        Some(keys)
    }

    fn sampler_group(&self, program: &WgpuProgram) -> wgpu::BindGroup {
        let bound: Vec<(&wgpu::TextureView, &wgpu::Sampler)> = program
            .samplers
            .iter()
            .map(|slot| {
                let texture = program
                    .values
                    .get(&slot.name)
                    .and_then(UniformData::as_sampler)
                    .and_then(|unit| *self.texture_units.get(unit as usize)?)
                    .and_then(|id| self.textures.get(&id.0));
                match (slot.shadow, texture) {
                    (true, Some(t)) if t.format.is_depth() => (&t.view, &self.comparison_sampler),
                    (true, _) => (&self.blank_depth, &self.comparison_sampler),
                    (false, Some(t)) if self.is_filterable(t.format) => (&t.view, &t.sampler),
                    (false, _) => (&self.white, &self.white_sampler),
                }
            })
            .collect();

        let entries: Vec<wgpu::BindGroupEntry> = bound
            .iter()
            .enumerate()
            .flat_map(|(i, (view, sampler))| {
                let binding = i as u32 * 2;
                [
                    wgpu::BindGroupEntry {
                        binding,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: binding + 1,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                ]
            })
            .collect();

        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{} Samplers", program.label)),
            layout: &program.sampler_layout,
            entries: &entries,
        })
    }

    fn is_filterable(&self, format: TextureFormat) -> bool {
        !format.is_depth() && (format != TextureFormat::Rgba32Float || self.float32_filterable)
    }

    fn lights_group(&mut self) -> Option<&wgpu::BindGroup> {
        let buffer_id = *self.uniform_slots.get(&LIGHTS_BLOCK_SLOT)?;
        let buffer = self.buffers.get(&buffer_id.0)?;
        let (device, layout) = (&self.device, &self.lights_layout);
        Some(self.lights_groups.entry(buffer_id.0).or_insert_with(|| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Lights Bind Group"),
                layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.buffer.as_entire_binding(),
                }],
            })
        }))
    }

    fn scissor_rect(&self, width: u32, height: u32) -> Rect {
        let rect = self.scissor.unwrap_or(Rect::from_size(width, height));
        let x = rect.x.min(width);
        let y = rect.y.min(height);
        Rect::new(x, y, rect.width.min(width - x), rect.height.min(height - y))
    }

    fn blit_color(&self, encoder: &mut wgpu::CommandEncoder, src: &WgpuFramebuffer, dst: &WgpuFramebuffer) {
        let (Some(src_attachment), Some(dst_attachment)) = (&src.color, &dst.color) else {
            return;
        };
        let (Some((src_texture, src_format)), Some((dst_texture, dst_format))) = (
            self.attachment_texture(src_attachment),
            self.attachment_texture(dst_attachment),
        ) else {
            return;
        };
        if src_format != dst_format || src.width != dst.width || src.height != dst.height {
            log::warn!(
                "Color blit needs matching targets ({src_format:?} {}x{} -> {dst_format:?} {}x{})",
                src.width,
                src.height,
                dst.width,
                dst.height
            );
            return;
        }

        if src.samples > 1 {
            let view = base_level_view(src_texture);
            let resolve = base_level_view(dst_texture);
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Resolve Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: Some(&resolve),
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
        } else {
            copy_whole(encoder, src_texture, dst_texture, src.width, src.height, wgpu::TextureAspect::All);
        }
    }

    fn blit_depth(&self, encoder: &mut wgpu::CommandEncoder, src: &WgpuFramebuffer, dst: &WgpuFramebuffer) {
        let (Some(src_attachment), Some(dst_attachment)) = (&src.depth, &dst.depth) else {
            return;
        };
        let (Some((src_texture, src_format)), Some((dst_texture, dst_format))) = (
            self.attachment_texture(src_attachment),
            self.attachment_texture(dst_attachment),
        ) else {
            return;
        };
        if src.samples > 1 || has_stencil(src_format) {
            log::debug!("Depth of a {}x {src_format:?} target is not resolved", src.samples);
            return;
        }
        if texture_format(src_format) != texture_format(dst_format) || src.width != dst.width || src.height != dst.height
        {
            log::warn!("Depth blit needs matching targets");
            return;
        }
        copy_whole(encoder, src_texture, dst_texture, src.width, src.height, wgpu::TextureAspect::DepthOnly);
    }
}

fn copy_whole(
    encoder: &mut wgpu::CommandEncoder,
    src: &wgpu::Texture,
    dst: &wgpu::Texture,
    width: u32,
    height: u32,
    aspect: wgpu::TextureAspect,
) {
    let info = |texture| wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d::ZERO,
        aspect,
    };
    encoder.copy_texture_to_texture(
        info(src),
        info(dst),
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}

/// Splits a tightly packed byte range of a `width`-texel-wide image into
/// per-row `(x, y, texel_count)` spans.
fn row_spans(first_texel: usize, end_texel: usize, width: usize) -> Vec<(u32, u32, u32)> {
    let mut spans = Vec::new();
    let width = width.max(1);
    let mut texel = first_texel;
    while texel < end_texel {
        let (y, x) = (texel / width, texel % width);
        let count = (width - x).min(end_texel - texel);
        spans.push((x as u32, y as u32, count as u32));
        texel += count;
    }
    spans
}

fn create_pipeline(device: &wgpu::Device, program: &WgpuProgram, key: &PipelineKey) -> wgpu::RenderPipeline {
    let attributes: Vec<Vec<wgpu::VertexAttribute>> = key
        .vertices
        .iter()
        .map(|v| match v.location {
            Some(location) => vec![wgpu::VertexAttribute {
                format: v.format,
                offset: 0,
                shader_location: location,
            }],
            None => (0..4)
                .map(|i| wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x4,
                    offset: u64::from(i) * 16,
                    shader_location: 4 + i,
                })
                .collect(),
        })
        .collect();
    let buffers: Vec<wgpu::VertexBufferLayout> = key
        .vertices
        .iter()
        .zip(&attributes)
        .map(|(v, attributes)| wgpu::VertexBufferLayout {
            array_stride: v.stride,
            step_mode: if v.per_instance {
                wgpu::VertexStepMode::Instance
            } else {
                wgpu::VertexStepMode::Vertex
            },
            attributes,
        })
        .collect();

    let state = &key.state;
    let targets = [key.color.map(|format| wgpu::ColorTargetState {
        format,
        blend: state.blend.as_ref().map(blend_state),
        write_mask: if state.color_write {
            wgpu::ColorWrites::ALL
        } else {
            wgpu::ColorWrites::empty()
        },
    })];
    let color_targets: &[Option<wgpu::ColorTargetState>] = if key.color.is_some() { &targets } else { &[] };

    let depth_stencil = key.depth.map(|format| {
        let (slope_scale, constant) = state
            .polygon_offset
            .map_or((0.0, 0), |(factor, units)| (f32::from_bits(factor), f32::from_bits(units) as i32));
        wgpu::DepthStencilState {
            format,
            depth_write_enabled: state.depth_test && state.depth_write,
            depth_compare: if state.depth_test {
                compare_function(state.depth_func)
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState {
                constant,
                slope_scale,
                clamp: 0.0,
            },
        }
    });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&program.label),
        layout: Some(&program.pipeline_layout),
        vertex: wgpu::VertexState {
            module: &program.module,
            entry_point: Some("vs_main"),
            buffers: &buffers,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &program.module,
            entry_point: Some("fs_main"),
            targets: color_targets,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            front_face: match state.front_face {
                FrontFace::Ccw => wgpu::FrontFace::Ccw,
                FrontFace::Cw => wgpu::FrontFace::Cw,
            },
            cull_mode: match state.cull {
                CullMode::None => None,
                CullMode::Front => Some(wgpu::Face::Front),
                CullMode::Back => Some(wgpu::Face::Back),
            },
            ..Default::default()
        },
        depth_stencil,
        multisample: wgpu::MultisampleState {
            count: key.samples,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview_mask: None,
        cache: None,
    })
}

impl GpuDevice for WgpuDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn stats(&self) -> DeviceStats {
        self.stats
    }

    fn drawing_buffer_size(&self) -> (u32, u32) {
        (self.display.width, self.display.height)
    }

    // ---- Programs ----

    fn create_program(&mut self, source: &ProgramSource) -> std::result::Result<ProgramId, String> {
        validate_program(&source.source).map_err(|log| format!("{}: {log}", source.label))?;

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&source.label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&source.source)),
        });
        let info = pollster::block_on(module.get_compilation_info());
        let errors: Vec<String> = info
            .messages
            .iter()
            .filter(|m| matches!(m.message_type, wgpu::CompilationMessageType::Error))
            .map(|m| match &m.location {
                Some(location) => format!("error at {}:{}: {}", location.line_number, location.line_position, m.message),
                None => format!("error: {}", m.message),
            })
            .collect();
        if !errors.is_empty() {
            return Err(format!("{}: {}", source.label, errors.join("\n")));
        }

        let uniforms = UniformLayout::new(&source.uniforms);
        let samplers: Vec<SamplerSlot> = source
            .samplers
            .iter()
            .map(|name| SamplerSlot {
                name: name.clone(),
                shadow: source.source.contains(&format!("t_{name}: texture_depth_2d")),
            })
            .collect();
        let uses_lights = source.source.contains("@group(2)");

        let uniform_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Program Uniforms Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(uniforms.size as u64),
                },
                count: None,
            }],
        });
        let sampler_entries: Vec<wgpu::BindGroupLayoutEntry> = samplers
            .iter()
            .enumerate()
            .flat_map(|(i, slot)| {
                let binding = i as u32 * 2;
                let (sample_type, sampler_type) = if slot.shadow {
                    (wgpu::TextureSampleType::Depth, wgpu::SamplerBindingType::Comparison)
                } else {
                    (
                        wgpu::TextureSampleType::Float { filterable: true },
                        wgpu::SamplerBindingType::Filtering,
                    )
                };
                [
                    wgpu::BindGroupLayoutEntry {
                        binding,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: binding + 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(sampler_type),
                        count: None,
                    },
                ]
            })
            .collect();
        let sampler_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Program Samplers Layout"),
            entries: &sampler_entries,
        });

        let pipeline_layout = {
            let mut layouts = vec![&uniform_layout, &sampler_layout];
            if uses_lights {
                layouts.push(&self.lights_layout);
            }
            self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&source.label),
                bind_group_layouts: &layouts,
                immediate_size: 0,
            })
        };
        let uniform_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Program Uniforms"),
            layout: &uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &self.uniforms.buffer,
                    offset: 0,
                    size: NonZeroU64::new(uniforms.size as u64),
                }),
            }],
        });

        let id = self.alloc_id();
        self.programs.insert(
            id,
            WgpuProgram {
                label: source.label.clone(),
                kind: source.kind,
                module,
                uniforms,
                values: FxHashMap::default(),
                samplers,
                uses_lights,
                sampler_layout,
                pipeline_layout,
                uniform_group,
            },
        );
        self.stats.programs_created += 1;
        Ok(ProgramId(id))
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program.0).is_some() {
            self.stats.programs_deleted += 1;
            self.pipelines.retain(|key, _| key.program != program.0);
        }
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    fn use_program(&mut self, program: ProgramId) {
        self.current_program = Some(program);
        self.stats.program_binds += 1;
    }

    fn set_uniform(&mut self, program: ProgramId, name: &str, value: &UniformData) {
        if let Some(p) = self.programs.get_mut(&program.0) {
            p.values.insert(name.to_owned(), value.clone());
            self.stats.uniform_uploads += 1;
        }
    }

    // ---- Buffers ----

    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> BufferId {
        let usage = match kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM,
        } | wgpu::BufferUsages::COPY_DST;
        // Sizes must be 4-byte aligned; uniform blocks round up to 16.
        let alignment = if kind == BufferKind::Uniform { 16 } else { 4 };
        let size = align_up(data.len().max(1), alignment);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{kind:?} Buffer")),
            size: size as u64,
            usage,
            mapped_at_creation: true,
        });
        buffer.slice(..).get_mapped_range_mut()[..data.len()].copy_from_slice(data);
        buffer.unmap();

        let id = self.alloc_id();
        self.buffers.insert(
            id,
            WgpuBuffer {
                kind,
                buffer,
                size: data.len(),
            },
        );
        self.stats.buffers_created += 1;
        self.stats.buffer_uploads += 1;
        BufferId(id)
    }

    fn update_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        match self.buffers.get(&buffer.0) {
            None => return,
            Some(b) if end > b.size => {
                log::error!("{:?} buffer write {offset}..{end} exceeds size {}", b.kind, b.size);
                return;
            }
            Some(_) => {}
        }
        self.flush_before_write();
        let Some(b) = self.buffers.get(&buffer.0) else {
            return;
        };

        // Queue writes need 4-byte aligned offsets and lengths.
        let start = offset / 4 * 4;
        if start == offset && data.len() % 4 == 0 {
            self.queue.write_buffer(&b.buffer, offset as u64, data);
        } else {
            let padded_end = align_up(end, 4);
            let mut padded = vec![0_u8; padded_end - start];
            padded[offset - start..offset - start + data.len()].copy_from_slice(data);
            log::trace!("Widening unaligned buffer write {offset}..{end} to {start}..{padded_end}");
            self.queue.write_buffer(&b.buffer, start as u64, &padded);
        }

        if offset == 0 && end == b.size {
            self.stats.buffer_uploads += 1;
        } else {
            self.stats.buffer_partial_uploads += 1;
        }
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
        self.lights_groups.remove(&buffer.0);
        self.uniform_slots.retain(|_, b| *b != buffer);
    }

    fn bind_uniform_buffer(&mut self, slot: u32, buffer: Option<BufferId>) {
        match buffer {
            Some(b) => self.uniform_slots.insert(slot, b),
            None => self.uniform_slots.remove(&slot),
        };
        self.stats.state_changes += 1;
    }

    // ---- Textures ----

    fn create_texture(&mut self, desc: &TextureDesc) -> TextureId {
        let texture = self.create_wgpu_texture(desc.width, desc.height, desc.format, desc.mip_levels);
        let view = sampling_view(&texture, desc.format);
        let sampler = self.create_sampler(&TextureSampler::default());
        let id = self.alloc_id();
        self.textures.insert(
            id,
            WgpuTexture {
                mip_levels: texture.mip_level_count(),
                texture,
                view,
                format: desc.format,
                sampler,
                bytes: vec![0; desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel()],
            },
        );
        self.stats.textures_created += 1;
        TextureId(id)
    }

    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) {
        self.flush_before_write();
        let Some(t) = self.textures.get_mut(&texture.0) else {
            return;
        };
        if t.format.is_depth() {
            log::debug!("Depth textures are written by rendering, not uploads");
            return;
        }
        let len = t.bytes.len().min(data.len());
        t.bytes[..len].copy_from_slice(&data[..len]);

        let (width, height) = (t.texture.width(), t.texture.height());
        let bpp = t.format.bytes_per_pixel() as u32;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &t.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &t.bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * bpp),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.stats.texture_uploads += 1;
    }

    fn upload_texture_region(&mut self, texture: TextureId, byte_offset: usize, data: &[u8]) {
        self.flush_before_write();
        let Some(t) = self.textures.get_mut(&texture.0) else {
            return;
        };
        let end = byte_offset + data.len();
        if end > t.bytes.len() {
            log::error!("Texture region {byte_offset}..{end} exceeds size {}", t.bytes.len());
            return;
        }
        if t.format.is_depth() {
            return;
        }
        t.bytes[byte_offset..end].copy_from_slice(data);

        let bpp = t.format.bytes_per_pixel();
        let width = t.texture.width() as usize;
        for (x, y, count) in row_spans(byte_offset / bpp, end.div_ceil(bpp), width) {
            let start = (y as usize * width + x as usize) * bpp;
            let bytes = &t.bytes[start..start + count as usize * bpp];
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &t.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d { x, y, z: 0 },
                    aspect: wgpu::TextureAspect::All,
                },
                bytes,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(count * bpp as u32),
                    rows_per_image: Some(1),
                },
                wgpu::Extent3d {
                    width: count,
                    height: 1,
                    depth_or_array_layers: 1,
                },
            );
        }
        self.stats.texture_partial_uploads += 1;
    }

    fn set_texture_sampler(&mut self, texture: TextureId, sampler: &TextureSampler) {
        if !self.textures.contains_key(&texture.0) {
            return;
        }
        let created = self.create_sampler(sampler);
        if let Some(t) = self.textures.get_mut(&texture.0) {
            t.sampler = created;
        }
    }

    fn resize_texture(&mut self, texture: TextureId, width: u32, height: u32) {
        let Some((format, mip_levels)) = self.textures.get(&texture.0).map(|t| (t.format, t.mip_levels)) else {
            return;
        };
        let created = self.create_wgpu_texture(width, height, format, mip_levels);
        if let Some(t) = self.textures.get_mut(&texture.0) {
            t.view = sampling_view(&created, format);
            t.texture = created;
            t.bytes = vec![0; width as usize * height as usize * format.bytes_per_pixel()];
            self.stats.texture_resizes += 1;
        }
    }

    fn generate_mipmaps(&mut self, texture: TextureId) {
        let Some(t) = self.textures.get(&texture.0) else {
            return;
        };
        if !self.is_filterable(t.format) {
            log::debug!("Skipping mipmaps for {:?}", t.format);
            return;
        }
        let mut encoder = self.take_encoder();
        if let Some(t) = self.textures.get(&texture.0) {
            self.mipmaps.generate(&self.device, &mut encoder, &t.texture, t.mip_levels);
        }
        self.encoder = Some(encoder);
        self.stats.mipmap_generations += 1;
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture.0).is_some() {
            self.stats.textures_deleted += 1;
        }
        for unit in &mut self.texture_units {
            if *unit == Some(texture) {
                *unit = None;
            }
        }
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>) {
        if let Some(slot) = self.texture_units.get_mut(unit as usize) {
            *slot = texture;
            self.stats.texture_binds += 1;
        }
    }

    // ---- Framebuffers ----

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> FramebufferId {
        let samples = desc.samples.max(1);
        let attach = |a: Option<Attachment>| {
            a.map(|a| match a {
                Attachment::Texture(id) => WgpuAttachment::Texture(id),
                Attachment::Storage(format) => Self::storage(&self.device, desc.width, desc.height, format, samples),
            })
        };
        let fb = WgpuFramebuffer {
            width: desc.width,
            height: desc.height,
            samples,
            color: attach(desc.color),
            depth: attach(desc.depth),
        };
        let id = self.alloc_id();
        self.framebuffers.insert(id, fb);
        self.stats.framebuffers_created += 1;
        FramebufferId(id)
    }

    fn resize_framebuffer(&mut self, framebuffer: FramebufferId, width: u32, height: u32) {
        let Some(fb) = self.framebuffers.get_mut(&framebuffer.0) else {
            return;
        };
        fb.width = width;
        fb.height = height;
        let samples = fb.samples;
        for attachment in [&mut fb.color, &mut fb.depth].into_iter().flatten() {
            let format = match attachment {
                WgpuAttachment::Storage(_, format) => *format,
                WgpuAttachment::Texture(_) => continue,
            };
            *attachment = Self::storage(&self.device, width, height, format, samples);
        }
        self.stats.framebuffer_resizes += 1;
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.bound_framebuffer = framebuffer;
        self.stats.framebuffer_binds += 1;
    }

    fn blit_framebuffer(&mut self, src: FramebufferId, dst: Option<FramebufferId>, color: bool, depth: bool) {
        let mut encoder = self.take_encoder();
        if let (Some(source), Some(target)) = (self.framebuffers.get(&src.0), self.framebuffer(dst)) {
            if color {
                self.blit_color(&mut encoder, source, target);
            }
            if depth {
                self.blit_depth(&mut encoder, source, target);
            }
        }
        self.encoder = Some(encoder);
        self.stats.blits += 1;
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer.0);
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
        }
    }

    // ---- Fixed-function state ----

    fn set_depth_test(&mut self, enabled: bool) {
        self.state.depth_test = enabled;
        self.stats.state_changes += 1;
    }

    fn set_depth_func(&mut self, func: CompareFunction) {
        self.state.depth_func = func;
        self.stats.state_changes += 1;
    }

    fn set_depth_write(&mut self, enabled: bool) {
        self.state.depth_write = enabled;
        self.stats.state_changes += 1;
    }

    fn set_blend(&mut self, blend: Option<BlendState>) {
        self.state.blend = blend;
        self.stats.state_changes += 1;
    }

    fn set_cull_mode(&mut self, mode: CullMode) {
        self.state.cull = mode;
        self.stats.state_changes += 1;
    }

    fn set_front_face(&mut self, face: FrontFace) {
        self.state.front_face = face;
        self.stats.state_changes += 1;
    }

    fn set_polygon_offset(&mut self, offset: Option<(f32, f32)>) {
        self.state.polygon_offset = offset.map(|(factor, units)| (factor.to_bits(), units.to_bits()));
        self.stats.state_changes += 1;
    }

    fn set_color_mask(&mut self, enabled: bool) {
        self.state.color_write = enabled;
        self.stats.state_changes += 1;
    }

    fn set_stencil_test(&mut self, enabled: bool) {
        self.stencil_test = enabled;
        self.stats.state_changes += 1;
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.viewport = rect;
        self.stats.state_changes += 1;
    }

    fn set_scissor(&mut self, rect: Option<Rect>) {
        self.scissor = rect;
        self.stats.state_changes += 1;
    }

    fn set_clip_planes(&mut self, count: u32) {
        // Clipping runs in the generated fragment shader; the count is kept
        // for inspection only.
        self.clip_planes = count;
        self.stats.state_changes += 1;
    }

    // ---- Commands ----

    fn clear(&mut self, request: &ClearRequest) {
        let Some(target) = self.pass_target(self.bound_framebuffer) else {
            return;
        };
        if self.scissor.is_some_and(|s| s != Rect::from_size(target.width, target.height)) {
            log::trace!("Clearing the whole attachment; scissored clears are not supported");
        }

        let mut encoder = self.take_encoder();
        {
            let color_attachment = target.color.as_ref().map(|(view, _)| wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: request.color.map_or(wgpu::LoadOp::Load, |c| {
                        wgpu::LoadOp::Clear(wgpu::Color {
                            r: f64::from(c.x),
                            g: f64::from(c.y),
                            b: f64::from(c.z),
                            a: f64::from(c.w),
                        })
                    }),
                    store: wgpu::StoreOp::Store,
                },
            });
            let depth_attachment = target
                .depth
                .as_ref()
                .map(|(view, format)| wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: request.depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: has_stencil(*format).then(|| wgpu::Operations {
                        load: request.stencil.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    }),
                });
            let color_attachments = [color_attachment];
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear Pass"),
                color_attachments: if target.color.is_some() { &color_attachments } else { &[] },
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
        }
        self.encoder = Some(encoder);
        self.stats.clears += 1;
    }

    fn draw(&mut self, call: &DrawCall) {
        if call.range.is_empty() {
            return;
        }
        let Some(program_id) = self.current_program else {
            log::warn!("Draw without a program");
            return;
        };
        let Some(program) = self.programs.get(&program_id.0) else {
            return;
        };
        let kind = program.kind;
        let block = program.uniforms.pack(&program.values);
        let offset = match self.uniforms.push(&block) {
            Some(offset) => offset,
            None => {
                self.flush();
                match self.uniforms.push(&block) {
                    Some(offset) => offset,
                    None => {
                        log::error!("Uniform block of {} bytes exceeds the arena", block.len());
                        return;
                    }
                }
            }
        };

        let Some(target) = self.pass_target(self.bound_framebuffer) else {
            return;
        };
        let vertices = if kind == ProgramKind::Fullscreen {
            SmallVec::new()
        } else {
            match self.vertex_keys(call) {
                Some(keys) => keys,
                None => return,
            }
        };
        let key = PipelineKey {
            program: program_id.0,
            vertices,
            color: target.color.as_ref().map(|(_, f)| texture_format(*f)),
            depth: target.depth.as_ref().map(|(_, f)| texture_format(*f)),
            samples: target.samples,
            state: self.state,
        };
        if !self.pipelines.contains_key(&key) {
            let Some(program) = self.programs.get(&program_id.0) else {
                return;
            };
            let pipeline = create_pipeline(&self.device, program, &key);
            self.pipelines.insert(key.clone(), pipeline);
        }
        let uses_lights = self.programs.get(&program_id.0).is_some_and(|p| p.uses_lights);
        let lights = if uses_lights {
            let Some(group) = self.lights_group().cloned() else {
                log::warn!("Lit program drawn without a lights block");
                return;
            };
            Some(group)
        } else {
            None
        };

        let (Some(program), Some(pipeline)) = (self.programs.get(&program_id.0), self.pipelines.get(&key)) else {
            return;
        };
        let samplers = self.sampler_group(program);
        let scissor = self.scissor_rect(target.width, target.height);
        if scissor.width == 0 || scissor.height == 0 {
            return;
        }
        let vx = self.viewport.x.min(target.width);
        let vy = self.viewport.y.min(target.height);
        let (vw, vh) = (
            self.viewport.width.min(target.width - vx),
            self.viewport.height.min(target.height - vy),
        );

        // Resolve buffers first so a stale handle never drops recorded work.
        let mut vertex_buffers: SmallVec<[&wgpu::Buffer; 6]> = SmallVec::new();
        let mut index_buffer = None;
        if kind != ProgramKind::Fullscreen {
            for binding in &call.vertices {
                let known = (binding.per_instance && binding.name == INSTANCE_MATRIX)
                    || attribute_location(&binding.name).is_some();
                if !known {
                    continue;
                }
                let Some(buffer) = self.buffers.get(&binding.buffer.0) else {
                    log::warn!("Draw references a deleted '{}' buffer", binding.name);
                    return;
                };
                vertex_buffers.push(&buffer.buffer);
            }
            if let Some(index) = &call.index {
                let Some(buffer) = self.buffers.get(&index.buffer.0) else {
                    log::warn!("Draw references a deleted index buffer");
                    return;
                };
                let format = match index.format {
                    IndexFormat::U16 => wgpu::IndexFormat::Uint16,
                    IndexFormat::U32 => wgpu::IndexFormat::Uint32,
                };
                index_buffer = Some((&buffer.buffer, format));
            }
        }

        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        });
        {
            let color_attachments = [target.color.as_ref().map(|(view, _)| wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })];
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Draw Pass"),
                color_attachments: if target.color.is_some() { &color_attachments } else { &[] },
                depth_stencil_attachment: target.depth.as_ref().map(|(view, format)| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: has_stencil(*format).then_some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            pass.set_viewport(vx as f32, vy as f32, vw.max(1) as f32, vh.max(1) as f32, 0.0, 1.0);
            pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &program.uniform_group, &[offset]);
            pass.set_bind_group(1, &samplers, &[]);
            if let Some(lights) = &lights {
                pass.set_bind_group(2, lights, &[]);
            }

            let instances = instances_of(call, kind);
            if kind == ProgramKind::Fullscreen {
                pass.draw(0..3, 0..1);
            } else {
                for (slot, buffer) in vertex_buffers.iter().enumerate() {
                    pass.set_vertex_buffer(slot as u32, buffer.slice(..));
                }
                match index_buffer {
                    Some((buffer, format)) => {
                        pass.set_index_buffer(buffer.slice(..), format);
                        pass.draw_indexed(call.range.clone(), 0, 0..instances);
                    }
                    None => pass.draw(call.range.clone(), 0..instances),
                }
            }
        }
        self.encoder = Some(encoder);

        self.stats.draw_calls += 1;
        self.stats.triangles += u64::from(call.range.end - call.range.start) / 3 * u64::from(instances_of(call, kind));
    }

    fn read_pixels(&mut self, framebuffer: Option<FramebufferId>, rect: Rect, target: ReadTarget) -> Box<dyn ReadbackSource> {
        self.stats.readbacks += 1;
        let Some(fb) = self.framebuffer(framebuffer) else {
            return failed("unknown framebuffer");
        };
        if rect.width == 0 || rect.height == 0 || rect.x + rect.width > fb.width || rect.y + rect.height > fb.height {
            return failed(format!(
                "rect {}x{} at ({}, {}) exceeds the {}x{} attachment",
                rect.width, rect.height, rect.x, rect.y, fb.width, fb.height
            ));
        }
        if fb.samples > 1 {
            return failed("multisampled framebuffers must be resolved before reading");
        }
        let attachment = match target {
            ReadTarget::Color => fb.color.as_ref(),
            ReadTarget::Depth => fb.depth.as_ref(),
        };
        let Some((texture, format)) = attachment.and_then(|a| self.attachment_texture(a)) else {
            return failed(format!("framebuffer has no {target:?} attachment"));
        };
        if has_stencil(format) {
            return failed("depth-stencil attachments cannot be read back");
        }

        let bpp = format.bytes_per_pixel();
        let row_bytes = rect.width as usize * bpp;
        let padded_row_bytes = align_up(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded_row_bytes * rect.height as usize) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let aspect = if format.is_depth() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        };
        let texture = texture.clone();

        let mut encoder = self.take_encoder();
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: rect.x,
                    y: rect.y,
                    z: 0,
                },
                aspect,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes as u32),
                    rows_per_image: Some(rect.height),
                },
            },
            wgpu::Extent3d {
                width: rect.width,
                height: rect.height,
                depth_or_array_layers: 1,
            },
        );
        self.encoder = Some(encoder);
        self.flush();

        let (tx, rx) = flume::bounded(1);
        buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result.map_err(|e| e.to_string()));
        });
        Box::new(WgpuReadback {
            device: self.device.clone(),
            buffer,
            mapped: rx,
            row_bytes,
            padded_row_bytes,
            rows: rect.height as usize,
        })
    }

    fn end_frame(&mut self) {
        self.flush();
    }
}

fn instances_of(call: &DrawCall, kind: ProgramKind) -> u32 {
    if kind == ProgramKind::Fullscreen { 1 } else { call.instances.max(1) }
}

#[cfg(test)]
mod tests {
    use glam::{Mat3, Vec3, Vec4};

    use super::*;
    use crate::resources::uniforms::UniformKind;

    fn slot(name: &str, kind: UniformKind, array_len: usize) -> UniformSlot {
        UniformSlot {
            name: name.to_owned(),
            kind,
            array_len,
        }
    }

    #[test]
    fn uniform_layout_follows_block_alignment() {
        let layout = UniformLayout::new(&[
            slot("opacity", UniformKind::Float, 0),
            slot("diffuse", UniformKind::Vec3, 0),
            slot("alphaTest", UniformKind::Float, 0),
            slot("normalMatrix", UniformKind::Mat3, 0),
            slot("clippingPlanes", UniformKind::Vec4Array, 2),
        ]);
        let offsets: Vec<usize> = layout.members.iter().map(|m| m.offset).collect();
        // vec3 packs a trailing f32 into its fourth lane.
        assert_eq!(offsets, vec![0, 16, 28, 32, 80]);
        assert_eq!(layout.size, 112);
    }

    #[test]
    fn mat3_columns_are_padded() {
        let bytes = encode_uniform(&UniformData::Mat3(Mat3::from_diagonal(Vec3::new(1.0, 2.0, 3.0))));
        let floats: &[f32] = bytemuck::cast_slice(&bytes);
        assert_eq!(floats.len(), 12);
        assert_eq!((floats[0], floats[5], floats[10]), (1.0, 2.0, 3.0));
        assert_eq!((floats[3], floats[7], floats[11]), (0.0, 0.0, 0.0));
    }

    #[test]
    fn pack_truncates_arrays_to_the_declared_length() {
        let layout = UniformLayout::new(&[slot("planes", UniformKind::Vec4Array, 1)]);
        let mut values = FxHashMap::default();
        values.insert("planes".to_owned(), UniformData::Vec4Array(vec![Vec4::ONE, Vec4::splat(2.0)]));
        let bytes = layout.pack(&values);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytemuck::cast_slice::<u8, f32>(&bytes), &[1.0; 4]);
    }

    #[test]
    fn row_spans_split_at_row_ends() {
        assert_eq!(row_spans(2, 3, 4), vec![(2, 0, 1)]);
        assert_eq!(row_spans(3, 9, 4), vec![(3, 0, 1), (0, 1, 4), (0, 2, 1)]);
        assert!(row_spans(5, 5, 4).is_empty());
    }

    #[test]
    fn vertex_formats_cover_float_and_normalized_bytes() {
        let format = |component, item_size, normalized| AttributeFormat {
            component,
            item_size,
            normalized,
        };
        assert_eq!(vertex_format(format(ComponentType::F32, 3, false)), Some(wgpu::VertexFormat::Float32x3));
        assert_eq!(vertex_format(format(ComponentType::U8, 4, true)), Some(wgpu::VertexFormat::Unorm8x4));
        assert_eq!(vertex_format(format(ComponentType::U8, 3, true)), None);
    }
}
