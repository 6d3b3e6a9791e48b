//! GPU Device Abstraction
//!
//! [`GpuDevice`] is the command surface the renderer drives: programs and
//! their uniforms, buffers, textures, framebuffers, fixed-function state,
//! clears, draws and asynchronous readbacks. It is deliberately low level and
//! stateful (one current program, bound texture units, one bound
//! framebuffer) so the renderer's state tracker can skip redundant calls.
//!
//! Implementations:
//! - [`HeadlessDevice`]: in-memory software device used by tests, benches
//!   and tooling. Rasterizes triangles with depth, culling and blending.
//! - `WgpuDevice` (feature `wgpu`): the same contract over `wgpu`.
//!
//! Handles returned by a device are plain ids; the renderer's caches own them
//! and are the only callers of the `delete_*` methods.

pub mod headless;
mod raster;
#[cfg(feature = "wgpu")]
pub mod wgpu_device;

pub use headless::HeadlessDevice;
#[cfg(feature = "wgpu")]
pub use wgpu_device::WgpuDevice;

use std::ops::Range;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};

use crate::renderer::settings::DeviceCapabilities;
use crate::resources::attribute::AttributeFormat;
use crate::resources::material::{BlendState, CompareFunction};
use crate::resources::texture::{TextureFormat, TextureSampler};
use crate::resources::uniforms::UniformKind;

// ─── Handles ─────────────────────────────────────────────────────────────────

macro_rules! device_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u32);

            impl $name {
                #[inline]
                #[must_use]
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }
        )*
    };
}

device_id! {
    /// A linked shader program.
    ProgramId,
    /// A vertex, index or uniform buffer.
    BufferId,
    /// A sampled texture.
    TextureId,
    /// An offscreen framebuffer. The display is addressed with `None`.
    FramebufferId,
}

// ─── Programs ────────────────────────────────────────────────────────────────

/// How a program consumes its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    /// Transforms mesh vertices by `modelMatrix`, `viewMatrix` and
    /// `projectionMatrix`.
    Mesh,
    /// Mesh transform, but writes fragment depth as color. Used by shadow
    /// and depth passes.
    Depth,
    /// Covers the viewport; samples the `source` sampler when it is bound.
    Fullscreen,
}

/// A member of a program's uniform block, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniformSlot {
    pub name: String,
    pub kind: UniformKind,
    pub array_len: usize,
}

/// Everything a device needs to build a program.
#[derive(Debug, Clone)]
pub struct ProgramSource {
    pub label: String,
    pub kind: ProgramKind,
    /// WGSL with `vs_main` and `fs_main` entry points.
    pub source: String,
    pub uniforms: Vec<UniformSlot>,
    pub samplers: Vec<String>,
}

/// A uniform value as the device sees it. Textures are referenced by unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformData {
    Float(f32),
    Int(i32),
    UInt(u32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat3(Mat3),
    Mat4(Mat4),
    FloatArray(Vec<f32>),
    Vec4Array(Vec<Vec4>),
    Sampler(u32),
}

impl UniformData {
    #[must_use]
    pub fn as_mat4(&self) -> Option<Mat4> {
        match self {
            UniformData::Mat4(m) => Some(*m),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            UniformData::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            UniformData::UInt(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            UniformData::Vec3(v) => Some(*v),
            UniformData::Vec4(v) => Some(v.truncate()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vec4(&self) -> Option<Vec4> {
        match self {
            UniformData::Vec4(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_sampler(&self) -> Option<u32> {
        match self {
            UniformData::Sampler(unit) => Some(*unit),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vec4_array(&self) -> Option<&[Vec4]> {
        match self {
            UniformData::Vec4Array(v) => Some(v),
            _ => None,
        }
    }
}

// ─── Buffers & textures ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mip_levels: u32,
}

// ─── Framebuffers ────────────────────────────────────────────────────────────

/// Where a framebuffer attachment lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Renders into a sampled texture.
    Texture(TextureId),
    /// Internal storage owned by the framebuffer (a renderbuffer).
    Storage(TextureFormat),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub width: u32,
    pub height: u32,
    pub color: Option<Attachment>,
    pub depth: Option<Attachment>,
    /// 1 for single-sampled.
    pub samples: u32,
}

/// Pixel rectangle with a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    #[must_use]
    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

// ─── Fixed-function state ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    Ccw,
    Cw,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearRequest {
    pub color: Option<Vec4>,
    pub depth: Option<f32>,
    pub stencil: Option<u32>,
}

// ─── Draws ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct VertexBinding {
    pub name: String,
    pub buffer: BufferId,
    pub format: AttributeFormat,
    /// Advances once per instance instead of once per vertex.
    pub per_instance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBinding {
    pub buffer: BufferId,
    pub format: IndexFormat,
}

/// One indexed or non-indexed triangle-list draw.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub vertices: Vec<VertexBinding>,
    pub index: Option<IndexBinding>,
    /// Element range: indices when indexed, vertices otherwise.
    pub range: Range<u32>,
    pub instances: u32,
}

// ─── Readback ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTarget {
    /// Color attachment in its own format.
    Color,
    /// Depth attachment as little-endian `f32`.
    Depth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadbackStatus {
    Pending,
    Ready(Vec<u8>),
    Failed(String),
}

/// A fenced readback in flight. `poll` checks the fence once and never blocks.
pub trait ReadbackSource {
    fn poll(&mut self) -> ReadbackStatus;
}

// ─── Stats ───────────────────────────────────────────────────────────────────

/// Cumulative call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub programs_created: u64,
    pub programs_deleted: u64,
    pub program_binds: u64,
    pub uniform_uploads: u64,
    pub buffers_created: u64,
    pub buffer_uploads: u64,
    pub buffer_partial_uploads: u64,
    pub textures_created: u64,
    pub textures_deleted: u64,
    pub texture_uploads: u64,
    pub texture_partial_uploads: u64,
    pub texture_resizes: u64,
    pub mipmap_generations: u64,
    pub texture_binds: u64,
    pub framebuffers_created: u64,
    pub framebuffer_resizes: u64,
    pub framebuffer_binds: u64,
    pub blits: u64,
    pub state_changes: u64,
    pub clears: u64,
    pub draw_calls: u64,
    pub triangles: u64,
    pub readbacks: u64,
}

// ─── Device contract ─────────────────────────────────────────────────────────

/// The GPU command surface.
///
/// State-setting methods always forward to the device; deduplication is the
/// caller's job (see [`StateTracker`](crate::renderer::state::StateTracker)).
pub trait GpuDevice {
    fn capabilities(&self) -> &DeviceCapabilities;

    fn stats(&self) -> DeviceStats;

    /// Size of the default (display) framebuffer.
    fn drawing_buffer_size(&self) -> (u32, u32);

    // Programs
    /// Builds a program, returning the compiler/linker log on failure.
    fn create_program(&mut self, source: &ProgramSource) -> Result<ProgramId, String>;
    fn delete_program(&mut self, program: ProgramId);
    fn use_program(&mut self, program: ProgramId);
    fn set_uniform(&mut self, program: ProgramId, name: &str, value: &UniformData);

    // Buffers
    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> BufferId;
    /// Writes `data` at `offset` bytes; growing the buffer is not allowed.
    fn update_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]);
    fn delete_buffer(&mut self, buffer: BufferId);
    fn bind_uniform_buffer(&mut self, slot: u32, buffer: Option<BufferId>);

    // Textures
    fn create_texture(&mut self, desc: &TextureDesc) -> TextureId;
    /// Respecifies the whole base level. `data` is tightly packed, top row first.
    fn upload_texture(&mut self, texture: TextureId, data: &[u8]);
    fn upload_texture_region(&mut self, texture: TextureId, byte_offset: usize, data: &[u8]);
    fn set_texture_sampler(&mut self, texture: TextureId, sampler: &TextureSampler);
    /// Reallocates storage under the same id. Contents become undefined.
    fn resize_texture(&mut self, texture: TextureId, width: u32, height: u32);
    fn generate_mipmaps(&mut self, texture: TextureId);
    fn delete_texture(&mut self, texture: TextureId);
    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>);

    // Framebuffers
    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> FramebufferId;
    /// Resizes internal storage attachments in place. Texture attachments are
    /// resized through [`GpuDevice::resize_texture`].
    fn resize_framebuffer(&mut self, framebuffer: FramebufferId, width: u32, height: u32);
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>);
    /// Copies (and resolves, if `src` is multisampled) the whole of `src`.
    fn blit_framebuffer(&mut self, src: FramebufferId, dst: Option<FramebufferId>, color: bool, depth: bool);
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);

    // Fixed-function state
    fn set_depth_test(&mut self, enabled: bool);
    fn set_depth_func(&mut self, func: CompareFunction);
    fn set_depth_write(&mut self, enabled: bool);
    fn set_blend(&mut self, blend: Option<BlendState>);
    fn set_cull_mode(&mut self, mode: CullMode);
    fn set_front_face(&mut self, face: FrontFace);
    /// `(factor, units)`, `None` disables.
    fn set_polygon_offset(&mut self, offset: Option<(f32, f32)>);
    fn set_color_mask(&mut self, enabled: bool);
    fn set_stencil_test(&mut self, enabled: bool);
    fn set_viewport(&mut self, rect: Rect);
    fn set_scissor(&mut self, rect: Option<Rect>);
    /// Number of active user clip distances.
    fn set_clip_planes(&mut self, count: u32);

    // Commands
    fn clear(&mut self, request: &ClearRequest);
    fn draw(&mut self, call: &DrawCall);
    fn read_pixels(&mut self, framebuffer: Option<FramebufferId>, rect: Rect, target: ReadTarget) -> Box<dyn ReadbackSource>;

    /// Flushes the frame's commands.
    fn end_frame(&mut self) {}
}
