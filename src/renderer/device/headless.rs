//! In-memory software implementation of [`GpuDevice`].
//!
//! Everything lives in CPU memory: buffers are byte vectors, textures and
//! framebuffer attachments are planes of `Vec4` texels. Draw calls run a
//! fixed vertex stage (`projectionMatrix * viewMatrix * modelMatrix`, with an
//! optional per-instance `instanceMatrix`) and one of three fragment stages:
//!
//! - [`ProgramKind::Mesh`]: `diffuse`/`opacity` modulated by the `map`
//!   sampler and vertex colors, alpha test, screen-space transmission over
//!   `transmissionSamplerMap`, user clip planes and fog. Receivers that
//!   bind directional or spot shadow maps are darkened by the mean
//!   single-tap visibility read through the shadow matrices of the lights
//!   block
//! - [`ProgramKind::Depth`]: writes the fragment depth
//! - [`ProgramKind::Fullscreen`]: samples `source`, then tone maps and
//!   encodes the output
//!
//! Program "compilation" validates structure only (entry points, balanced
//! delimiters, no unrendered template syntax). Readbacks resolve after a
//! configurable number of polls to model fence latency.

use glam::{Mat4, Vec2, Vec3, Vec4};
use half::f16;
use rustc_hash::FxHashMap;

use super::raster::{self, ClipVertex, Fragment, RasterState, RasterTarget};
use super::{
    Attachment, BufferId, BufferKind, ClearRequest, CullMode, DeviceStats, DrawCall, FramebufferDesc, FramebufferId,
    FrontFace, GpuDevice, IndexFormat, ProgramId, ProgramKind, ProgramSource, ReadTarget, ReadbackSource,
    ReadbackStatus, Rect, TextureDesc, TextureId, UniformData,
};
use crate::renderer::context::LIGHTS_BLOCK_SLOT;
use crate::renderer::settings::DeviceCapabilities;
use crate::resources::attribute::{AttributeFormat, ComponentType};
use crate::resources::material::{BlendState, CompareFunction};
use crate::resources::texture::{FilterMode, TextureFormat, TextureSampler, WrapMode};

// ============================================================================
// Storage
// ============================================================================

/// A 2D array of texels. Depth planes keep depth in `.x`.
#[derive(Debug, Clone)]
struct Plane {
    width: u32,
    height: u32,
    format: TextureFormat,
    texels: Vec<Vec4>,
}

impl Plane {
    fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        let fill = if format.is_depth() { Vec4::ONE } else { Vec4::ZERO };
        Self {
            width,
            height,
            format,
            texels: vec![fill; width as usize * height as usize],
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        *self = Self::new(width, height, self.format);
    }

    fn texel(&self, x: i64, y: i64) -> Vec4 {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return Vec4::ZERO;
        }
        self.texels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
            .unwrap_or(Vec4::ZERO)
    }

    fn sample(&self, uv: Vec2, sampler: &TextureSampler) -> Vec4 {
        if self.width == 0 || self.height == 0 || self.texels.is_empty() {
            return Vec4::ZERO;
        }
        let u = wrap(uv.x, sampler.wrap_s);
        let v = wrap(uv.y, sampler.wrap_t);
        let (w, h) = (self.width as f32, self.height as f32);
        let clamp_x = |x: i64| x.clamp(0, i64::from(self.width) - 1);
        let clamp_y = |y: i64| y.clamp(0, i64::from(self.height) - 1);

        match sampler.mag_filter {
            FilterMode::Nearest => self.texel(clamp_x((u * w) as i64), clamp_y((v * h) as i64)),
            FilterMode::Linear => {
                let x = u * w - 0.5;
                let y = v * h - 0.5;
                let (x0, y0) = (x.floor(), y.floor());
                let (fx, fy) = (x - x0, y - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let t00 = self.texel(clamp_x(x0), clamp_y(y0));
                let t10 = self.texel(clamp_x(x0 + 1), clamp_y(y0));
                let t01 = self.texel(clamp_x(x0), clamp_y(y0 + 1));
                let t11 = self.texel(clamp_x(x0 + 1), clamp_y(y0 + 1));
                t00.lerp(t10, fx).lerp(t01.lerp(t11, fx), fy)
            }
        }
    }
}

fn wrap(t: f32, mode: WrapMode) -> f32 {
    match mode {
        WrapMode::ClampToEdge => t.clamp(0.0, 1.0),
        WrapMode::Repeat => t - t.floor(),
        WrapMode::MirroredRepeat => {
            let period = t.rem_euclid(2.0);
            if period > 1.0 { 2.0 - period } else { period }
        }
    }
}

#[derive(Debug, Clone)]
struct HeadlessTexture {
    plane: Plane,
    bytes: Vec<u8>,
    sampler: TextureSampler,
    mip_levels: u32,
}

#[derive(Debug, Clone)]
enum FbAttachment {
    Texture(TextureId),
    Storage(Plane),
}

#[derive(Debug, Clone)]
struct HeadlessFramebuffer {
    width: u32,
    height: u32,
    samples: u32,
    color: Option<FbAttachment>,
    depth: Option<FbAttachment>,
}

#[derive(Debug, Clone)]
struct HeadlessProgram {
    kind: ProgramKind,
    uniforms: FxHashMap<String, UniformData>,
}

#[derive(Debug, Clone)]
struct HeadlessBuffer {
    kind: BufferKind,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Color,
    Depth,
}

// ============================================================================
// Readback
// ============================================================================

struct HeadlessReadback {
    polls_left: u32,
    result: Option<Result<Vec<u8>, String>>,
}

impl ReadbackSource for HeadlessReadback {
    fn poll(&mut self) -> ReadbackStatus {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return ReadbackStatus::Pending;
        }
        match self.result.take() {
            Some(Ok(bytes)) => ReadbackStatus::Ready(bytes),
            Some(Err(message)) => ReadbackStatus::Failed(message),
            None => ReadbackStatus::Failed("readback already consumed".to_owned()),
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// Software device for tests, benches and tooling.
///
/// ```rust,ignore
/// let device = HeadlessDevice::new(64, 64).with_readback_latency(2);
/// let mut renderer = Renderer::new(device, RendererSettings::default());
/// ```
pub struct HeadlessDevice {
    capabilities: DeviceCapabilities,
    stats: DeviceStats,
    readback_latency: u32,
    next_id: u32,

    display: HeadlessFramebuffer,
    programs: FxHashMap<u32, HeadlessProgram>,
    buffers: FxHashMap<u32, HeadlessBuffer>,
    textures: FxHashMap<u32, HeadlessTexture>,
    framebuffers: FxHashMap<u32, HeadlessFramebuffer>,

    current_program: Option<ProgramId>,
    texture_units: Vec<Option<TextureId>>,
    uniform_slots: FxHashMap<u32, BufferId>,
    bound_framebuffer: Option<FramebufferId>,
    raster: RasterState,
    stencil_test: bool,
    clip_planes: u32,
}

impl HeadlessDevice {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capabilities(width, height, DeviceCapabilities::default())
    }

    #[must_use]
    pub fn with_capabilities(width: u32, height: u32, capabilities: DeviceCapabilities) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        let units = capabilities.max_texture_units as usize;
        Self {
            capabilities,
            stats: DeviceStats::default(),
            readback_latency: 0,
            next_id: 1,
            display: HeadlessFramebuffer {
                width,
                height,
                samples: 1,
                color: Some(FbAttachment::Storage(Plane::new(width, height, TextureFormat::Rgba8Unorm))),
                depth: Some(FbAttachment::Storage(Plane::new(width, height, TextureFormat::Depth24Plus))),
            },
            programs: FxHashMap::default(),
            buffers: FxHashMap::default(),
            textures: FxHashMap::default(),
            framebuffers: FxHashMap::default(),
            current_program: None,
            texture_units: vec![None; units],
            uniform_slots: FxHashMap::default(),
            bound_framebuffer: None,
            raster: RasterState {
                viewport: Rect::from_size(width, height),
                ..Default::default()
            },
            stencil_test: false,
            clip_planes: 0,
        }
    }

    /// Number of `poll` calls a readback stays pending.
    #[must_use]
    pub fn with_readback_latency(mut self, polls: u32) -> Self {
        self.readback_latency = polls;
        self
    }

    /// Resizes the display surface, clearing it.
    pub fn resize(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        self.display.width = width;
        self.display.height = height;
        for attachment in [&mut self.display.color, &mut self.display.depth].into_iter().flatten() {
            if let FbAttachment::Storage(plane) = attachment {
                plane.resize(width, height);
            }
        }
    }

    /// Linear color of a display pixel as last written.
    #[must_use]
    pub fn display_pixel(&self, x: u32, y: u32) -> Vec4 {
        match &self.display.color {
            Some(FbAttachment::Storage(plane)) => plane.texel(i64::from(x), i64::from(y)),
            _ => Vec4::ZERO,
        }
    }

    #[must_use]
    pub fn display_depth(&self, x: u32, y: u32) -> f32 {
        match &self.display.depth {
            Some(FbAttachment::Storage(plane)) => plane.texel(i64::from(x), i64::from(y)).x,
            _ => 1.0,
        }
    }

    #[must_use]
    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    #[must_use]
    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|t| (t.plane.width, t.plane.height))
    }

    #[must_use]
    pub fn texture_mip_levels(&self, texture: TextureId) -> Option<u32> {
        self.textures.get(&texture.0).map(|t| t.mip_levels)
    }

    #[must_use]
    pub fn framebuffer_samples(&self, framebuffer: FramebufferId) -> Option<u32> {
        self.framebuffers.get(&framebuffer.0).map(|f| f.samples)
    }

    /// Texture attached as color, if any.
    #[must_use]
    pub fn framebuffer_color_texture(&self, framebuffer: FramebufferId) -> Option<TextureId> {
        match self.framebuffers.get(&framebuffer.0)?.color {
            Some(FbAttachment::Texture(id)) => Some(id),
            _ => None,
        }
    }

    /// Decoded texel of a texture's base level.
    #[must_use]
    pub fn texel(&self, texture: TextureId, x: u32, y: u32) -> Option<Vec4> {
        self.textures
            .get(&texture.0)
            .map(|t| t.plane.texel(i64::from(x), i64::from(y)))
    }

    #[must_use]
    pub fn stencil_test_enabled(&self) -> bool {
        self.stencil_test
    }

    #[must_use]
    pub fn bound_uniform_buffer(&self, slot: u32) -> Option<BufferId> {
        self.uniform_slots.get(&slot).copied()
    }

    /// Last value set for a uniform on a program.
    #[must_use]
    pub fn uniform(&self, program: ProgramId, name: &str) -> Option<&UniformData> {
        self.programs.get(&program.0)?.uniforms.get(name)
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn framebuffer(&self, framebuffer: Option<FramebufferId>) -> Option<&HeadlessFramebuffer> {
        match framebuffer {
            None => Some(&self.display),
            Some(id) => self.framebuffers.get(&id.0),
        }
    }

    fn plane(&self, framebuffer: Option<FramebufferId>, slot: Slot) -> Option<&Plane> {
        let fb = self.framebuffer(framebuffer)?;
        let attachment = match slot {
            Slot::Color => fb.color.as_ref(),
            Slot::Depth => fb.depth.as_ref(),
        }?;
        match attachment {
            FbAttachment::Storage(plane) => Some(plane),
            FbAttachment::Texture(id) => self.textures.get(&id.0).map(|t| &t.plane),
        }
    }

    fn plane_mut(&mut self, framebuffer: Option<FramebufferId>, slot: Slot) -> Option<&mut Plane> {
        let fb = match framebuffer {
            None => &mut self.display,
            Some(id) => self.framebuffers.get_mut(&id.0)?,
        };
        let attachment = match slot {
            Slot::Color => fb.color.as_mut(),
            Slot::Depth => fb.depth.as_mut(),
        }?;
        match attachment {
            FbAttachment::Storage(plane) => Some(plane),
            FbAttachment::Texture(id) => self.textures.get_mut(&id.0).map(|t| &mut t.plane),
        }
    }

    fn target_size(&self) -> (u32, u32) {
        self.framebuffer(self.bound_framebuffer)
            .map_or((0, 0), |fb| (fb.width, fb.height))
    }

    fn bound_sampler(&self, program: &HeadlessProgram, name: &str) -> Option<&HeadlessTexture> {
        let unit = program.uniforms.get(name)?.as_sampler()?;
        let texture = (*self.texture_units.get(unit as usize)?)?;
        self.textures.get(&texture.0)
    }

    /// Directional and spot shadow maps `program` samples, paired with their
    /// entries in the bound lights block.
    fn receiver_shadows(&self, program: &HeadlessProgram) -> Vec<ShadowReceiver> {
        let declared = |prefix: &str| (0..).take_while(|i| program.uniforms.contains_key(&format!("{prefix}{i}"))).count();
        let (directional, spot) = (declared("directionalShadowMap"), declared("spotShadowMap"));
        if directional + spot == 0 {
            return Vec::new();
        }
        let Some(block) = self
            .uniform_slots
            .get(&LIGHTS_BLOCK_SLOT)
            .and_then(|b| self.buffers.get(&b.0))
        else {
            return Vec::new();
        };
        let words: Vec<[u8; 4]> = block.data.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]).collect();
        let count = |i: usize| words.get(4 + i).map_or(0, |w| u32::from_le_bytes(*w) as usize);
        let float = |i: usize| words.get(i).map_or(0.0, |w| f32::from_le_bytes(*w));

        // Header, then hemisphere, directional, point and spot entries.
        let lights_end = 8 + count(0) * 12 + count(1) * 8 + count(2) * 8 + count(3) * 16;
        let entry = |index: usize| {
            let base = lights_end + index * SHADOW_ENTRY_FLOATS;
            let cols: [f32; 16] = std::array::from_fn(|c| float(base + c));
            (Mat4::from_cols_array(&cols), float(base + 16))
        };

        // The block stores directional shadows before spot ones.
        let maps = (0..directional)
            .map(|i| (format!("directionalShadowMap{i}"), i))
            .chain((0..spot).map(|i| (format!("spotShadowMap{i}"), directional + i)));
        maps.filter_map(|(name, index)| {
            let texture = self.bound_sampler(program, &name)?;
            let (matrix, bias) = entry(index);
            Some(ShadowReceiver {
                matrix,
                bias,
                plane: texture.plane.clone(),
            })
        })
        .collect()
    }

    fn read_attribute(&self, binding: &super::VertexBinding, element: usize) -> Option<Vec<f32>> {
        let buffer = self.buffers.get(&binding.buffer.0)?;
        let format = binding.format;
        let size = format.component.size();
        let base = element * format.item_size as usize;
        (0..format.item_size as usize)
            .map(|c| decode_component(&buffer.data, (base + c) * size, format))
            .collect()
    }

    fn read_index(&self, call: &DrawCall, element: u32) -> Option<u32> {
        let Some(index) = &call.index else {
            return Some(element);
        };
        let data = &self.buffers.get(&index.buffer.0)?.data;
        let e = element as usize;
        match index.format {
            IndexFormat::U16 => data
                .get(e * 2..e * 2 + 2)
                .map(|b| u32::from(u16::from_le_bytes([b[0], b[1]]))),
            IndexFormat::U32 => data
                .get(e * 4..e * 4 + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        }
    }

    /// Runs the vertex stage for one vertex.
    fn vertex(&self, call: &DrawCall, model: &Mat4, view_projection: &Mat4, vertex: u32) -> Option<ClipVertex> {
        let mut position = Vec3::ZERO;
        let mut uv = Vec2::ZERO;
        let mut color = Vec4::ONE;
        let mut found_position = false;

        for binding in call.vertices.iter().filter(|b| !b.per_instance) {
            let values = self.read_attribute(binding, vertex as usize)?;
            let get = |i: usize, default: f32| values.get(i).copied().unwrap_or(default);
            match binding.name.as_str() {
                "position" => {
                    position = Vec3::new(get(0, 0.0), get(1, 0.0), get(2, 0.0));
                    found_position = true;
                }
                "uv" => uv = Vec2::new(get(0, 0.0), get(1, 0.0)),
                "color" => color = Vec4::new(get(0, 1.0), get(1, 1.0), get(2, 1.0), get(3, 1.0)),
                _ => {}
            }
        }
        if !found_position {
            return None;
        }

        let world = model.transform_point3(position);
        Some(ClipVertex {
            clip: *view_projection * world.extend(1.0),
            world,
            uv,
            color,
        })
    }

    fn draw_fullscreen(&mut self, program: &HeadlessProgram) {
        let (width, height) = self.target_size();
        let corner = |x: f32, y: f32, u: f32, v: f32| ClipVertex {
            clip: Vec4::new(x, y, 0.0, 1.0),
            world: Vec3::ZERO,
            uv: Vec2::new(u, v),
            color: Vec4::ONE,
        };
        let triangle = [corner(-1.0, -1.0, 0.0, 1.0), corner(3.0, -1.0, 2.0, 1.0), corner(-1.0, 3.0, 0.0, -1.0)];

        let source = self.bound_sampler(program, "source").cloned();
        let fallback = uniform_vec3(program, "diffuse", Vec3::ZERO).extend(uniform_f32(program, "opacity", 1.0));
        let tone_mapping = uniform_u32(program, "toneMapping", 0);
        let exposure = uniform_f32(program, "toneMappingExposure", 1.0);
        let srgb = uniform_u32(program, "outputEncoding", 0) == 1;

        let mut shade = |f: &Fragment| {
            let c = match &source {
                Some(t) => t.plane.sample(f.uv, &t.sampler),
                None => fallback,
            };
            let mapped = tone_map(c.truncate(), tone_mapping, exposure);
            let encoded = if srgb { mapped.map(linear_to_srgb) } else { mapped };
            Some(encoded.extend(c.w))
        };
        self.rasterize(width, height, &[triangle], &mut shade);
    }

    fn draw_mesh(&mut self, call: &DrawCall, program: &HeadlessProgram) {
        let (width, height) = self.target_size();
        let model = uniform_mat4(program, "modelMatrix");
        let view = uniform_mat4(program, "viewMatrix");
        let projection = uniform_mat4(program, "projectionMatrix");
        let view_projection = projection * view;

        let instance_binding = call.vertices.iter().find(|b| b.per_instance && b.name == "instanceMatrix");
        let instances = call.instances.max(1);

        let mut triangles = Vec::new();
        for instance in 0..instances {
            let instance_matrix = instance_binding
                .and_then(|b| self.read_attribute(b, instance as usize))
                .filter(|m| m.len() >= 16)
                .map_or(Mat4::IDENTITY, |m| Mat4::from_cols_slice(&m[..16]));
            let model = model * instance_matrix;

            let mut element = call.range.start;
            while element + 3 <= call.range.end {
                let tri = [element, element + 1, element + 2].map(|e| {
                    self.read_index(call, e)
                        .and_then(|v| self.vertex(call, &model, &view_projection, v))
                });
                if let [Some(a), Some(b), Some(c)] = tri {
                    triangles.push([a, b, c]);
                }
                element += 3;
            }
        }

        let ctx = FragmentContext::new(self, program, view, width, height);
        let kind = program.kind;
        let mut shade = |f: &Fragment| ctx.shade(kind, f);
        self.rasterize(width, height, &triangles, &mut shade);
    }

    fn rasterize(
        &mut self,
        width: u32,
        height: u32,
        triangles: &[[ClipVertex; 3]],
        shade: &mut dyn FnMut(&Fragment) -> Option<Vec4>,
    ) {
        let fb = self.bound_framebuffer;
        let mut color = self.plane_mut(fb, Slot::Color).map(|p| std::mem::take(&mut p.texels));
        let mut depth = self.plane_mut(fb, Slot::Depth).map(|p| std::mem::take(&mut p.texels));
        let expected = width as usize * height as usize;

        {
            let mut target = RasterTarget {
                width,
                height,
                color: color.as_deref_mut().filter(|c| c.len() == expected),
                depth: depth.as_deref_mut().filter(|d| d.len() == expected),
            };
            for triangle in triangles {
                raster::draw_triangle(&mut target, &self.raster, *triangle, shade);
            }
        }

        if let (Some(texels), Some(plane)) = (color, self.plane_mut(fb, Slot::Color)) {
            plane.texels = texels;
        }
        if let (Some(texels), Some(plane)) = (depth, self.plane_mut(fb, Slot::Depth)) {
            plane.texels = texels;
        }
    }
}

/// Floats per `LightShadow` entry: matrix, params and range.
const SHADOW_ENTRY_FLOATS: usize = 24;

/// A depth map a receiver samples.
struct ShadowReceiver {
    /// World to map space: xy texture coordinates and z depth after the
    /// perspective divide.
    matrix: Mat4,
    bias: f32,
    plane: Plane,
}

impl ShadowReceiver {
    /// 1 when `world` is lit or outside the map, 0 when occluded.
    fn visibility(&self, world: Vec3) -> f32 {
        let clip = self.matrix * world.extend(1.0);
        if clip.w <= 0.0 {
            return 1.0;
        }
        let p = clip.truncate() / clip.w;
        if !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y) || p.z > 1.0 {
            return 1.0;
        }
        let (w, h) = (self.plane.width, self.plane.height);
        let x = ((p.x * w as f32) as i64).min(i64::from(w) - 1);
        let y = ((p.y * h as f32) as i64).min(i64::from(h) - 1);
        let stored = self.plane.texel(x, y).x;
        if p.z - self.bias <= stored { 1.0 } else { 0.0 }
    }
}

/// Uniform snapshot for the mesh fragment stage.
struct FragmentContext {
    diffuse: Vec3,
    opacity: f32,
    alpha_test: f32,
    premultiplied: bool,
    map: Option<HeadlessTexture>,
    transmission: f32,
    transmission_source: Option<HeadlessTexture>,
    clip_planes: Vec<Vec4>,
    clip_intersection: bool,
    fog: Option<(u32, Vec3, f32, f32, f32)>,
    shadows: Vec<ShadowReceiver>,
    view: Mat4,
    width: f32,
    height: f32,
}

impl FragmentContext {
    fn new(device: &HeadlessDevice, program: &HeadlessProgram, view: Mat4, width: u32, height: u32) -> Self {
        let clip_count = device.clip_planes as usize;
        let clip_planes = program
            .uniforms
            .get("clippingPlanes")
            .and_then(UniformData::as_vec4_array)
            .map(|planes| planes.iter().take(clip_count).copied().collect())
            .unwrap_or_default();
        let fog_kind = uniform_u32(program, "fogKind", 0);
        Self {
            diffuse: uniform_vec3(program, "diffuse", Vec3::ONE),
            opacity: uniform_f32(program, "opacity", 1.0),
            alpha_test: uniform_f32(program, "alphaTest", 0.0),
            premultiplied: uniform_u32(program, "premultipliedAlpha", 0) == 1,
            map: device.bound_sampler(program, "map").cloned(),
            transmission: uniform_f32(program, "transmission", 0.0),
            transmission_source: device.bound_sampler(program, "transmissionSamplerMap").cloned(),
            clip_planes,
            clip_intersection: uniform_u32(program, "clipIntersection", 0) == 1,
            fog: (fog_kind != 0).then(|| {
                (
                    fog_kind,
                    uniform_vec3(program, "fogColor", Vec3::ONE),
                    uniform_f32(program, "fogNear", 1.0),
                    uniform_f32(program, "fogFar", 1000.0),
                    uniform_f32(program, "fogDensity", 0.00025),
                )
            }),
            shadows: device.receiver_shadows(program),
            view,
            width: width.max(1) as f32,
            height: height.max(1) as f32,
        }
    }

    fn clipped(&self, world: Vec3) -> bool {
        if self.clip_planes.is_empty() {
            return false;
        }
        let mut outside = self
            .clip_planes
            .iter()
            .map(|p| p.truncate().dot(world) + p.w < 0.0);
        if self.clip_intersection {
            outside.all(|o| o)
        } else {
            outside.any(|o| o)
        }
    }

    fn shade(&self, kind: ProgramKind, f: &Fragment) -> Option<Vec4> {
        if self.clipped(f.world) {
            return None;
        }

        let mut alpha = self.opacity;
        let mut rgb = self.diffuse * f.color.truncate();
        alpha *= f.color.w;
        if let Some(map) = &self.map {
            let texel = map.plane.sample(f.uv, &map.sampler);
            rgb *= texel.truncate();
            alpha *= texel.w;
        }
        if self.alpha_test > 0.0 && alpha < self.alpha_test {
            return None;
        }

        if kind == ProgramKind::Depth {
            return Some(Vec4::new(f.depth, f.depth, f.depth, 1.0));
        }

        if self.transmission > 0.0
            && let Some(source) = &self.transmission_source
        {
            let screen = Vec2::new((f.x as f32 + 0.5) / self.width, (f.y as f32 + 0.5) / self.height);
            let behind = source.plane.sample(screen, &source.sampler);
            rgb = rgb.lerp(behind.truncate(), self.transmission);
        }

        if !self.shadows.is_empty() {
            let lit: f32 = self.shadows.iter().map(|s| s.visibility(f.world)).sum();
            rgb *= lit / self.shadows.len() as f32;
        }

        if let Some((kind, color, near, far, density)) = self.fog {
            let distance = -self.view.transform_point3(f.world).z;
            let factor = if kind == 1 {
                smoothstep(near, far, distance)
            } else {
                1.0 - (-density * density * distance * distance).exp()
            };
            rgb = rgb.lerp(color, factor.clamp(0.0, 1.0));
        }

        if self.premultiplied {
            rgb *= alpha;
        }
        Some(rgb.extend(alpha))
    }
}

impl GpuDevice for HeadlessDevice {
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

    fn create_program(&mut self, source: &ProgramSource) -> Result<ProgramId, String> {
        validate_program(&source.source).map_err(|log| format!("{}: {log}", source.label))?;
        let id = self.alloc_id();
        self.programs.insert(
            id,
            HeadlessProgram {
                kind: source.kind,
                uniforms: FxHashMap::default(),
            },
        );
        self.stats.programs_created += 1;
        Ok(ProgramId(id))
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program.0).is_some() {
            self.stats.programs_deleted += 1;
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
            p.uniforms.insert(name.to_owned(), value.clone());
            self.stats.uniform_uploads += 1;
        }
    }

    // ---- Buffers ----

    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> BufferId {
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            HeadlessBuffer {
                kind,
                data: data.to_vec(),
            },
        );
        self.stats.buffers_created += 1;
        self.stats.buffer_uploads += 1;
        BufferId(id)
    }

    fn update_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]) {
        let Some(b) = self.buffers.get_mut(&buffer.0) else {
            return;
        };
        let end = offset + data.len();
        if end > b.data.len() {
            log::error!("{:?} buffer write {offset}..{end} exceeds size {}", b.kind, b.data.len());
            return;
        }
        b.data[offset..end].copy_from_slice(data);
        if offset == 0 && end == b.data.len() {
            self.stats.buffer_uploads += 1;
        } else {
            self.stats.buffer_partial_uploads += 1;
        }
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
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
        let id = self.alloc_id();
        self.textures.insert(
            id,
            HeadlessTexture {
                plane: Plane::new(desc.width, desc.height, desc.format),
                bytes: vec![0; desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel()],
                sampler: TextureSampler::default(),
                mip_levels: desc.mip_levels.max(1),
            },
        );
        self.stats.textures_created += 1;
        TextureId(id)
    }

    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) {
        let Some(t) = self.textures.get_mut(&texture.0) else {
            return;
        };
        let len = t.bytes.len().min(data.len());
        t.bytes[..len].copy_from_slice(&data[..len]);
        let format = t.plane.format;
        let bpp = format.bytes_per_pixel();
        for (i, texel) in t.plane.texels.iter_mut().enumerate() {
            *texel = decode_texel(&t.bytes[i * bpp..(i + 1) * bpp], format);
        }
        self.stats.texture_uploads += 1;
    }

    fn upload_texture_region(&mut self, texture: TextureId, byte_offset: usize, data: &[u8]) {
        let Some(t) = self.textures.get_mut(&texture.0) else {
            return;
        };
        let end = byte_offset + data.len();
        if end > t.bytes.len() {
            log::error!("Texture region {byte_offset}..{end} exceeds size {}", t.bytes.len());
            return;
        }
        t.bytes[byte_offset..end].copy_from_slice(data);
        let format = t.plane.format;
        let bpp = format.bytes_per_pixel();
        for i in byte_offset / bpp..end.div_ceil(bpp) {
            if let Some(texel) = t.plane.texels.get_mut(i) {
                *texel = decode_texel(&t.bytes[i * bpp..(i + 1) * bpp], format);
            }
        }
        self.stats.texture_partial_uploads += 1;
    }

    fn set_texture_sampler(&mut self, texture: TextureId, sampler: &TextureSampler) {
        if let Some(t) = self.textures.get_mut(&texture.0) {
            t.sampler = *sampler;
        }
    }

    fn resize_texture(&mut self, texture: TextureId, width: u32, height: u32) {
        if let Some(t) = self.textures.get_mut(&texture.0) {
            t.plane.resize(width, height);
            t.bytes = vec![0; width as usize * height as usize * t.plane.format.bytes_per_pixel()];
            self.stats.texture_resizes += 1;
        }
    }

    fn generate_mipmaps(&mut self, texture: TextureId) {
        if self.textures.contains_key(&texture.0) {
            self.stats.mipmap_generations += 1;
        }
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
        let attach = |a: Option<Attachment>| {
            a.map(|a| match a {
                Attachment::Texture(id) => FbAttachment::Texture(id),
                Attachment::Storage(format) => FbAttachment::Storage(Plane::new(desc.width, desc.height, format)),
            })
        };
        let fb = HeadlessFramebuffer {
            width: desc.width,
            height: desc.height,
            samples: desc.samples.max(1),
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
        for attachment in [&mut fb.color, &mut fb.depth].into_iter().flatten() {
            if let FbAttachment::Storage(plane) = attachment {
                plane.resize(width, height);
            }
        }
        self.stats.framebuffer_resizes += 1;
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.bound_framebuffer = framebuffer;
        self.stats.framebuffer_binds += 1;
    }

    fn blit_framebuffer(&mut self, src: FramebufferId, dst: Option<FramebufferId>, color: bool, depth: bool) {
        let slots = [(color, Slot::Color), (depth, Slot::Depth)];
        for (_, slot) in slots.into_iter().filter(|(enabled, _)| *enabled) {
            let Some(source) = self.plane(Some(src), slot).cloned() else {
                continue;
            };
            let Some(target) = self.plane_mut(dst, slot) else {
                continue;
            };
            for y in 0..target.height {
                for x in 0..target.width {
                    let sx = u64::from(x) * u64::from(source.width) / u64::from(target.width.max(1));
                    let sy = u64::from(y) * u64::from(source.height) / u64::from(target.height.max(1));
                    let i = (y * target.width + x) as usize;
                    target.texels[i] = source.texel(sx as i64, sy as i64);
                }
            }
        }
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
        self.raster.depth_test = enabled;
        self.stats.state_changes += 1;
    }

    fn set_depth_func(&mut self, func: CompareFunction) {
        self.raster.depth_func = func;
        self.stats.state_changes += 1;
    }

    fn set_depth_write(&mut self, enabled: bool) {
        self.raster.depth_write = enabled;
        self.stats.state_changes += 1;
    }

    fn set_blend(&mut self, blend: Option<BlendState>) {
        self.raster.blend = blend;
        self.stats.state_changes += 1;
    }

    fn set_cull_mode(&mut self, mode: CullMode) {
        self.raster.cull = mode;
        self.stats.state_changes += 1;
    }

    fn set_front_face(&mut self, face: FrontFace) {
        self.raster.front_face = face;
        self.stats.state_changes += 1;
    }

    fn set_polygon_offset(&mut self, offset: Option<(f32, f32)>) {
        self.raster.polygon_offset = offset;
        self.stats.state_changes += 1;
    }

    fn set_color_mask(&mut self, enabled: bool) {
        self.raster.color_write = enabled;
        self.stats.state_changes += 1;
    }

    fn set_stencil_test(&mut self, enabled: bool) {
        self.stencil_test = enabled;
        self.stats.state_changes += 1;
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.raster.viewport = rect;
        self.stats.state_changes += 1;
    }

    fn set_scissor(&mut self, rect: Option<Rect>) {
        self.raster.scissor = rect;
        self.stats.state_changes += 1;
    }

    fn set_clip_planes(&mut self, count: u32) {
        self.clip_planes = count;
        self.stats.state_changes += 1;
    }

    // ---- Commands ----

    fn clear(&mut self, request: &ClearRequest) {
        let fb = self.bound_framebuffer;
        let scissor = self.raster.scissor;
        let fill = |plane: &mut Plane, value: Vec4| {
            let region = scissor.unwrap_or(Rect::from_size(plane.width, plane.height));
            for y in region.y..(region.y + region.height).min(plane.height) {
                for x in region.x..(region.x + region.width).min(plane.width) {
                    plane.texels[(y * plane.width + x) as usize] = value;
                }
            }
        };
        if let Some(color) = request.color
            && let Some(plane) = self.plane_mut(fb, Slot::Color)
        {
            fill(plane, color);
        }
        if let Some(depth) = request.depth
            && let Some(plane) = self.plane_mut(fb, Slot::Depth)
        {
            fill(plane, Vec4::splat(depth));
        }
        self.stats.clears += 1;
    }

    fn draw(&mut self, call: &DrawCall) {
        let Some(program) = self.current_program.and_then(|p| self.programs.get(&p.0)).cloned() else {
            log::warn!("draw() without a program bound");
            return;
        };
        self.stats.draw_calls += 1;
        self.stats.triangles += u64::from(call.range.len() as u32 / 3) * u64::from(call.instances.max(1));

        match program.kind {
            ProgramKind::Fullscreen => self.draw_fullscreen(&program),
            ProgramKind::Mesh | ProgramKind::Depth => self.draw_mesh(call, &program),
        }
    }

    fn read_pixels(&mut self, framebuffer: Option<FramebufferId>, rect: Rect, target: ReadTarget) -> Box<dyn ReadbackSource> {
        self.stats.readbacks += 1;
        let slot = match target {
            ReadTarget::Color => Slot::Color,
            ReadTarget::Depth => Slot::Depth,
        };
        let result = match self.plane(framebuffer, slot) {
            None => Err(format!("framebuffer has no {slot:?} attachment")),
            Some(plane) if rect.x + rect.width > plane.width || rect.y + rect.height > plane.height => Err(format!(
                "rect {rect:?} exceeds attachment size {}x{}",
                plane.width, plane.height
            )),
            Some(plane) => {
                let mut bytes = Vec::new();
                for y in rect.y..rect.y + rect.height {
                    for x in rect.x..rect.x + rect.width {
                        let texel = plane.texel(i64::from(x), i64::from(y));
                        match target {
                            ReadTarget::Depth => bytes.extend_from_slice(&texel.x.to_le_bytes()),
                            ReadTarget::Color => encode_texel(texel, plane.format, &mut bytes),
                        }
                    }
                }
                Ok(bytes)
            }
        };
        Box::new(HeadlessReadback {
            polls_left: self.readback_latency,
            result: Some(result),
        })
    }
}

// ============================================================================
// Program validation
// ============================================================================

pub(super) fn validate_program(source: &str) -> Result<(), String> {
    for entry in ["vs_main", "fs_main"] {
        if !source.contains(&format!("fn {entry}")) {
            return Err(format!("error: entry point '{entry}' not found"));
        }
    }
    for leftover in ["{{", "{$", "$}"] {
        if let Some(line) = source.lines().position(|l| l.contains(leftover)) {
            return Err(format!("error: unexpected '{leftover}' at line {}", line + 1));
        }
    }
    for (open, close) in [('{', '}'), ('(', ')'), ('[', ']')] {
        let mut depth = 0_i64;
        for (line_no, line) in source.lines().enumerate() {
            for c in line.chars() {
                if c == open {
                    depth += 1;
                } else if c == close {
                    depth -= 1;
                    if depth < 0 {
                        return Err(format!("error: unmatched '{close}' at line {}", line_no + 1));
                    }
                }
            }
        }
        if depth != 0 {
            return Err(format!("error: expected '{close}' before end of source"));
        }
    }
    Ok(())
}

// ============================================================================
// Texel codecs
// ============================================================================

fn decode_component(data: &[u8], offset: usize, format: AttributeFormat) -> Option<f32> {
    let size = format.component.size();
    let bytes = data.get(offset..offset + size)?;
    let value = match format.component {
        ComponentType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        ComponentType::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
        ComponentType::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
        ComponentType::U16 => {
            let v = f32::from(u16::from_le_bytes([bytes[0], bytes[1]]));
            if format.normalized { v / 65535.0 } else { v }
        }
        ComponentType::I16 => {
            let v = f32::from(i16::from_le_bytes([bytes[0], bytes[1]]));
            if format.normalized { (v / 32767.0).max(-1.0) } else { v }
        }
        ComponentType::U8 => {
            let v = f32::from(bytes[0]);
            if format.normalized { v / 255.0 } else { v }
        }
        ComponentType::I8 => {
            let v = f32::from(bytes[0] as i8);
            if format.normalized { (v / 127.0).max(-1.0) } else { v }
        }
    };
    Some(value)
}

fn decode_texel(bytes: &[u8], format: TextureFormat) -> Vec4 {
    let unorm = |b: u8| f32::from(b) / 255.0;
    let f32_at = |i: usize| f32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    match format {
        TextureFormat::R8Unorm => Vec4::new(unorm(bytes[0]), 0.0, 0.0, 1.0),
        TextureFormat::Rg8Unorm => Vec4::new(unorm(bytes[0]), unorm(bytes[1]), 0.0, 1.0),
        TextureFormat::Rgba8Unorm => Vec4::new(unorm(bytes[0]), unorm(bytes[1]), unorm(bytes[2]), unorm(bytes[3])),
        TextureFormat::Rgba8UnormSrgb => Vec4::new(
            srgb_to_linear(unorm(bytes[0])),
            srgb_to_linear(unorm(bytes[1])),
            srgb_to_linear(unorm(bytes[2])),
            unorm(bytes[3]),
        ),
        TextureFormat::Rgba16Float => {
            let h = |i: usize| f16::from_le_bytes([bytes[i], bytes[i + 1]]).to_f32();
            Vec4::new(h(0), h(2), h(4), h(6))
        }
        TextureFormat::Rgba32Float => Vec4::new(f32_at(0), f32_at(4), f32_at(8), f32_at(12)),
        TextureFormat::Depth16Unorm => Vec4::splat(f32::from(u16::from_le_bytes([bytes[0], bytes[1]])) / 65535.0),
        TextureFormat::Depth24Plus | TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8 => {
            Vec4::splat(f32_at(0))
        }
    }
}

fn encode_texel(texel: Vec4, format: TextureFormat, out: &mut Vec<u8>) {
    let unorm = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        TextureFormat::R8Unorm => out.push(unorm(texel.x)),
        TextureFormat::Rg8Unorm => out.extend([unorm(texel.x), unorm(texel.y)]),
        TextureFormat::Rgba8Unorm => out.extend(texel.to_array().map(unorm)),
        TextureFormat::Rgba8UnormSrgb => out.extend([
            unorm(linear_to_srgb(texel.x)),
            unorm(linear_to_srgb(texel.y)),
            unorm(linear_to_srgb(texel.z)),
            unorm(texel.w),
        ]),
        TextureFormat::Rgba16Float => {
            for c in texel.to_array() {
                out.extend_from_slice(&f16::from_f32(c).to_le_bytes());
            }
        }
        TextureFormat::Rgba32Float => out.extend_from_slice(bytemuck::cast_slice(&texel.to_array())),
        TextureFormat::Depth16Unorm => {
            out.extend_from_slice(&((texel.x.clamp(0.0, 1.0) * 65535.0).round() as u16).to_le_bytes());
        }
        TextureFormat::Depth24Plus | TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8 => {
            out.extend_from_slice(&texel.x.to_le_bytes());
        }
    }
}

pub(crate) fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 { c / 12.92 } else { ((c + 0.055) / 1.055).powf(2.4) }
}

pub(crate) fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 { c * 12.92 } else { 1.055 * c.powf(1.0 / 2.4) - 0.055 }
}

fn tone_map(c: Vec3, operator: u32, exposure: f32) -> Vec3 {
    let x = c * exposure;
    match operator {
        1 => x.clamp(Vec3::ZERO, Vec3::ONE),
        2 => (x / (Vec3::ONE + x)).clamp(Vec3::ZERO, Vec3::ONE),
        3 => {
            let num = x * (x * 2.51 + Vec3::splat(0.03));
            let den = x * (x * 2.43 + Vec3::splat(0.59)) + Vec3::splat(0.14);
            (num / den).clamp(Vec3::ZERO, Vec3::ONE)
        }
        _ => c,
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0).max(f32::EPSILON)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn uniform_mat4(program: &HeadlessProgram, name: &str) -> Mat4 {
    program
        .uniforms
        .get(name)
        .and_then(UniformData::as_mat4)
        .unwrap_or(Mat4::IDENTITY)
}

fn uniform_f32(program: &HeadlessProgram, name: &str, default: f32) -> f32 {
    program
        .uniforms
        .get(name)
        .and_then(UniformData::as_f32)
        .unwrap_or(default)
}

fn uniform_u32(program: &HeadlessProgram, name: &str, default: u32) -> u32 {
    program
        .uniforms
        .get(name)
        .and_then(UniformData::as_u32)
        .unwrap_or(default)
}

fn uniform_vec3(program: &HeadlessProgram, name: &str, default: Vec3) -> Vec3 {
    program
        .uniforms
        .get(name)
        .and_then(UniformData::as_vec3)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULLSCREEN: &str = "fn vs_main() {}\nfn fs_main() {}\n";

    fn fullscreen_program(device: &mut HeadlessDevice) -> ProgramId {
        device
            .create_program(&ProgramSource {
                label: "fullscreen".into(),
                kind: ProgramKind::Fullscreen,
                source: FULLSCREEN.into(),
                uniforms: Vec::new(),
                samplers: Vec::new(),
            })
            .unwrap()
    }

    #[test]
    fn test_program_validation() {
        assert!(validate_program(FULLSCREEN).is_ok());
        assert!(validate_program("fn vs_main() {}").unwrap_err().contains("fs_main"));
        assert!(validate_program("fn vs_main() {}\nfn fs_main() {").is_err());
        assert!(validate_program("fn vs_main() {}\nfn fs_main() { {{ x }} }").is_err());
    }

    #[test]
    fn test_fullscreen_fill_and_readback_latency() {
        let mut device = HeadlessDevice::new(4, 4).with_readback_latency(2);
        let program = fullscreen_program(&mut device);
        device.use_program(program);
        device.set_uniform(program, "diffuse", &UniformData::Vec3(Vec3::new(1.0, 0.0, 0.0)));
        device.draw(&DrawCall {
            vertices: Vec::new(),
            index: None,
            range: 0..3,
            instances: 1,
        });

        let mut readback = device.read_pixels(None, Rect::new(1, 1, 1, 1), ReadTarget::Color);
        assert_eq!(readback.poll(), ReadbackStatus::Pending);
        assert_eq!(readback.poll(), ReadbackStatus::Pending);
        assert_eq!(readback.poll(), ReadbackStatus::Ready(vec![255, 0, 0, 255]));
    }

    #[test]
    fn test_shadow_receiver_compares_stored_depth() {
        let mut plane = Plane::new(2, 1, TextureFormat::Depth24Plus);
        plane.texels[0] = Vec4::splat(0.25);
        // Identity over x in [0, 1]: the left texel holds an occluder.
        let receiver = ShadowReceiver {
            matrix: Mat4::IDENTITY,
            bias: 0.01,
            plane,
        };
        assert_eq!(receiver.visibility(Vec3::new(0.2, 0.5, 0.5)), 0.0);
        assert_eq!(receiver.visibility(Vec3::new(0.2, 0.5, 0.2)), 1.0, "in front of the occluder");
        assert_eq!(receiver.visibility(Vec3::new(0.8, 0.5, 0.5)), 1.0, "cleared texel");
        assert_eq!(receiver.visibility(Vec3::new(1.5, 0.5, 0.5)), 1.0, "outside the map");
    }

    #[test]
    fn test_region_upload_decodes_touched_texels() {
        let mut device = HeadlessDevice::new(1, 1);
        let texture = device.create_texture(&TextureDesc {
            width: 2,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            mip_levels: 1,
        });
        device.upload_texture(texture, &[0; 8]);
        device.upload_texture_region(texture, 4, &[255, 255, 255, 255]);
        assert_eq!(device.texel(texture, 0, 0), Some(Vec4::ZERO));
        assert_eq!(device.texel(texture, 1, 0), Some(Vec4::ONE));
        assert_eq!(device.stats().texture_partial_uploads, 1);
    }

    #[test]
    fn test_out_of_bounds_readback_fails() {
        let mut device = HeadlessDevice::new(2, 2);
        let mut readback = device.read_pixels(None, Rect::new(0, 0, 4, 4), ReadTarget::Color);
        assert!(matches!(readback.poll(), ReadbackStatus::Failed(_)));
    }
}
