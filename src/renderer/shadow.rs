//! Shadow map pass
//!
//! Every shadow-casting light gets its own depth target from the
//! render-target cache, keyed by the light's node:
//!
//! | Light       | Camera                               | Target            |
//! |-------------|--------------------------------------|-------------------|
//! | directional | orthographic box from `LightShadow`  | `size × size`     |
//! | spot        | perspective, fov = 2·angle           | `size × size`     |
//! | point       | six 90° views in a 4×2 atlas         | `4·size × 2·size` |
//!
//! Casters are drawn with depth-only programs shared per
//! [`DepthVariant`]. The resulting [`ShadowUniform`] maps world space to
//! map texture coordinates and is what receivers read from the lights block.

use std::f32::consts::FRAC_PI_2;

use glam::{Affine3A, Mat4, Vec3, Vec4};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::assets::Assets;
use crate::math::Frustum;
use crate::renderer::cache::{TargetDesc, TargetKey};
use crate::renderer::context::{DrawInput, FrameEnvironment, RenderContext, ViewUniforms, object_features, set_matrix_uniforms};
use crate::renderer::device::{ClearRequest, FramebufferId, GpuDevice, ReadTarget, Rect, TextureId, UniformData};
use crate::renderer::lights::{LightsState, ShadowUniform};
use crate::renderer::programs::{DepthVariant, ObjectFeatures, ProgramOwner, ProgramParameters, SceneProgramKey};
use crate::renderer::readback::ReadbackFuture;
use crate::renderer::render_list::RenderItem;
use crate::renderer::settings::{RendererSettings, ShadowMapKind};
use crate::renderer::shader_generator::ClippingContext;
use crate::renderer::state::RenderState;
use crate::resources::material::{Material, Side};
use crate::resources::texture::{FilterMode, TextureFormat, TextureSampler};
use crate::scene::{Light, LightKind, NodeHandle, Scene};

/// Clip space to texture space: `u = x/2 + 1/2`, `v = 1/2 - y/2`.
const TEXTURE_BIAS: Mat4 = Mat4::from_cols_array(&[
    0.5, 0.0, 0.0, 0.0, //
    0.0, -0.5, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.5, 0.5, 0.0, 1.0,
]);

/// Point-light faces as (forward, up), atlas cell `i` at `(i % 4, i / 4)`.
const POINT_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::Y),
    (Vec3::NEG_X, Vec3::Y),
    (Vec3::Z, Vec3::Y),
    (Vec3::NEG_Z, Vec3::Y),
    (Vec3::Y, Vec3::NEG_Z),
    (Vec3::NEG_Y, Vec3::Z),
];

#[derive(Debug, Clone, Copy)]
struct ShadowView {
    view: Mat4,
    projection: Mat4,
    viewport: Rect,
}

/// Light cameras derived from a light and its world placement.
#[derive(Debug, Clone)]
struct ShadowCamera {
    width: u32,
    height: u32,
    views: SmallVec<[ShadowView; 6]>,
    matrix: Mat4,
    is_point: bool,
}

fn look_direction(position: Vec3, target: Vec3) -> (Vec3, Vec3) {
    let forward = (target - position).try_normalize().unwrap_or(Vec3::NEG_Y);
    let up = if forward.y.abs() > 0.99 { Vec3::X } else { Vec3::Y };
    (forward, up)
}

fn shadow_camera(light: &Light, world: &Affine3A, max_size: u32) -> Option<ShadowCamera> {
    let position = Vec3::from(world.translation);
    let shadow = &light.shadow;
    let size = shadow.map_size.clamp(1, max_size.max(1));
    let single = |view: Mat4, projection: Mat4| ShadowCamera {
        width: size,
        height: size,
        views: SmallVec::from_slice(&[ShadowView {
            view,
            projection,
            viewport: Rect::from_size(size, size),
        }]),
        matrix: TEXTURE_BIAS * projection * view,
        is_point: false,
    };

    match &light.kind {
        LightKind::Directional(d) => {
            let (forward, up) = look_direction(position, d.target);
            let view = Mat4::look_to_rh(position, forward, up);
            let projection = Mat4::orthographic_rh(
                shadow.camera_left,
                shadow.camera_right,
                shadow.camera_bottom,
                shadow.camera_top,
                shadow.near,
                shadow.far,
            );
            Some(single(view, projection))
        }
        LightKind::Spot(s) => {
            let (forward, up) = look_direction(position, s.target);
            let view = Mat4::look_to_rh(position, forward, up);
            let fov = (s.angle * 2.0).clamp(1e-3, std::f32::consts::PI - 1e-3);
            let projection = Mat4::perspective_rh(fov, 1.0, shadow.near, shadow.far);
            Some(single(view, projection))
        }
        LightKind::Point(_) => {
            let size = size.min(max_size / 4).max(1);
            let projection = Mat4::perspective_rh(FRAC_PI_2, 1.0, shadow.near, shadow.far);
            let views = POINT_FACES
                .iter()
                .enumerate()
                .map(|(i, &(forward, up))| ShadowView {
                    view: Mat4::look_to_rh(position, forward, up),
                    projection,
                    viewport: Rect::new((i as u32 % 4) * size, (i as u32 / 4) * size, size, size),
                })
                .collect();
            Some(ShadowCamera {
                width: size * 4,
                height: size * 2,
                views,
                matrix: Mat4::from_translation(-position),
                is_point: true,
            })
        }
        LightKind::Ambient | LightKind::Hemisphere(_) => None,
    }
}

/// Face of the point-light atlas a light-to-point direction falls on.
fn point_face(direction: Vec3) -> usize {
    let a = direction.abs();
    if a.x >= a.y && a.x >= a.z {
        if direction.x > 0.0 { 0 } else { 1 }
    } else if a.z >= a.y {
        if direction.z > 0.0 { 2 } else { 3 }
    } else if direction.y > 0.0 {
        4
    } else {
        5
    }
}

/// A rendered shadow map.
#[derive(Debug, Clone)]
pub struct LightShadowMap {
    pub node: NodeHandle,
    pub width: u32,
    pub height: u32,
    /// Texture receivers sample.
    pub texture: TextureId,
    pub framebuffer: FramebufferId,
    pub uniform: ShadowUniform,
    pub position: Vec3,
    camera: ShadowCamera,
}

/// Texel lookup prepared before the depth readback completes.
#[derive(Debug, Clone, Copy)]
struct ShadowLookup {
    x: f32,
    y: f32,
    depth: f32,
    bias: f32,
    cell: Rect,
    radius: f32,
}

impl ShadowLookup {
    fn visibility(&self, depths: &[f32], width: u32, pcf: bool) -> f32 {
        let sample = |dx: i32, dy: i32| {
            let max_x = (self.cell.x + self.cell.width - 1) as i64;
            let max_y = (self.cell.y + self.cell.height - 1) as i64;
            let x = (self.x.floor() as i64 + i64::from(dx)).clamp(i64::from(self.cell.x), max_x);
            let y = (self.y.floor() as i64 + i64::from(dy)).clamp(i64::from(self.cell.y), max_y);
            let stored = depths.get((y * i64::from(width) + x) as usize).copied().unwrap_or(1.0);
            if self.depth - self.bias <= stored { 1.0 } else { 0.0 }
        };
        if !pcf {
            return sample(0, 0);
        }
        let step = self.radius.round().max(1.0) as i32;
        let mut sum = 0.0;
        for dy in -1..=1 {
            for dx in -1..=1 {
                sum += sample(dx * step, dy * step);
            }
        }
        sum / 9.0
    }
}

impl LightShadowMap {
    /// Where `point` lands in the map, or `None` outside the light frustum.
    fn lookup(&self, point: Vec3) -> Option<ShadowLookup> {
        let face = if self.camera.is_point { point_face(point - self.position) } else { 0 };
        let view = self.camera.views[face];
        let clip = view.projection * view.view * point.extend(1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        let uv = (ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        if !(0.0..=1.0).contains(&uv.0) || !(0.0..=1.0).contains(&uv.1) || ndc.z > 1.0 {
            return None;
        }
        let cell = view.viewport;
        Some(ShadowLookup {
            x: cell.x as f32 + (uv.0 * cell.width as f32).min(cell.width as f32 - 1.0),
            y: cell.y as f32 + (uv.1 * cell.height as f32).min(cell.height as f32 - 1.0),
            depth: ndc.z,
            bias: self.uniform.params.x,
            cell,
            radius: self.uniform.params.z,
        })
    }
}

/// Renders and remembers one depth map per shadow-casting light.
#[derive(Debug, Default)]
pub struct ShadowMapPass {
    maps: FxHashMap<NodeHandle, LightShadowMap>,
}

impl ShadowMapPass {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn map(&self, light: NodeHandle) -> Option<&LightShadowMap> {
        self.maps.get(&light)
    }

    #[must_use]
    pub fn uniform(&self, light: NodeHandle) -> Option<ShadowUniform> {
        self.maps.get(&light).map(|m| m.uniform)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Shadow textures by receiver sampler name, in program sampler order.
    #[must_use]
    pub fn samplers(&self, lights: &LightsState) -> Vec<(String, TextureId)> {
        let names = lights.counts().shadow_sampler_names();
        let directional = lights.directional.iter().filter(|l| l.shadowed).map(|l| l.node);
        let point = lights.point.iter().filter(|l| l.shadowed).map(|l| l.node);
        let spot = lights.spot.iter().filter(|l| l.shadowed).map(|l| l.node);
        names
            .into_iter()
            .zip(directional.chain(point).chain(spot))
            .filter_map(|(name, node)| self.maps.get(&node).map(|m| (name, m.texture)))
            .collect()
    }

    /// Forgets every map and frees their targets.
    pub fn clear<D: GpuDevice + ?Sized>(&mut self, ctx: &mut RenderContext, device: &mut D) {
        self.maps.clear();
        ctx.targets.retain_shadows(device, &mut ctx.state, |_| false);
    }

    /// Renders the depth maps of every shadow-casting light in `lights`.
    ///
    /// With `auto_update` off, a map is only redrawn when it is new, its
    /// size changed or its light has `shadow.needs_update` set; the flag is
    /// cleared afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn render<D: GpuDevice + ?Sized>(
        &mut self,
        ctx: &mut RenderContext,
        device: &mut D,
        scene: &mut Scene,
        assets: &Assets,
        lights: &LightsState,
        casters: &[RenderItem],
        settings: &RendererSettings,
        global_planes: &[Vec4],
    ) {
        if !settings.shadow_map.enabled {
            if !self.maps.is_empty() {
                self.clear(ctx, device);
            }
            return;
        }

        let active: SmallVec<[NodeHandle; 8]> = lights.shadow_casters().collect();
        self.maps.retain(|node, _| active.contains(node));
        ctx.targets.retain_shadows(device, &mut ctx.state, |node| active.contains(&node));

        let max_size = device.capabilities().max_texture_size;
        for &node in &active {
            let (Some(light), Some(world)) = (scene.light(node), scene.node(node).map(|n| *n.world_matrix())) else {
                continue;
            };
            let Some(camera) = shadow_camera(light, &world, max_size) else {
                continue;
            };

            let resized = self
                .maps
                .get(&node)
                .is_none_or(|m| m.width != camera.width || m.height != camera.height);
            if !(settings.shadow_map.auto_update || light.shadow.needs_update || resized) {
                continue;
            }

            let shadow = &light.shadow;
            let uniform = ShadowUniform {
                matrix: camera.matrix,
                params: Vec4::new(shadow.bias, shadow.normal_bias, shadow.radius, camera.width.min(camera.height) as f32),
                range: Vec4::new(shadow.near, shadow.far, 0.0, 0.0),
            };
            let position = Vec3::from(world.translation);

            let desc = TargetDesc {
                width: camera.width,
                height: camera.height,
                format: TextureFormat::Rgba32Float,
                depth: Some(TextureFormat::Depth32Float),
                depth_texture: true,
                samples: 1,
                sampler: TextureSampler {
                    mag_filter: FilterMode::Nearest,
                    min_filter: FilterMode::Nearest,
                    mipmap_filter: FilterMode::Nearest,
                    ..TextureSampler::default()
                },
            };
            let target = ctx.targets.prepare(
                device,
                &mut ctx.state,
                &mut ctx.warnings,
                &ctx.diagnostics,
                TargetKey::Shadow(node),
                desc,
                0,
            );

            ctx.state.bind_framebuffer(device, Some(target.draw_framebuffer()));
            ctx.state.set_scissor(device, None);
            ctx.state.set_viewport(device, Rect::from_size(camera.width, camera.height));
            ctx.state.set_depth_write(device, true);
            ctx.state.set_color_write(device, true);
            device.clear(&ClearRequest {
                color: Some(Vec4::ONE),
                depth: Some(1.0),
                stencil: None,
            });

            let mut drawn = 0_usize;
            for view in &camera.views {
                ctx.state.set_viewport(device, view.viewport);
                let frustum = Frustum::from_matrix(view.projection * view.view);
                let uniforms = ViewUniforms {
                    view: view.view,
                    projection: view.projection,
                    position,
                };
                for item in casters {
                    let culled = scene.mesh(item.node).is_some_and(|m| m.frustum_culled);
                    if culled && !frustum.intersects_sphere(&item.sphere) {
                        continue;
                    }
                    if draw_caster(ctx, device, scene, assets, item, &uniforms, settings, global_planes) {
                        drawn += 1;
                    }
                }
            }
            target.resolve(device);
            log::trace!("Shadow map for {node:?}: {drawn} caster draws");

            self.maps.insert(
                node,
                LightShadowMap {
                    node,
                    width: camera.width,
                    height: camera.height,
                    texture: target.depth_texture.unwrap_or(target.color),
                    framebuffer: target.framebuffer,
                    uniform,
                    position,
                    camera,
                },
            );
            if let Some(light) = scene.light_mut(node) {
                light.shadow.needs_update = false;
            }
        }
    }

    /// Reads the whole depth map of `light`, row-major from the top.
    pub fn read_depth<D: GpuDevice + ?Sized>(&self, device: &mut D, light: NodeHandle) -> Option<ReadbackFuture<Vec<f32>>> {
        let map = self.maps.get(&light)?;
        let source = device.read_pixels(
            Some(map.framebuffer),
            Rect::from_size(map.width, map.height),
            ReadTarget::Depth,
        );
        Some(ReadbackFuture::with_decoder(source, |bytes| Ok(decode_depths(&bytes))))
    }

    /// Fraction of light reaching `point` (1 lit, 0 fully shadowed), looked
    /// up on the CPU with the same bias and filtering receivers use.
    /// Points outside the light's frustum are lit.
    pub fn visibility<D: GpuDevice + ?Sized>(
        &self,
        device: &mut D,
        light: NodeHandle,
        point: Vec3,
        kind: ShadowMapKind,
    ) -> Option<ReadbackFuture<f32>> {
        let map = self.maps.get(&light)?;
        let lookup = map.lookup(point);
        let width = map.width;
        let source = device.read_pixels(Some(map.framebuffer), Rect::from_size(map.width, map.height), ReadTarget::Depth);
        let pcf = kind == ShadowMapKind::Pcf;
        Some(ReadbackFuture::with_decoder(source, move |bytes| {
            Ok(lookup.map_or(1.0, |l| l.visibility(&decode_depths(&bytes), width, pcf)))
        }))
    }
}

fn decode_depths(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Side drawn into the map: `shadow_side`, else the opposite of `side`.
fn shadow_side(material: &Material) -> Side {
    let settings = material.settings();
    settings.shadow_side.unwrap_or(match settings.side {
        Side::Front => Side::Back,
        Side::Back => Side::Front,
        Side::Double => Side::Double,
    })
}

#[allow(clippy::too_many_arguments)]
fn draw_caster<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    scene: &Scene,
    assets: &Assets,
    item: &RenderItem,
    view: &ViewUniforms,
    settings: &RendererSettings,
    global_planes: &[Vec4],
) -> bool {
    let (Some(mesh), Some(geometry), Some(material)) = (
        scene.mesh(item.node),
        assets.get_geometry(item.geometry),
        assets.get_material(item.material),
    ) else {
        return false;
    };
    let s = material.settings();

    let variant = DepthVariant {
        side: shadow_side(material),
        alpha_test: s.alpha_test > 0.0,
    };
    let mut object = object_features(mesh, geometry, false);
    object.remove(ObjectFeatures::NORMALS | ObjectFeatures::COLORS);

    let mut planes: Vec<Vec4> = Vec::new();
    if s.clip_shadows {
        planes.extend_from_slice(global_planes);
        if settings.local_clipping_enabled {
            planes.extend(s.clipping_planes.iter().map(|p| p.to_vec4()));
        }
    }
    let clipping = ClippingContext {
        planes: planes.len() as u32,
        intersection: s.clip_intersection && !planes.is_empty(),
    };
    let scene_key = SceneProgramKey {
        clipping,
        ..SceneProgramKey::default()
    };

    let precision = ctx.clamp_precision(device, s.precision.unwrap_or(settings.precision));
    let Some(program) = ctx.resolve_program(
        device,
        ProgramOwner::ShadowDepth(variant),
        0,
        object,
        &scene_key,
        "shadow depth",
        || ProgramParameters::for_depth(variant, precision, object, clipping),
    ) else {
        return false;
    };
    if ctx.programs.bind(device, &mut ctx.state, program).is_none() {
        return false;
    }

    set_matrix_uniforms(ctx, device, program, &item.world, view, true);
    ctx.programs.set_uniform(device, program, "opacity", UniformData::Float(material.opacity()));
    ctx.programs.set_uniform(device, program, "alphaTest", UniformData::Float(s.alpha_test));
    if !planes.is_empty() {
        ctx.programs.set_uniform(device, program, "clippingPlanes", UniformData::Vec4Array(planes.clone()));
        ctx.programs.set_uniform(device, program, "clipIntersection", UniformData::UInt(u32::from(clipping.intersection)));
    }
    ctx.state.set_clip_planes(device, clipping.planes);
    ctx.bind_samplers(device, assets, program, material, &FrameEnvironment::default());

    let (cull, front_face) = RenderState::culling(variant.side, item.world.determinant() < 0.0);
    let state = RenderState {
        depth_test: true,
        depth_write: true,
        blend: None,
        cull,
        front_face,
        polygon_offset: s.polygon_offset,
        ..RenderState::default()
    };
    ctx.draw_geometry(
        device,
        &DrawInput {
            node: item.node,
            mesh,
            geometry_handle: item.geometry,
            geometry,
            range: item.range.clone(),
        },
        &state,
    );
    true
}
