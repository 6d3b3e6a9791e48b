//! Renderer
//!
//! [`Renderer`] turns a [`Scene`] into device commands. One call to
//! [`Renderer::render`] runs the whole frame:
//!
//! 1. drain asset disposal events and release their GPU objects
//! 2. resolve world matrices and the camera's view/projection
//! 3. release instance buffers of removed or no longer instanced meshes,
//!    build the render lists and collect lights
//! 4. render shadow maps for every shadow-casting light
//! 5. bind the output target, clear it and draw the background
//! 6. draw opaque, then transmissive (after capturing the opaque result),
//!    then transparent items
//! 7. resolve multisampled targets and run the output pass (tone mapping and
//!    color encoding) when presenting to the display
//!
//! Everything GPU-side is owned by caches inside the renderer, so several
//! renderers over different devices can coexist.

pub mod cache;
pub mod context;
pub mod device;
pub mod diagnostics;
pub mod lights;
pub mod programs;
pub mod readback;
pub mod render_list;
pub mod settings;
pub mod shader_generator;
pub mod shadow;
pub mod state;

pub use cache::CacheStats;
pub use device::{DeviceStats, GpuDevice, HeadlessDevice, Rect};
pub use diagnostics::{Diagnostic, ProgramDiagnostic};
pub use readback::ReadbackFuture;
pub use render_list::{RenderItem, RenderList, RenderListBuilder};
pub use settings::{DeviceCapabilities, OutputColorSpace, RendererSettings, ShadowMapKind, ToneMapping};
pub use shadow::ShadowMapPass;

use flume::Receiver;
use glam::{Vec3, Vec4};

use crate::assets::{Assets, DisposeEvent, MaterialHandle, RenderTargetHandle};
use crate::errors::{Result, TrellisError};
use crate::math::Plane;
use crate::scene::{Background, Camera, Fog, NodeHandle, Scene};

use self::cache::{GpuRenderTarget, TargetDesc, TargetKey, UniformBlockKey};
use self::context::{
    DrawInput, FrameEnvironment, LIGHTS_BLOCK_SLOT, RenderContext, ViewUniforms, material_state, object_features,
    set_matrix_uniforms,
};
use self::device::{ClearRequest, CullMode, DrawCall, FramebufferId, ReadTarget, UniformData};
use self::lights::LightsState;
use self::programs::{FogKind, ObjectFeatures, ProgramHandle, ProgramOwner, ProgramParameters, SceneProgramKey};
use self::shader_generator::ClippingContext;
use self::state::RenderState;
use crate::resources::material::Material;
use crate::resources::texture::{FilterMode, TextureFormat, TextureSampler};

/// Statistics of the last rendered frame plus live GPU objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderInfo {
    /// Frames rendered so far.
    pub frame: u64,
    pub calls: u64,
    pub triangles: u64,
    /// State changes forwarded to the device during the last frame.
    pub state_changes: u64,
    /// Redundant state requests the tracker filtered out.
    pub state_changes_skipped: u64,
    pub programs: usize,
    pub memory: CacheStats,
    /// Cumulative device counters.
    pub device: DeviceStats,
}

/// Where the color passes of a frame draw.
#[derive(Debug, Clone, Copy)]
struct FrameTarget {
    framebuffer: Option<FramebufferId>,
    width: u32,
    height: u32,
    /// Offscreen target to resolve after the passes.
    resolve: Option<GpuRenderTarget>,
    /// Scene color handed to the output pass.
    post: Option<GpuRenderTarget>,
}

/// Which list a color draw belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Opaque,
    Transmissive,
    Transparent,
}

/// Forward renderer over a [`GpuDevice`].
///
/// ```rust,ignore
/// let mut renderer = Renderer::new(HeadlessDevice::new(320, 240), RendererSettings::default());
/// renderer.render(&mut scene, camera, &mut assets)?;
/// let pixels = futures::executor::block_on(renderer.read_pixels(Rect::from_size(320, 240)))?;
/// ```
pub struct Renderer<D: GpuDevice> {
    device: D,
    settings: RendererSettings,
    ctx: RenderContext,
    lists: RenderListBuilder,
    shadows: ShadowMapPass,
    disposals: Option<Receiver<DisposeEvent>>,
    render_target: Option<RenderTargetHandle>,
    viewport: Option<Rect>,
    scissor: Option<Rect>,
    info: RenderInfo,
}

impl<D: GpuDevice> Renderer<D> {
    pub fn new(device: D, settings: RendererSettings) -> Self {
        let caps = device.capabilities();
        let units = settings.max_texture_units.min(caps.max_texture_units);
        let (width, height) = device.drawing_buffer_size();
        log::info!(
            "Renderer created: {width}x{height}, precision {:?} (device max {:?}), {units} texture units",
            settings.precision,
            caps.max_precision
        );
        Self {
            device,
            settings,
            ctx: RenderContext::new(units),
            lists: RenderListBuilder::new(),
            shadows: ShadowMapPass::new(),
            disposals: None,
            render_target: None,
            viewport: None,
            scissor: None,
            info: RenderInfo::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Direct device access. Call [`Renderer::reset_state`] afterwards if
    /// state was changed behind the renderer's back.
    #[inline]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    /// Replaces the settings. Changes that alter generated shaders release
    /// every program so materials re-resolve on the next frame.
    pub fn set_settings(&mut self, settings: RendererSettings) {
        if !self.settings.program_affecting_eq(&settings) {
            log::debug!("Renderer settings changed shader inputs, releasing {} programs", self.ctx.programs.len());
            self.ctx.programs.clear(&mut self.device, &mut self.ctx.state);
        }
        let units = settings.max_texture_units.min(self.device.capabilities().max_texture_units);
        self.ctx.units.set_limit(units);
        self.settings = settings;
    }

    /// Forgets the shadowed device state.
    pub fn reset_state(&mut self) {
        self.ctx.state.reset();
    }

    /// Sets the offscreen target for subsequent frames; `None` renders to
    /// the display.
    pub fn set_render_target(&mut self, target: Option<RenderTargetHandle>) {
        self.render_target = target;
    }

    #[must_use]
    pub fn render_target(&self) -> Option<RenderTargetHandle> {
        self.render_target
    }

    /// Restricts drawing to `rect`; `None` uses the whole target.
    pub fn set_viewport(&mut self, rect: Option<Rect>) {
        self.viewport = rect;
    }

    /// Restricts clears and draws to `rect`; `None` disables the scissor.
    pub fn set_scissor(&mut self, rect: Option<Rect>) {
        self.scissor = rect;
    }

    /// Receives every [`Diagnostic`] the renderer reports.
    #[must_use]
    pub fn diagnostics(&self) -> Receiver<Diagnostic> {
        self.ctx.diagnostics.receiver()
    }

    #[must_use]
    pub fn info(&self) -> RenderInfo {
        let mut info = self.info;
        info.programs = self.ctx.programs.len();
        info.memory = CacheStats {
            geometries: self.ctx.geometries.len(),
            textures: self.ctx.textures.len(),
            render_targets: self.ctx.targets.len(),
            uniform_buffers: self.ctx.uniform_buffers.len(),
        };
        info.device = self.device.stats();
        info
    }

    #[must_use]
    pub fn programs(&self) -> &programs::ProgramCache {
        &self.ctx.programs
    }

    #[must_use]
    pub fn shadow_maps(&self) -> &ShadowMapPass {
        &self.shadows
    }

    /// Releases GPU objects of every disposed asset seen so far.
    pub fn process_disposals(&mut self) {
        let Some(rx) = &self.disposals else {
            return;
        };
        let events: Vec<DisposeEvent> = rx.try_iter().collect();
        for event in events {
            log::trace!("Releasing GPU objects of {event:?}");
            let (device, ctx) = (&mut self.device, &mut self.ctx);
            match event {
                DisposeEvent::Geometry(h) => ctx.geometries.remove(device, &mut ctx.state, h),
                DisposeEvent::Material(h) => ctx.programs.release_owner(device, &mut ctx.state, ProgramOwner::Material(h)),
                DisposeEvent::Texture(h) => ctx.textures.remove(device, &mut ctx.state, h),
                DisposeEvent::RenderTarget(h) => {
                    ctx.targets.remove(device, &mut ctx.state, TargetKey::User(h));
                    if self.render_target == Some(h) {
                        self.render_target = None;
                    }
                }
                DisposeEvent::UniformGroup(h) => ctx.uniform_buffers.remove(device, &mut ctx.state, UniformBlockKey::Group(h)),
            }
        }
    }

    /// Releases every GPU object the renderer owns. The renderer stays usable;
    /// the next frame recreates what it needs.
    pub fn dispose(&mut self) {
        let (device, ctx) = (&mut self.device, &mut self.ctx);
        self.shadows.clear(ctx, device);
        ctx.programs.clear(device, &mut ctx.state);
        ctx.geometries.clear(device, &mut ctx.state);
        ctx.textures.clear(device, &mut ctx.state);
        ctx.targets.clear(device, &mut ctx.state);
        ctx.uniform_buffers.clear(device, &mut ctx.state);
        ctx.state.reset();
        log::debug!("Renderer disposed all GPU objects");
    }

    fn sync(&mut self, scene: &mut Scene, camera: NodeHandle, assets: &mut Assets) -> Result<Camera> {
        if self.disposals.is_none() {
            self.disposals = Some(assets.subscribe_disposals());
        }
        self.process_disposals();

        scene.update_matrix_world(false);
        let world = scene
            .node(camera)
            .map(|n| *n.world_matrix())
            .ok_or_else(|| TrellisError::ResourceNotFound(format!("camera node {camera:?}")))?;
        let camera = scene
            .camera_mut(camera)
            .ok_or_else(|| TrellisError::ResourceNotFound(format!("node {camera:?} has no camera")))?;
        camera.update_view_projection(&world);
        Ok(camera.clone())
    }

    /// Compiles the programs every mesh in `scene` needs without drawing.
    /// Returns the number of live programs.
    pub fn compile(&mut self, scene: &mut Scene, camera: NodeHandle, assets: &mut Assets) -> Result<usize> {
        self.sync(scene, camera, assets)?;
        let lights = LightsState::collect(scene, self.settings.shadow_map.enabled);
        let env = frame_environment(scene, &lights, &self.settings);

        let (device, ctx, settings) = (&mut self.device, &mut self.ctx, &self.settings);
        for (_, mesh) in &scene.meshes {
            let Some(geometry) = assets.get_geometry(mesh.geometry) else {
                continue;
            };
            let handles: Vec<_> = match scene.override_material {
                Some(m) => vec![m],
                None => mesh.materials.to_vec(),
            };
            for handle in handles {
                let Some(material) = assets.get_material(handle) else {
                    continue;
                };
                let (scene_key, _) = material_scene_key(material, &env);
                let object = object_features(mesh, geometry, scene_key.shadow_kind.is_some());
                resolve_material_program(ctx, device, handle, material, object, &scene_key, settings);
            }
        }
        log::debug!("Warm-up compiled {} programs", ctx.programs.len());
        Ok(ctx.programs.len())
    }

    /// Renders one frame of `scene` seen from the camera on `camera`.
    ///
    /// Per-material failures never abort the frame; they are reported through
    /// [`Renderer::diagnostics`]. The only error is a camera handle that does
    /// not resolve.
    pub fn render(&mut self, scene: &mut Scene, camera: NodeHandle, assets: &mut Assets) -> Result<()> {
        let camera = self.sync(scene, camera, assets)?;
        let assets: &Assets = assets;

        let before = self.device.stats();
        let (issued, skipped) = (self.ctx.state.issued(), self.ctx.state.skipped());
        self.info.frame += 1;
        let frame = self.info.frame;

        let Self {
            device,
            settings,
            ctx,
            lists,
            shadows,
            render_target,
            viewport,
            scissor,
            ..
        } = self;

        ctx.geometries.retain_instances(device, &mut ctx.state, |node| {
            scene.mesh(node).is_some_and(|mesh| mesh.instances.is_some())
        });

        let list = lists.build(scene, &camera, assets, settings);
        let lights = LightsState::collect(scene, settings.shadow_map.enabled);
        let mut env = frame_environment(scene, &lights, settings);

        shadows.render(ctx, device, scene, assets, &lights, &list.shadow_casters, settings, &env.global_planes);
        env.shadow_maps = shadows.samplers(&lights);

        let lights_block = lights.pack(|node| shadows.uniform(node));
        let (buffer, _) = ctx
            .uniform_buffers
            .upload(device, &mut ctx.state, UniformBlockKey::Lights, frame, &lights_block);
        ctx.state.bind_uniform_buffer(device, LIGHTS_BLOCK_SLOT, Some(buffer));

        let target = frame_target(ctx, device, assets, *render_target, settings);
        let full = Rect::from_size(target.width, target.height);
        let region = if target.post.is_some() || render_target.is_some() {
            full
        } else {
            viewport.unwrap_or(full)
        };

        let view = ViewUniforms {
            view: *camera.view_matrix(),
            projection: *camera.projection_matrix(),
            position: camera.position(),
        };

        ctx.state.bind_framebuffer(device, target.framebuffer);
        ctx.state.set_viewport(device, region);
        ctx.state.set_scissor(device, *scissor);
        clear_and_draw_background(ctx, device, scene, assets, settings, true);

        for item in &list.opaque {
            draw_item(ctx, device, scene, assets, item, &view, &env, settings, Pass::Opaque);
        }

        if !list.transmissive.is_empty() {
            env.transmission = capture_opaque(ctx, device, scene, assets, list, &view, &env, settings, (target.width, target.height));
            ctx.state.bind_framebuffer(device, target.framebuffer);
            ctx.state.set_viewport(device, region);
            ctx.state.set_scissor(device, *scissor);
            for item in &list.transmissive {
                draw_item(ctx, device, scene, assets, item, &view, &env, settings, Pass::Transmissive);
            }
        }

        for item in &list.transparent {
            draw_item(ctx, device, scene, assets, item, &view, &env, settings, Pass::Transparent);
        }

        if let Some(gpu) = target.resolve {
            gpu.resolve(device);
        }
        if let Some(post) = target.post {
            output_pass(ctx, device, &post, settings, *viewport);
        }
        device.end_frame();

        let after = device.stats();
        self.info.calls = after.draw_calls - before.draw_calls;
        self.info.triangles = after.triangles - before.triangles;
        self.info.state_changes = self.ctx.state.issued() - issued;
        self.info.state_changes_skipped = self.ctx.state.skipped() - skipped;
        log::trace!(
            "Frame {frame}: {} calls, {} triangles, {} state changes",
            self.info.calls,
            self.info.triangles,
            self.info.state_changes
        );
        Ok(())
    }

    /// Reads back pixels of a rendered user target. Rows start at `rect.y`
    /// counted from the top.
    pub fn read_render_target_pixels(&mut self, target: RenderTargetHandle, rect: Rect) -> ReadbackFuture {
        let Some(gpu) = self.ctx.targets.get(TargetKey::User(target)).copied() else {
            return ReadbackFuture::failed(format!("render target {target:?} has not been rendered"));
        };
        ReadbackFuture::new(self.device.read_pixels(Some(gpu.framebuffer), rect, ReadTarget::Color))
    }

    /// Reads back pixels of the display.
    pub fn read_pixels(&mut self, rect: Rect) -> ReadbackFuture {
        ReadbackFuture::new(self.device.read_pixels(None, rect, ReadTarget::Color))
    }

    /// Fraction of `light` reaching `point` according to its last shadow
    /// map, computed the way receivers do. `None` without a map.
    pub fn shadow_visibility(&mut self, light: NodeHandle, point: Vec3) -> Option<ReadbackFuture<f32>> {
        self.shadows
            .visibility(&mut self.device, light, point, self.settings.shadow_map.kind)
    }

    /// Depth values of `light`'s shadow map, row-major from the top.
    pub fn shadow_map_depth(&mut self, light: NodeHandle) -> Option<ReadbackFuture<Vec<f32>>> {
        self.shadows.read_depth(&mut self.device, light)
    }
}

impl<D: GpuDevice> Drop for Renderer<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ─── Frame setup ─────────────────────────────────────────────────────────────

fn frame_environment(scene: &Scene, lights: &LightsState, settings: &RendererSettings) -> FrameEnvironment {
    let (fog_kind, fog) = match scene.fog {
        Some(Fog::Linear { color, near, far }) => (FogKind::Linear, Some((FogKind::Linear.id(), color, near, far, 0.0))),
        Some(Fog::Exp2 { color, density }) => (FogKind::Exp2, Some((FogKind::Exp2.id(), color, 0.0, 0.0, density))),
        None => (FogKind::None, None),
    };
    FrameEnvironment {
        scene_key: SceneProgramKey {
            lights: lights.counts(),
            shadow_kind: settings.shadow_map.enabled.then_some(settings.shadow_map.kind),
            fog: fog_kind,
            clipping: ClippingContext::default(),
        },
        fog,
        global_planes: settings.clipping_planes.iter().map(|p| Vec4::from_array(*p)).collect(),
        local_clipping: settings.local_clipping_enabled,
        shadow_maps: Vec::new(),
        transmission: None,
    }
}

fn frame_target<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    assets: &Assets,
    render_target: Option<RenderTargetHandle>,
    settings: &RendererSettings,
) -> FrameTarget {
    if let Some(handle) = render_target {
        if let Some(target) = assets.get_render_target(handle) {
            let gpu = ctx.targets.prepare(
                device,
                &mut ctx.state,
                &mut ctx.warnings,
                &ctx.diagnostics,
                TargetKey::User(handle),
                TargetDesc::from_target(target),
                target.version(),
            );
            return FrameTarget {
                framebuffer: Some(gpu.draw_framebuffer()),
                width: gpu.width,
                height: gpu.height,
                resolve: Some(gpu),
                post: None,
            };
        }
        log::warn!("Render target {handle:?} no longer exists, drawing to the display");
    }

    let (width, height) = device.drawing_buffer_size();
    if !settings.needs_output_pass() {
        return FrameTarget {
            framebuffer: None,
            width,
            height,
            resolve: None,
            post: None,
        };
    }
    let post = ctx.targets.prepare(
        device,
        &mut ctx.state,
        &mut ctx.warnings,
        &ctx.diagnostics,
        TargetKey::Post,
        intermediate_desc(width, height, settings.msaa_samples),
        0,
    );
    FrameTarget {
        framebuffer: Some(post.draw_framebuffer()),
        width,
        height,
        resolve: Some(post),
        post: Some(post),
    }
}

/// Linear half-float color with a depth buffer.
fn intermediate_desc(width: u32, height: u32, samples: u32) -> TargetDesc {
    TargetDesc {
        width,
        height,
        format: TextureFormat::Rgba16Float,
        depth: Some(TextureFormat::Depth24Plus),
        depth_texture: false,
        samples: samples.max(1),
        sampler: TextureSampler {
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Nearest,
            ..TextureSampler::default()
        },
    }
}

// ─── Passes ──────────────────────────────────────────────────────────────────

fn clear_and_draw_background<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    scene: &Scene,
    assets: &Assets,
    settings: &RendererSettings,
    honor_auto_clear: bool,
) {
    let clear_color = match scene.background {
        Background::Color(c) => c.extend(1.0),
        _ => Vec3::from_array(settings.clear_color).extend(settings.clear_alpha),
    };
    let auto = settings.auto_clear;
    let request = ClearRequest {
        color: (!honor_auto_clear || auto.color).then_some(clear_color),
        depth: (!honor_auto_clear || auto.depth).then_some(1.0),
        stencil: (!honor_auto_clear || auto.stencil).then_some(0),
    };
    if request.color.is_some() || request.depth.is_some() || request.stencil.is_some() {
        ctx.state.set_color_write(device, true);
        ctx.state.set_depth_write(device, true);
        device.clear(&request);
    }

    let Background::Texture(handle) = scene.background else {
        return;
    };
    let Some(texture) = assets.get_texture(handle) else {
        return;
    };
    let precision = ctx.clamp_precision(device, settings.precision);
    let Some(program) = ctx.resolve_program(
        device,
        ProgramOwner::Background,
        0,
        ObjectFeatures::empty(),
        &SceneProgramKey::default(),
        "background",
        || ProgramParameters::fullscreen("background", true, precision),
    ) else {
        return;
    };
    let id = ctx.textures.prepare(device, &mut ctx.state, &ctx.diagnostics, handle, texture);
    draw_fullscreen(ctx, device, program, id, 0, 1.0, false);
}

fn output_pass<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    post: &GpuRenderTarget,
    settings: &RendererSettings,
    viewport: Option<Rect>,
) {
    let precision = ctx.clamp_precision(device, settings.precision);
    let Some(program) = ctx.resolve_program(
        device,
        ProgramOwner::Output,
        0,
        ObjectFeatures::empty(),
        &SceneProgramKey::default(),
        "output",
        || ProgramParameters::fullscreen("output", true, precision),
    ) else {
        return;
    };
    let (width, height) = device.drawing_buffer_size();
    ctx.state.bind_framebuffer(device, None);
    ctx.state.set_viewport(device, viewport.unwrap_or(Rect::from_size(width, height)));
    ctx.state.set_scissor(device, None);
    draw_fullscreen(
        ctx,
        device,
        program,
        Some(post.color),
        settings.tone_mapping.id(),
        settings.tone_mapping_exposure,
        settings.output_color_space == OutputColorSpace::Srgb,
    );
}

/// Draws a full-target triangle sampling `source`.
fn draw_fullscreen<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    program: ProgramHandle,
    source: Option<device::TextureId>,
    tone_mapping: u32,
    exposure: f32,
    srgb: bool,
) {
    if ctx.programs.bind(device, &mut ctx.state, program).is_none() {
        return;
    }
    ctx.units.reset();
    ctx.bind_sampler(device, program, "source", source);
    let programs = &mut ctx.programs;
    programs.set_uniform(device, program, "diffuse", UniformData::Vec3(Vec3::ZERO));
    programs.set_uniform(device, program, "opacity", UniformData::Float(1.0));
    programs.set_uniform(device, program, "toneMapping", UniformData::UInt(tone_mapping));
    programs.set_uniform(device, program, "toneMappingExposure", UniformData::Float(exposure));
    programs.set_uniform(device, program, "outputEncoding", UniformData::UInt(u32::from(srgb)));
    ctx.state.set_clip_planes(device, 0);
    ctx.state.apply(
        device,
        &RenderState {
            depth_test: false,
            depth_write: false,
            blend: None,
            cull: CullMode::None,
            ..RenderState::default()
        },
    );
    device.draw(&DrawCall {
        vertices: Vec::new(),
        index: None,
        range: 0..3,
        instances: 1,
    });
}

/// Renders the opaque list into the transmission target and returns its
/// color texture.
fn capture_opaque<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    scene: &Scene,
    assets: &Assets,
    list: &RenderList,
    view: &ViewUniforms,
    env: &FrameEnvironment,
    settings: &RendererSettings,
    (width, height): (u32, u32),
) -> Option<device::TextureId> {
    let capture = ctx.targets.prepare(
        device,
        &mut ctx.state,
        &mut ctx.warnings,
        &ctx.diagnostics,
        TargetKey::Transmission,
        intermediate_desc(width, height, settings.msaa_samples),
        0,
    );
    ctx.state.bind_framebuffer(device, Some(capture.draw_framebuffer()));
    ctx.state.set_viewport(device, Rect::from_size(width, height));
    ctx.state.set_scissor(device, None);
    clear_and_draw_background(ctx, device, scene, assets, settings, false);
    for item in &list.opaque {
        draw_item(ctx, device, scene, assets, item, view, env, settings, Pass::Opaque);
    }
    capture.resolve(device);
    Some(capture.color)
}

// ─── Color draws ─────────────────────────────────────────────────────────────

/// Scene key of `material` plus the clip planes it uses.
fn material_scene_key(material: &Material, env: &FrameEnvironment) -> (SceneProgramKey, Vec<Vec4>) {
    let s = material.settings();
    let mut planes = env.global_planes.clone();
    if env.local_clipping {
        planes.extend(s.clipping_planes.iter().map(Plane::to_vec4));
    }
    let clipping = ClippingContext {
        planes: planes.len() as u32,
        intersection: s.clip_intersection && !planes.is_empty(),
    };
    (SceneProgramKey { clipping, ..env.scene_key }, planes)
}

fn resolve_material_program<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    handle: MaterialHandle,
    material: &Material,
    object: ObjectFeatures,
    scene_key: &SceneProgramKey,
    settings: &RendererSettings,
) -> Option<ProgramHandle> {
    let precision = ctx.clamp_precision(device, material.settings().precision.unwrap_or(settings.precision));
    ctx.resolve_program(
        device,
        ProgramOwner::Material(handle),
        material.version(),
        object,
        scene_key,
        &material.name,
        || ProgramParameters::for_material(material, precision, object, scene_key),
    )
}

fn draw_item<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    scene: &Scene,
    assets: &Assets,
    item: &RenderItem,
    view: &ViewUniforms,
    env: &FrameEnvironment,
    settings: &RendererSettings,
    pass: Pass,
) -> bool {
    let (Some(mesh), Some(geometry), Some(material)) = (
        scene.mesh(item.node),
        assets.get_geometry(item.geometry),
        assets.get_material(item.material),
    ) else {
        return false;
    };
    let s = material.settings();

    let (scene_key, planes) = material_scene_key(material, env);
    let object = object_features(mesh, geometry, scene_key.shadow_kind.is_some());
    let Some(program) = resolve_material_program(ctx, device, item.material, material, object, &scene_key, settings) else {
        return false;
    };
    if ctx.programs.bind(device, &mut ctx.state, program).is_none() {
        return false;
    }

    set_matrix_uniforms(ctx, device, program, &item.world, view, false);
    ctx.set_material_uniforms(device, program, material);
    let programs = &mut ctx.programs;
    programs.set_uniform(device, program, "alphaTest", UniformData::Float(s.alpha_test));
    programs.set_uniform(device, program, "premultipliedAlpha", UniformData::UInt(u32::from(s.premultiplied_alpha)));
    if material.is_transmissive() {
        programs.set_uniform(device, program, "transmission", UniformData::Float(s.transmission));
    }
    if s.fog
        && let Some((kind, color, near, far, density)) = env.fog
    {
        programs.set_uniform(device, program, "fogKind", UniformData::UInt(kind));
        programs.set_uniform(device, program, "fogColor", UniformData::Vec3(color));
        programs.set_uniform(device, program, "fogNear", UniformData::Float(near));
        programs.set_uniform(device, program, "fogFar", UniformData::Float(far));
        programs.set_uniform(device, program, "fogDensity", UniformData::Float(density));
    }
    if !planes.is_empty() {
        let intersection = u32::from(scene_key.clipping.intersection);
        programs.set_uniform(device, program, "clippingPlanes", UniformData::Vec4Array(planes));
        programs.set_uniform(device, program, "clipIntersection", UniformData::UInt(intersection));
    }
    ctx.state.set_clip_planes(device, scene_key.clipping.planes);
    ctx.bind_samplers(device, assets, program, material, env);
    ctx.bind_uniform_groups(device, material, assets);

    let mut state = material_state(material, &item.world);
    if pass == Pass::Transparent {
        state.depth_write = false;
    }
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
