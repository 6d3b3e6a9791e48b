//! Render Context
//!
//! [`RenderContext`] bundles the per-renderer caches and trackers that every
//! pass needs: state shadowing, texture units, programs, geometry/texture/
//! render-target/uniform-block caches, one-time warnings and the diagnostics
//! sink. Passes borrow it together with the device, so the shadow pass and
//! the main passes share one draw path.

use std::ops::Range;

use glam::{Mat3, Mat4, Vec3, Vec4};
use smallvec::SmallVec;

use crate::assets::{Assets, GeometryHandle};
use crate::renderer::cache::{GeometryCache, RenderTargetCache, TextureCache, UniformBlockKey, UniformBufferCache};
use crate::renderer::device::{DrawCall, GpuDevice, TextureId, UniformData};
use crate::renderer::diagnostics::{Diagnostic, DiagnosticSink};
use crate::renderer::programs::{ProgramCache, ProgramHandle, ProgramOwner, ProgramParameters};
use crate::renderer::programs::{ObjectFeatures, SceneProgramKey};
use crate::renderer::state::{RenderState, StateTracker, TextureUnitAllocator};
use crate::errors::TrellisError;
use crate::resources::geometry::Geometry;
use crate::resources::material::{Blending, Material, Precision};
use crate::resources::uniforms::UniformValue;
use crate::scene::{Mesh, NodeHandle};
use crate::utils::WarnOnce;

/// Uniform slot of the shared lights block.
pub(crate) const LIGHTS_BLOCK_SLOT: u32 = 0;
/// First slot used by material uniform groups.
pub(crate) const FIRST_GROUP_SLOT: u32 = 1;
/// Sampler reading the opaque capture in the transmissive pass.
pub(crate) const TRANSMISSION_SAMPLER: &str = "transmissionSamplerMap";

/// Camera matrices for one pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ViewUniforms {
    pub view: Mat4,
    pub projection: Mat4,
    pub position: Vec3,
}

/// Per-frame inputs shared by every draw of the color passes.
#[derive(Debug, Clone, Default)]
pub(crate) struct FrameEnvironment {
    pub scene_key: SceneProgramKey,
    /// `fogKind`, color, near, far, density.
    pub fog: Option<(u32, Vec3, f32, f32, f32)>,
    /// Global clip planes in world space.
    pub global_planes: Vec<Vec4>,
    pub local_clipping: bool,
    /// Depth maps indexed by receiver sampler name.
    pub shadow_maps: Vec<(String, TextureId)>,
    pub transmission: Option<TextureId>,
}

/// What one draw needs besides its program.
pub(crate) struct DrawInput<'a> {
    pub node: NodeHandle,
    pub mesh: &'a Mesh,
    pub geometry_handle: GeometryHandle,
    pub geometry: &'a Geometry,
    pub range: Range<u32>,
}

pub(crate) struct RenderContext {
    pub state: StateTracker,
    pub units: TextureUnitAllocator,
    pub programs: ProgramCache,
    pub geometries: GeometryCache,
    pub textures: TextureCache,
    pub targets: RenderTargetCache,
    pub uniform_buffers: UniformBufferCache,
    pub warnings: WarnOnce,
    pub diagnostics: DiagnosticSink,
}

impl RenderContext {
    pub(crate) fn new(max_texture_units: u32) -> Self {
        Self {
            state: StateTracker::new(),
            units: TextureUnitAllocator::new(max_texture_units),
            programs: ProgramCache::new(),
            geometries: GeometryCache::new(),
            textures: TextureCache::new(),
            targets: RenderTargetCache::new(),
            uniform_buffers: UniformBufferCache::new(),
            warnings: WarnOnce::new(),
            diagnostics: DiagnosticSink::new(),
        }
    }

    /// Clamps `requested` to what the device compiles, warning once per
    /// requested level.
    pub(crate) fn clamp_precision<D: GpuDevice + ?Sized>(&mut self, device: &D, requested: Precision) -> Precision {
        let used = device.capabilities().clamp_precision(requested);
        if used != requested
            && self.warnings.warn(&format!("precision-{requested:?}"), || {
                format!("{requested:?} precision is not supported, using {used:?}")
            })
        {
            self.diagnostics.report(Diagnostic::PrecisionDowngraded { requested, used });
        }
        used
    }

    /// Resolves a program, turning a compile failure into a diagnostic.
    pub(crate) fn resolve_program<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        owner: ProgramOwner,
        version: u64,
        object: ObjectFeatures,
        scene: &SceneProgramKey,
        label: &str,
        build: impl FnOnce() -> ProgramParameters,
    ) -> Option<ProgramHandle> {
        match self.programs.resolve(device, &mut self.state, owner, version, object, scene, build) {
            Ok(handle) => handle,
            Err(TrellisError::ProgramCompile(program)) => {
                log::error!("Program for '{label}' failed to build, skipping it:\n{}", program.log);
                self.diagnostics.report(Diagnostic::ProgramCompileFailed {
                    material: label.to_owned(),
                    program: *program,
                });
                None
            }
            Err(e) => {
                log::error!("Program for '{label}' failed: {e}");
                None
            }
        }
    }

    /// Binds the sampler named `name` to the next free unit.
    pub(crate) fn bind_sampler<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        program: ProgramHandle,
        name: &str,
        texture: Option<TextureId>,
    ) {
        let Some(unit) = self.units.allocate() else {
            let available = self.units.limit();
            if self.warnings.warn("texture-units", || {
                format!("Trying to use more than {available} texture units, '{name}' is left unbound")
            }) {
                self.diagnostics.report(Diagnostic::TextureUnitsExhausted {
                    requested: available + 1,
                    available,
                });
            }
            return;
        };
        self.state.bind_texture(device, unit, texture);
        self.programs.set_uniform(device, program, name, UniformData::Sampler(unit));
    }

    /// Binds every sampler `program` declares. Shadow maps and the
    /// transmission capture come from `env`, everything else from `material`.
    pub(crate) fn bind_samplers<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        assets: &Assets,
        program: ProgramHandle,
        material: &Material,
        env: &FrameEnvironment,
    ) {
        self.units.reset();
        let names: SmallVec<[String; 4]> = self.programs.samplers(program).iter().cloned().collect();
        for name in &names {
            let texture = if name == TRANSMISSION_SAMPLER {
                env.transmission
            } else if let Some((_, id)) = env.shadow_maps.iter().find(|(n, _)| n == name) {
                Some(*id)
            } else {
                material.value(name).and_then(UniformValue::as_texture).and_then(|handle| {
                    let texture = assets.get_texture(handle)?;
                    self.textures
                        .prepare(device, &mut self.state, &self.diagnostics, handle, texture)
                })
            };
            self.bind_sampler(device, program, name, texture);
        }
    }

    /// Sends the material's non-texture values.
    pub(crate) fn set_material_uniforms<D: GpuDevice + ?Sized>(&mut self, device: &mut D, program: ProgramHandle, material: &Material) {
        for (name, value) in material.uniforms() {
            if let Some(data) = uniform_data(value) {
                self.programs.set_uniform(device, program, name, data);
            }
        }
    }

    /// Uploads and binds the material's uniform groups.
    pub(crate) fn bind_uniform_groups<D: GpuDevice + ?Sized>(&mut self, device: &mut D, material: &Material, assets: &Assets) {
        for (slot, &handle) in (FIRST_GROUP_SLOT..).zip(material.uniform_groups()) {
            let Some(group) = assets.get_uniform_group(handle) else {
                self.state.bind_uniform_buffer(device, slot, None);
                continue;
            };
            let key = UniformBlockKey::Group(handle);
            if !self.uniform_buffers.is_current(key, group.version()) {
                match group.to_bytes() {
                    Ok(bytes) => {
                        self.uniform_buffers.upload(device, &mut self.state, key, group.version(), &bytes);
                    }
                    Err(e) => {
                        if self.warnings.warn(&format!("group-{}", group.name), || {
                            format!("Uniform group '{}' cannot be packed: {e}", group.name)
                        }) {
                            log::debug!("Group '{}' left unbound", group.name);
                        }
                        continue;
                    }
                }
            }
            let buffer = self.uniform_buffers.buffer(key);
            self.state.bind_uniform_buffer(device, slot, buffer);
        }
    }

    /// Uploads the geometry, applies `state` and issues the draw with the
    /// already bound program.
    pub(crate) fn draw_geometry<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        input: &DrawInput<'_>,
        state: &RenderState,
    ) {
        let gpu = self
            .geometries
            .prepare(device, &mut self.state, input.geometry_handle, input.geometry);
        let mut vertices = gpu.vertex_bindings();
        let index = gpu.index_binding();

        let mut instances = 1;
        if let Some(data) = &input.mesh.instances {
            vertices.push(self.geometries.prepare_instances(device, &mut self.state, input.node, data));
            instances = data.count();
        }
        if instances == 0 || input.range.is_empty() {
            return;
        }

        self.state.apply(device, state);
        device.draw(&DrawCall {
            vertices,
            index,
            range: input.range.clone(),
            instances,
        });
    }
}

/// Object inputs a mesh provides to its program.
pub(crate) fn object_features(mesh: &Mesh, geometry: &Geometry, shadows: bool) -> ObjectFeatures {
    let mut object = ObjectFeatures::empty();
    object.set(ObjectFeatures::INSTANCED, mesh.instances.is_some());
    object.set(ObjectFeatures::NORMALS, geometry.has_attribute(Geometry::NORMAL));
    object.set(ObjectFeatures::UVS, geometry.has_attribute(Geometry::UV));
    object.set(ObjectFeatures::COLORS, geometry.has_attribute(Geometry::COLOR));
    object.set(ObjectFeatures::RECEIVE_SHADOW, shadows && mesh.receive_shadow);
    object
}

/// Fixed-function state requested by `material`.
pub(crate) fn material_state(material: &Material, world: &Mat4) -> RenderState {
    let s = material.settings();
    // Normal blending only applies to transparent materials.
    let blend = match s.blending {
        Blending::Normal if !s.transparent => None,
        blending => blending.to_state(s.premultiplied_alpha),
    };
    let (cull, front_face) = RenderState::culling(s.side, world.determinant() < 0.0);
    RenderState {
        depth_test: s.depth_test,
        depth_func: s.depth_func,
        depth_write: s.depth_write,
        blend,
        cull,
        front_face,
        polygon_offset: s.polygon_offset,
        color_write: s.color_write,
        stencil_test: false,
    }
}

/// Device form of a material value. Textures bind through samplers instead.
pub(crate) fn uniform_data(value: &UniformValue) -> Option<UniformData> {
    Some(match value {
        UniformValue::Float(v) => UniformData::Float(*v),
        UniformValue::Int(v) => UniformData::Int(*v),
        UniformValue::UInt(v) => UniformData::UInt(*v),
        UniformValue::Bool(v) => UniformData::UInt(u32::from(*v)),
        UniformValue::Vec2(v) => UniformData::Vec2(*v),
        UniformValue::Vec3(v) => UniformData::Vec3(*v),
        UniformValue::Vec4(v) => UniformData::Vec4(*v),
        UniformValue::Mat3(v) => UniformData::Mat3(*v),
        UniformValue::Mat4(v) => UniformData::Mat4(*v),
        UniformValue::FloatArray(v) => UniformData::FloatArray(v.clone()),
        UniformValue::Vec4Array(v) => UniformData::Vec4Array(v.clone()),
        UniformValue::Texture(_) => return None,
    })
}

/// Inverse transpose of the model-view rotation block.
pub(crate) fn normal_matrix(model_view: &Mat4) -> Mat3 {
    Mat3::from_mat4(*model_view).inverse().transpose()
}

/// Sends the object and camera matrices.
pub(crate) fn set_matrix_uniforms<D: GpuDevice + ?Sized>(
    ctx: &mut RenderContext,
    device: &mut D,
    program: ProgramHandle,
    world: &Mat4,
    view: &ViewUniforms,
    depth_only: bool,
) {
    let programs = &mut ctx.programs;
    programs.set_uniform(device, program, "modelMatrix", UniformData::Mat4(*world));
    programs.set_uniform(device, program, "viewMatrix", UniformData::Mat4(view.view));
    programs.set_uniform(device, program, "projectionMatrix", UniformData::Mat4(view.projection));
    if !depth_only {
        let normal = normal_matrix(&(view.view * *world));
        programs.set_uniform(device, program, "normalMatrix", UniformData::Mat3(normal));
        programs.set_uniform(device, program, "cameraPosition", UniformData::Vec3(view.position));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::material::Side;

    #[test]
    fn test_normal_blending_needs_transparent() {
        let opaque = Material::new_basic(Vec3::ONE);
        assert!(material_state(&opaque, &Mat4::IDENTITY).blend.is_none());

        let faded = Material::new_basic(Vec3::ONE).with_opacity(0.5);
        let state = material_state(&faded, &Mat4::IDENTITY);
        assert!(state.blend.is_some());
        assert!(!state.depth_write);
    }

    #[test]
    fn test_mirrored_world_flips_winding() {
        let mut mat = Material::new_basic(Vec3::ONE);
        mat.settings_mut().side = Side::Front;
        let mirrored = Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0));
        let state = material_state(&mat, &mirrored);
        assert_eq!(state.front_face, crate::renderer::device::FrontFace::Cw);
    }

    #[test]
    fn test_bool_uniforms_become_uint() {
        assert_eq!(uniform_data(&UniformValue::Bool(true)), Some(UniformData::UInt(1)));
        assert_eq!(uniform_data(&UniformValue::Texture(None)), None);
    }
}
