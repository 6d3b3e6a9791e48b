//! Program cache
//!
//! Maps capability fingerprints to compiled device programs.
//!
//! A [`ProgramKey`] has three parts:
//! - [`MaterialProgramKey`]: shader family, [`MaterialFeatures`], precision
//!   and the uniform layout; changes when the material's flags change
//! - [`ObjectFeatures`]: what the drawn geometry provides (normals, uvs,
//!   instancing, shadow reception); several variants of one material coexist
//! - [`SceneProgramKey`]: light counts, shadow filtering, fog and clipping;
//!   shared by every material in a frame
//!
//! Programs are reference counted and never mutated. Each [`ProgramOwner`]
//! holds one reference per object variant it uses. When its material or
//! scene part changes, all of its references are released and re-acquired
//! for the new key, so a program is deleted exactly when nothing uses it.
//!
//! Generated source is hashed with xxh3: two keys that render to the same
//! WGSL share one device program.

use std::borrow::Cow;
use std::hash::BuildHasher;

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::assets::MaterialHandle;
use crate::errors::{Result, TrellisError};
use crate::renderer::device::{GpuDevice, ProgramId, ProgramKind, ProgramSource, UniformData, UniformSlot};
use crate::renderer::diagnostics::ProgramDiagnostic;
use crate::renderer::settings::ShadowMapKind;
use crate::renderer::shader_generator::{
    ClippingContext, LightCounts, ShaderContext, ShaderGenerator, UniformDecl, templates,
};
use crate::renderer::state::StateTracker;
use crate::resources::material::{Material, MaterialFeatures, MaterialKind, Precision, Side};
use crate::resources::shader_defines::ShaderDefines;
use crate::resources::uniforms::UniformKind;

bitflags! {
    /// Inputs the drawn object provides. Part of the program key.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFeatures: u32 {
        const INSTANCED      = 1 << 0;
        const NORMALS        = 1 << 1;
        const UVS            = 1 << 2;
        const COLORS         = 1 << 3;
        const RECEIVE_SHADOW = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FogKind {
    #[default]
    None,
    Linear,
    Exp2,
}

impl FogKind {
    /// Matches the `fogKind` uniform.
    #[must_use]
    pub fn id(self) -> u32 {
        self as u32
    }
}

/// Material half of a program key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterialProgramKey {
    pub shader_id: Cow<'static, str>,
    /// xxh3 of custom shader source.
    pub custom_source: Option<u128>,
    pub features: MaterialFeatures,
    pub precision: Precision,
    /// Hash of uniform names, kinds and array lengths.
    pub layout: u64,
}

/// Per-frame scene half of a program key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SceneProgramKey {
    pub lights: LightCounts,
    /// `None` when shadow maps are disabled.
    pub shadow_kind: Option<ShadowMapKind>,
    pub fog: FogKind,
    pub clipping: ClippingContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub material: MaterialProgramKey,
    pub object: ObjectFeatures,
    pub scene: SceneProgramKey,
}

/// Depth-only variant used by the shadow pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthVariant {
    pub side: Side,
    pub alpha_test: bool,
}

/// Who holds references to programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramOwner {
    Material(MaterialHandle),
    ShadowDepth(DepthVariant),
    Background,
    Output,
}

/// Everything needed to generate and key one program.
#[derive(Debug, Clone)]
pub struct ProgramParameters {
    pub label: String,
    pub kind: ProgramKind,
    /// Built-in template, or `None` for `custom_source`.
    pub template: Option<&'static str>,
    pub custom_source: Option<String>,
    pub key: ProgramKey,
    pub defines: ShaderDefines,
    pub uniforms: Vec<UniformSlot>,
    pub samplers: Vec<String>,
}

impl ProgramParameters {
    /// Parameters for drawing `material` on an object with `object` inputs.
    #[must_use]
    pub fn for_material(material: &Material, precision: Precision, object: ObjectFeatures, scene: &SceneProgramKey) -> Self {
        let kind = material.kind();
        let features = material.features();
        let settings = material.settings();

        // Objects that do not receive shadows compile without shadow samplers.
        let mut scene_for_object = *scene;
        if !object.contains(ObjectFeatures::RECEIVE_SHADOW) || scene.shadow_kind.is_none() {
            scene_for_object.lights.directional_shadows = 0;
            scene_for_object.lights.point_shadows = 0;
            scene_for_object.lights.spot_shadows = 0;
        }
        if !features.contains(MaterialFeatures::FOG) {
            scene_for_object.fog = FogKind::None;
        }

        let mut defines = ShaderDefines::new();
        let shader_define = match kind {
            MaterialKind::Basic => "SHADER_BASIC",
            MaterialKind::Lambert => "SHADER_LAMBERT",
            MaterialKind::Phong => "SHADER_PHONG",
            MaterialKind::Standard => "SHADER_STANDARD",
            MaterialKind::Depth => "SHADER_DEPTH",
            MaterialKind::Shader(_) => "SHADER_CUSTOM",
        };
        defines.set(shader_define, "1");
        defines.toggle("USE_LIGHTS", kind.is_lit());
        apply_feature_defines(&mut defines, features);
        apply_object_defines(&mut defines, object);
        apply_scene_defines(&mut defines, &scene_for_object);

        let mut uniforms = object_slots(matches!(kind, MaterialKind::Depth));
        let mut samplers = Vec::new();
        for (name, value) in material.uniforms() {
            if uniforms.iter().any(|s| &s.name == name) {
                continue;
            }
            if value.kind() == UniformKind::Texture {
                // Built-in kinds only declare samplers they use.
                let used = matches!(kind, MaterialKind::Shader(_)) || value.as_texture().is_some();
                if used {
                    samplers.push(name.clone());
                }
                continue;
            }
            uniforms.push(UniformSlot {
                name: name.clone(),
                kind: value.kind(),
                array_len: value.array_len(),
            });
        }
        push_slot(&mut uniforms, "alphaTest", UniformKind::Float, 1);
        push_slot(&mut uniforms, "premultipliedAlpha", UniformKind::UInt, 1);
        if features.contains(MaterialFeatures::USE_TRANSMISSION) {
            push_slot(&mut uniforms, "transmission", UniformKind::Float, 1);
            samplers.push("transmissionSamplerMap".to_owned());
        }
        push_scene_slots(&mut uniforms, &scene_for_object);
        samplers.extend(scene_for_object.lights.shadow_sampler_names());

        let layout = rustc_hash::FxBuildHasher.hash_one(
            material
                .uniforms()
                .iter()
                .map(|(n, v)| (n.as_str(), v.kind(), v.array_len()))
                .collect::<Vec<_>>(),
        );
        let (template, custom_source, custom_hash, program_kind) = match kind {
            MaterialKind::Shader(custom) => (
                None,
                Some(custom.source.clone()),
                Some(ShaderGenerator::source_hash(&custom.source)),
                ProgramKind::Mesh,
            ),
            MaterialKind::Depth => (Some(templates::DEPTH), None, None, ProgramKind::Depth),
            _ => (Some(templates::MESH), None, None, ProgramKind::Mesh),
        };

        Self {
            label: format!("{}:{}", kind.shader_id(), material.name),
            kind: program_kind,
            template,
            custom_source,
            key: ProgramKey {
                material: MaterialProgramKey {
                    shader_id: kind.shader_id(),
                    custom_source: custom_hash,
                    features,
                    precision,
                    layout,
                },
                object,
                scene: scene_for_object,
            },
            defines,
            uniforms,
            samplers,
        }
    }

    /// Depth-only program for shadow casters.
    #[must_use]
    pub fn for_depth(variant: DepthVariant, precision: Precision, object: ObjectFeatures, clipping: ClippingContext) -> Self {
        let mut features = MaterialFeatures::empty();
        features.set(MaterialFeatures::ALPHA_TEST, variant.alpha_test);
        features.set(MaterialFeatures::USE_MAP, variant.alpha_test);
        features.set(MaterialFeatures::DOUBLE_SIDED, variant.side == Side::Double);
        features.set(MaterialFeatures::BACK_SIDE, variant.side == Side::Back);

        let scene = SceneProgramKey {
            clipping,
            ..SceneProgramKey::default()
        };

        let mut defines = ShaderDefines::new();
        defines.set("SHADER_DEPTH", "1");
        apply_feature_defines(&mut defines, features);
        apply_object_defines(&mut defines, object);
        apply_scene_defines(&mut defines, &scene);

        let mut uniforms = object_slots(true);
        push_slot(&mut uniforms, "opacity", UniformKind::Float, 1);
        push_slot(&mut uniforms, "alphaTest", UniformKind::Float, 1);
        push_scene_slots(&mut uniforms, &scene);
        let samplers = if variant.alpha_test { vec!["map".to_owned()] } else { Vec::new() };

        Self {
            label: format!("depth:{variant:?}"),
            kind: ProgramKind::Depth,
            template: Some(templates::DEPTH),
            custom_source: None,
            key: ProgramKey {
                material: MaterialProgramKey {
                    shader_id: Cow::Borrowed("depth"),
                    custom_source: None,
                    features,
                    precision,
                    layout: 0,
                },
                object,
                scene,
            },
            defines,
            uniforms,
            samplers,
        }
    }

    /// Viewport-covering program. With `sampled`, it reads `source`;
    /// otherwise it fills with `diffuse`/`opacity`.
    #[must_use]
    pub fn fullscreen(label: &str, sampled: bool, precision: Precision) -> Self {
        let mut defines = ShaderDefines::new();
        defines.toggle("USE_SOURCE", sampled);

        let mut uniforms = Vec::new();
        push_slot(&mut uniforms, "diffuse", UniformKind::Vec3, 1);
        push_slot(&mut uniforms, "opacity", UniformKind::Float, 1);
        push_slot(&mut uniforms, "toneMapping", UniformKind::UInt, 1);
        push_slot(&mut uniforms, "toneMappingExposure", UniformKind::Float, 1);
        push_slot(&mut uniforms, "outputEncoding", UniformKind::UInt, 1);
        let samplers = if sampled { vec!["source".to_owned()] } else { Vec::new() };

        Self {
            label: label.to_owned(),
            kind: ProgramKind::Fullscreen,
            template: Some(templates::FULLSCREEN),
            custom_source: None,
            key: ProgramKey {
                material: MaterialProgramKey {
                    shader_id: Cow::Borrowed(if sampled { "fullscreen-sampled" } else { "fullscreen" }),
                    custom_source: None,
                    features: MaterialFeatures::empty(),
                    precision,
                    layout: 0,
                },
                object: ObjectFeatures::empty(),
                scene: SceneProgramKey::default(),
            },
            defines,
            uniforms,
            samplers,
        }
    }

    fn context(&self) -> ShaderContext {
        let scene = &self.key.scene;
        let shadow_samplers = scene.lights.shadow_sampler_names();
        ShaderContext {
            label: self.label.clone(),
            precision: match self.key.material.precision {
                Precision::Low => "low",
                Precision::Medium => "medium",
                Precision::High => "high",
            },
            defines: self.defines.to_map(),
            uniforms: self
                .uniforms
                .iter()
                .filter_map(|slot| {
                    slot.kind.wgsl_type(slot.array_len).map(|ty| UniformDecl {
                        name: slot.name.clone(),
                        ty,
                    })
                })
                .collect(),
            samplers: self
                .samplers
                .iter()
                .filter(|s| !shadow_samplers.contains(s))
                .cloned()
                .collect(),
            shadow_samplers,
            lights: scene.lights,
            clipping: scene.clipping,
        }
    }

    /// Renders the WGSL for these parameters.
    pub fn generate(&self, generator: &ShaderGenerator) -> Result<String> {
        let context = self.context();
        match (&self.custom_source, self.template) {
            (Some(source), _) => generator.generate_custom(&self.label, source, &context),
            (None, Some(template)) => generator.generate(template, &context),
            (None, None) => Err(TrellisError::ShaderTemplate {
                template: self.label.clone(),
                message: "no template or source".to_owned(),
            }),
        }
    }
}

fn push_slot(slots: &mut Vec<UniformSlot>, name: &str, kind: UniformKind, array_len: usize) {
    if !slots.iter().any(|s| s.name == name) {
        slots.push(UniformSlot {
            name: name.to_owned(),
            kind,
            array_len,
        });
    }
}

fn object_slots(depth_only: bool) -> Vec<UniformSlot> {
    let mut slots = Vec::with_capacity(8);
    push_slot(&mut slots, "modelMatrix", UniformKind::Mat4, 1);
    push_slot(&mut slots, "viewMatrix", UniformKind::Mat4, 1);
    push_slot(&mut slots, "projectionMatrix", UniformKind::Mat4, 1);
    if !depth_only {
        push_slot(&mut slots, "normalMatrix", UniformKind::Mat3, 1);
        push_slot(&mut slots, "cameraPosition", UniformKind::Vec3, 1);
    }
    slots
}

fn push_scene_slots(slots: &mut Vec<UniformSlot>, scene: &SceneProgramKey) {
    if scene.fog != FogKind::None {
        push_slot(slots, "fogKind", UniformKind::UInt, 1);
        push_slot(slots, "fogColor", UniformKind::Vec3, 1);
        push_slot(slots, "fogNear", UniformKind::Float, 1);
        push_slot(slots, "fogFar", UniformKind::Float, 1);
        push_slot(slots, "fogDensity", UniformKind::Float, 1);
    }
    if scene.clipping.planes > 0 {
        push_slot(slots, "clippingPlanes", UniformKind::Vec4Array, scene.clipping.planes as usize);
        push_slot(slots, "clipIntersection", UniformKind::UInt, 1);
    }
}

fn apply_feature_defines(defines: &mut ShaderDefines, f: MaterialFeatures) {
    let table = [
        (MaterialFeatures::USE_MAP, "USE_MAP"),
        (MaterialFeatures::USE_ALPHA_MAP, "USE_ALPHA_MAP"),
        (MaterialFeatures::USE_NORMAL_MAP, "USE_NORMAL_MAP"),
        (MaterialFeatures::USE_ROUGHNESS_MAP, "USE_ROUGHNESS_MAP"),
        (MaterialFeatures::USE_METALNESS_MAP, "USE_METALNESS_MAP"),
        (MaterialFeatures::USE_EMISSIVE_MAP, "USE_EMISSIVE_MAP"),
        (MaterialFeatures::USE_TRANSMISSION, "USE_TRANSMISSION"),
        (MaterialFeatures::USE_TRANSMISSION_MAP, "USE_TRANSMISSION_MAP"),
        (MaterialFeatures::ALPHA_TEST, "ALPHA_TEST"),
        (MaterialFeatures::VERTEX_COLORS, "VERTEX_COLORS"),
        (MaterialFeatures::FLAT_SHADING, "FLAT_SHADING"),
        (MaterialFeatures::DOUBLE_SIDED, "DOUBLE_SIDED"),
        (MaterialFeatures::BACK_SIDE, "FLIP_SIDED"),
        (MaterialFeatures::PREMULTIPLIED_ALPHA, "PREMULTIPLIED_ALPHA"),
    ];
    for (flag, name) in table {
        defines.toggle(name, f.contains(flag));
    }
}

fn apply_object_defines(defines: &mut ShaderDefines, object: ObjectFeatures) {
    defines.toggle("USE_INSTANCING", object.contains(ObjectFeatures::INSTANCED));
    defines.toggle("USE_NORMAL", object.contains(ObjectFeatures::NORMALS));
    defines.toggle("USE_UV", object.contains(ObjectFeatures::UVS));
    defines.toggle("USE_COLOR_ATTRIBUTE", object.contains(ObjectFeatures::COLORS));
}

fn apply_scene_defines(defines: &mut ShaderDefines, scene: &SceneProgramKey) {
    defines.toggle("USE_FOG", scene.fog != FogKind::None);
    defines.toggle("FOG_EXP2", scene.fog == FogKind::Exp2);
    let shadows = scene.lights.shadow_count() > 0;
    defines.toggle("USE_SHADOWMAP", shadows);
    defines.toggle(
        "SHADOWMAP_TYPE_PCF",
        shadows && scene.shadow_kind == Some(ShadowMapKind::Pcf),
    );
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// Reference to a cached program (the hash of its source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(u128);

/// Public view of a cached program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub label: String,
    pub id: ProgramId,
    pub kind: ProgramKind,
    pub ref_count: usize,
}

struct ProgramRecord {
    id: ProgramId,
    label: String,
    kind: ProgramKind,
    ref_count: usize,
    samplers: Vec<String>,
    /// Last value sent per uniform.
    uniforms: FxHashMap<String, UniformData>,
}

/// What one owner currently draws with: the keys it was resolved for, the
/// material version seen and a program per object variant.
#[derive(Default)]
struct MaterialProperties {
    version: u64,
    material: Option<MaterialProgramKey>,
    scene: Option<SceneProgramKey>,
    variants: SmallVec<[(ObjectFeatures, ProgramHandle); 2]>,
    failed: bool,
}

/// Ref-counted programs plus each owner's current associations.
pub struct ProgramCache {
    generator: ShaderGenerator,
    records: FxHashMap<ProgramHandle, ProgramRecord>,
    memo: FxHashMap<ProgramKey, ProgramHandle>,
    owners: FxHashMap<ProgramOwner, MaterialProperties>,
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            generator: ShaderGenerator::new(),
            records: FxHashMap::default(),
            memo: FxHashMap::default(),
            owners: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn generator(&self) -> &ShaderGenerator {
        &self.generator
    }

    /// Returns the program `owner` should draw with.
    ///
    /// `build` runs only when the owner's version or the scene key changed,
    /// or the object variant is new. `Ok(None)` means the owner failed to
    /// compile earlier and is skipped. `Err` is returned once, on the
    /// failing compile.
    pub fn resolve<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        owner: ProgramOwner,
        version: u64,
        object: ObjectFeatures,
        scene: &SceneProgramKey,
        build: impl FnOnce() -> ProgramParameters,
    ) -> Result<Option<ProgramHandle>> {
        let mut entry = self.owners.remove(&owner).unwrap_or_default();
        let result = self.resolve_entry(device, state, &mut entry, version, object, scene, build);
        self.owners.insert(owner, entry);
        result
    }

    fn resolve_entry<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        entry: &mut MaterialProperties,
        version: u64,
        object: ObjectFeatures,
        scene: &SceneProgramKey,
        build: impl FnOnce() -> ProgramParameters,
    ) -> Result<Option<ProgramHandle>> {
        if entry.failed {
            return Ok(None);
        }
        let find = |entry: &MaterialProperties| entry.variants.iter().find(|(o, _)| *o == object).map(|(_, h)| *h);

        if entry.version == version
            && entry.scene.as_ref() == Some(scene)
            && let Some(handle) = find(entry)
        {
            return Ok(Some(handle));
        }

        let params = build();
        if entry.material.as_ref() != Some(&params.key.material) || entry.scene.as_ref() != Some(scene) {
            for (_, handle) in std::mem::take(&mut entry.variants) {
                self.release(device, state, handle);
            }
            entry.material = Some(params.key.material.clone());
            entry.scene = Some(*scene);
        }
        entry.version = version;

        if let Some(handle) = find(entry) {
            return Ok(Some(handle));
        }
        match self.acquire(device, &params) {
            Ok(handle) => {
                entry.variants.push((object, handle));
                Ok(Some(handle))
            }
            Err(e) => {
                entry.failed = true;
                Err(e)
            }
        }
    }

    /// Compiles on miss, otherwise adds a reference.
    pub fn acquire<D: GpuDevice + ?Sized>(&mut self, device: &mut D, params: &ProgramParameters) -> Result<ProgramHandle> {
        if let Some(&handle) = self.memo.get(&params.key)
            && let Some(record) = self.records.get_mut(&handle)
        {
            record.ref_count += 1;
            return Ok(handle);
        }

        let source = params.generate(&self.generator).map_err(|e| {
            TrellisError::ProgramCompile(Box::new(ProgramDiagnostic {
                label: params.label.clone(),
                source: String::new(),
                log: e.to_string(),
            }))
        })?;
        let handle = ProgramHandle(ShaderGenerator::source_hash(&source));
        self.memo.insert(params.key.clone(), handle);

        if let Some(record) = self.records.get_mut(&handle) {
            record.ref_count += 1;
            return Ok(handle);
        }

        let program_source = ProgramSource {
            label: params.label.clone(),
            kind: params.kind,
            source,
            uniforms: params.uniforms.clone(),
            samplers: params.samplers.clone(),
        };
        let id = device.create_program(&program_source).map_err(|log| {
            self.memo.remove(&params.key);
            TrellisError::ProgramCompile(Box::new(ProgramDiagnostic {
                label: params.label.clone(),
                source: program_source.source.clone(),
                log,
            }))
        })?;
        log::debug!("Compiled program '{}' ({:?})", params.label, id);

        self.records.insert(
            handle,
            ProgramRecord {
                id,
                label: params.label.clone(),
                kind: params.kind,
                ref_count: 1,
                samplers: params.samplers.clone(),
                uniforms: FxHashMap::default(),
            },
        );
        Ok(handle)
    }

    /// Drops one reference; the device program is deleted at zero.
    pub fn release<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker, handle: ProgramHandle) {
        let Some(record) = self.records.get_mut(&handle) else {
            return;
        };
        record.ref_count = record.ref_count.saturating_sub(1);
        if record.ref_count > 0 {
            return;
        }
        if let Some(record) = self.records.remove(&handle) {
            log::debug!("Deleting program '{}'", record.label);
            device.delete_program(record.id);
            state.forget_program(record.id);
        }
        self.memo.retain(|_, h| *h != handle);
    }

    /// Releases everything `owner` references and forgets it (including a
    /// failed state).
    pub fn release_owner<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker, owner: ProgramOwner) {
        if let Some(entry) = self.owners.remove(&owner) {
            for (_, handle) in entry.variants {
                self.release(device, state, handle);
            }
        }
    }

    /// Releases every owner's programs.
    pub fn clear<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker) {
        let owners: Vec<ProgramOwner> = self.owners.keys().copied().collect();
        for owner in owners {
            self.release_owner(device, state, owner);
        }
    }

    /// Binds the program; returns its device id when bound.
    pub fn bind<D: GpuDevice + ?Sized>(&self, device: &mut D, state: &mut StateTracker, handle: ProgramHandle) -> Option<ProgramId> {
        let record = self.records.get(&handle)?;
        state.use_program(device, record.id);
        Some(record.id)
    }

    /// Sends a uniform unless the program already holds that value.
    /// Returns `true` when the device was called.
    pub fn set_uniform<D: GpuDevice + ?Sized>(&mut self, device: &mut D, handle: ProgramHandle, name: &str, value: UniformData) -> bool {
        let Some(record) = self.records.get_mut(&handle) else {
            return false;
        };
        if record.uniforms.get(name) == Some(&value) {
            return false;
        }
        device.set_uniform(record.id, name, &value);
        record.uniforms.insert(name.to_owned(), value);
        true
    }

    /// Sampler names in binding order.
    #[must_use]
    pub fn samplers(&self, handle: ProgramHandle) -> &[String] {
        self.records.get(&handle).map_or(&[], |r| r.samplers.as_slice())
    }

    #[must_use]
    pub fn info(&self, handle: ProgramHandle) -> Option<ProgramInfo> {
        self.records.get(&handle).map(|r| ProgramInfo {
            label: r.label.clone(),
            id: r.id,
            kind: r.kind,
            ref_count: r.ref_count,
        })
    }

    /// Programs currently alive.
    #[must_use]
    pub fn programs(&self) -> Vec<ProgramInfo> {
        let mut all: Vec<ProgramInfo> = self.records.keys().filter_map(|&h| self.info(h)).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    /// Programs `owner` currently references, one per object variant.
    #[must_use]
    pub fn owner_programs(&self, owner: ProgramOwner) -> Vec<ProgramInfo> {
        self.owners
            .get(&owner)
            .map(|e| e.variants.iter().filter_map(|&(_, h)| self.info(h)).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_failed(&self, owner: ProgramOwner) -> bool {
        self.owners.get(&owner).is_some_and(|e| e.failed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::HeadlessDevice;
    use glam::Vec3;
    use slotmap::KeyData;

    fn owner(n: u64) -> ProgramOwner {
        ProgramOwner::Material(MaterialHandle::from(KeyData::from_ffi(n)))
    }

    fn resolve(
        cache: &mut ProgramCache,
        device: &mut HeadlessDevice,
        state: &mut StateTracker,
        who: ProgramOwner,
        material: &Material,
        object: ObjectFeatures,
        scene: &SceneProgramKey,
    ) -> Option<ProgramHandle> {
        cache
            .resolve(device, state, who, material.version(), object, scene, || {
                ProgramParameters::for_material(material, Precision::High, object, scene)
            })
            .unwrap()
    }

    #[test]
    fn test_identical_fingerprints_share_program() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = ProgramCache::new();
        let scene = SceneProgramKey::default();
        let a = Material::new_basic(Vec3::X);
        let b = Material::new_basic(Vec3::Y);

        let ha = resolve(&mut cache, &mut device, &mut state, owner(1), &a, ObjectFeatures::empty(), &scene).unwrap();
        let hb = resolve(&mut cache, &mut device, &mut state, owner(2), &b, ObjectFeatures::empty(), &scene).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(cache.info(ha).unwrap().ref_count, 2);
        assert_eq!(device.live_programs(), 1);

        cache.release_owner(&mut device, &mut state, owner(1));
        assert_eq!(cache.info(ha).unwrap().ref_count, 1);
        assert_eq!(device.live_programs(), 1);

        cache.release_owner(&mut device, &mut state, owner(2));
        assert!(cache.info(ha).is_none());
        assert_eq!(device.live_programs(), 0);
    }

    #[test]
    fn test_flag_change_rekeys_and_releases() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = ProgramCache::new();
        let scene = SceneProgramKey::default();
        let mut mat = Material::new_basic(Vec3::ONE);

        let first = resolve(&mut cache, &mut device, &mut state, owner(1), &mat, ObjectFeatures::empty(), &scene).unwrap();
        mat.settings_mut().alpha_test = 0.5;
        let second = resolve(&mut cache, &mut device, &mut state, owner(1), &mat, ObjectFeatures::empty(), &scene).unwrap();

        assert_ne!(first, second);
        assert!(cache.info(first).is_none(), "old program freed once unused");
        assert_eq!(device.live_programs(), 1);
    }

    #[test]
    fn test_value_change_keeps_program() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = ProgramCache::new();
        let scene = SceneProgramKey::default();
        let mut mat = Material::new_basic(Vec3::ONE);

        let first = resolve(&mut cache, &mut device, &mut state, owner(1), &mat, ObjectFeatures::empty(), &scene).unwrap();
        mat.set_color(Vec3::X).unwrap();
        let second = resolve(&mut cache, &mut device, &mut state, owner(1), &mat, ObjectFeatures::empty(), &scene).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.info(first).unwrap().ref_count, 1);
        assert_eq!(device.stats().programs_created, 1);
    }

    #[test]
    fn test_object_variants_coexist_and_scene_change_releases() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = ProgramCache::new();
        let mut scene = SceneProgramKey::default();
        let mat = Material::new_lambert(Vec3::ONE);

        resolve(&mut cache, &mut device, &mut state, owner(1), &mat, ObjectFeatures::empty(), &scene);
        resolve(&mut cache, &mut device, &mut state, owner(1), &mat, ObjectFeatures::NORMALS, &scene);
        assert_eq!(cache.owner_programs(owner(1)).len(), 2);

        scene.lights.directional = 1;
        resolve(&mut cache, &mut device, &mut state, owner(1), &mat, ObjectFeatures::NORMALS, &scene);
        assert_eq!(cache.owner_programs(owner(1)).len(), 1);
        assert_eq!(device.live_programs(), 1);
    }

    #[test]
    fn test_compile_failure_skips_owner() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = ProgramCache::new();
        let scene = SceneProgramKey::default();
        let broken = Material::new_shader("broken", "fn vs_main() {}\n");

        let first = cache.resolve(&mut device, &mut state, owner(7), broken.version(), ObjectFeatures::empty(), &scene, || {
            ProgramParameters::for_material(&broken, Precision::High, ObjectFeatures::empty(), &scene)
        });
        let Err(TrellisError::ProgramCompile(diagnostic)) = first else {
            panic!("expected a compile error");
        };
        assert!(diagnostic.log.contains("fs_main"));
        assert!(diagnostic.source.contains("fn vs_main"));

        let again = cache.resolve(&mut device, &mut state, owner(7), broken.version(), ObjectFeatures::empty(), &scene, || {
            panic!("failed owners are not rebuilt")
        });
        assert!(matches!(again, Ok(None)));
        assert!(cache.has_failed(owner(7)));
    }

    #[test]
    fn test_uniform_values_are_cached_per_program() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = ProgramCache::new();
        let mat = Material::new_basic(Vec3::ONE);
        let scene = SceneProgramKey::default();
        let handle = resolve(&mut cache, &mut device, &mut state, owner(1), &mat, ObjectFeatures::empty(), &scene).unwrap();

        assert!(cache.set_uniform(&mut device, handle, "opacity", UniformData::Float(0.5)));
        assert!(!cache.set_uniform(&mut device, handle, "opacity", UniformData::Float(0.5)));
        assert!(cache.set_uniform(&mut device, handle, "opacity", UniformData::Float(0.25)));
        assert_eq!(device.stats().uniform_uploads, 2);
    }
}
