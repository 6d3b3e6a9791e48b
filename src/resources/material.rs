//! Materials
//!
//! A [`Material`] is a kind (which shader family draws it), a typed uniform
//! map, and pipeline settings. The renderer derives a capability fingerprint
//! ([`MaterialFeatures`] plus scene context) from it to pick a compiled
//! program; materials never hold GPU state.
//!
//! Each built-in kind declares the properties it understands. Assigning an
//! unknown name is reported instead of being silently stored, and assigning a
//! value of the wrong type is rejected.

use std::borrow::Cow;

use bitflags::bitflags;
use glam::{Vec2, Vec3};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::assets::{TextureHandle, UniformGroupHandle};
use crate::errors::{Result, TrellisError};
use crate::math::Plane;
use crate::resources::uniforms::{UniformMap, UniformValue};
use crate::resources::version_tracker::MutGuard;

bitflags! {
    /// Shader features a material requires. Part of the program key.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MaterialFeatures: u32 {
        const USE_MAP              = 1 << 0;
        const USE_ALPHA_MAP        = 1 << 1;
        const USE_NORMAL_MAP       = 1 << 2;
        const USE_ROUGHNESS_MAP    = 1 << 3;
        const USE_METALNESS_MAP    = 1 << 4;
        const USE_EMISSIVE_MAP     = 1 << 5;
        const USE_TRANSMISSION     = 1 << 6;
        const USE_TRANSMISSION_MAP = 1 << 7;
        const ALPHA_TEST           = 1 << 8;
        const VERTEX_COLORS        = 1 << 9;
        const FLAT_SHADING         = 1 << 10;
        const DOUBLE_SIDED         = 1 << 11;
        const BACK_SIDE            = 1 << 12;
        const PREMULTIPLIED_ALPHA  = 1 << 13;
        const FOG                  = 1 << 14;
        const TONE_MAPPED          = 1 << 15;
    }
}

// ============================================================================
// Pipeline enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Side {
    #[default]
    Front,
    Back,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    #[default]
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunction {
    #[must_use]
    pub fn test(self, incoming: f32, stored: f32) -> bool {
        match self {
            CompareFunction::Never => false,
            CompareFunction::Less => incoming < stored,
            CompareFunction::Equal => (incoming - stored).abs() <= f32::EPSILON,
            CompareFunction::LessEqual => incoming <= stored,
            CompareFunction::Greater => incoming > stored,
            CompareFunction::NotEqual => (incoming - stored).abs() > f32::EPSILON,
            CompareFunction::GreaterEqual => incoming >= stored,
            CompareFunction::Always => true,
        }
    }
}

/// Shader float precision, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    Low,
    Medium,
    #[default]
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub operation: BlendOperation,
}

impl BlendComponent {
    pub const REPLACE: Self = Self {
        src: BlendFactor::One,
        dst: BlendFactor::Zero,
        operation: BlendOperation::Add,
    };

    #[must_use]
    pub const fn new(src: BlendFactor, dst: BlendFactor, operation: BlendOperation) -> Self {
        Self { src, dst, operation }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

/// How a transparent material combines with what is already drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Blending {
    None,
    #[default]
    Normal,
    Additive,
    Subtractive,
    Multiply,
    Custom(BlendState),
}

impl Blending {
    /// Fixed-function blend state, `None` when blending is off.
    #[must_use]
    pub fn to_state(self, premultiplied_alpha: bool) -> Option<BlendState> {
        use BlendFactor::{Dst, One, OneMinusSrc, OneMinusSrcAlpha, SrcAlpha, Zero};
        use BlendOperation::Add;

        let both = |c: BlendComponent| BlendState { color: c, alpha: c };
        let src_alpha = if premultiplied_alpha { One } else { SrcAlpha };

        match self {
            Blending::None => None,
            Blending::Normal => Some(BlendState {
                color: BlendComponent::new(src_alpha, OneMinusSrcAlpha, Add),
                alpha: BlendComponent::new(One, OneMinusSrcAlpha, Add),
            }),
            Blending::Additive => Some(both(BlendComponent::new(src_alpha, One, Add))),
            Blending::Subtractive => Some(both(BlendComponent::new(Zero, OneMinusSrc, Add))),
            Blending::Multiply => Some(BlendState {
                color: BlendComponent::new(Dst, Zero, Add),
                alpha: BlendComponent::new(Zero, One, Add),
            }),
            Blending::Custom(state) => Some(state),
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Pipeline-level settings. Changes here can change the program key.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialSettings {
    pub visible: bool,
    pub transparent: bool,
    pub blending: Blending,
    pub premultiplied_alpha: bool,
    pub side: Side,
    /// Side rendered into shadow maps; `None` uses the opposite of `side`
    /// for single-sided materials.
    pub shadow_side: Option<Side>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunction,
    pub color_write: bool,
    /// Fragments with alpha below this are discarded. 0 disables the test.
    pub alpha_test: f32,
    /// Greater than 0 routes the material to the transmissive bucket.
    pub transmission: f32,
    /// `(factor, units)`
    pub polygon_offset: Option<(f32, f32)>,
    /// World-space planes; geometry on the negative side is clipped.
    pub clipping_planes: Vec<Plane>,
    pub clip_intersection: bool,
    pub clip_shadows: bool,
    pub fog: bool,
    pub vertex_colors: bool,
    pub flat_shading: bool,
    pub tone_mapped: bool,
    /// Overrides the renderer's default precision.
    pub precision: Option<Precision>,
}

impl Default for MaterialSettings {
    fn default() -> Self {
        Self {
            visible: true,
            transparent: false,
            blending: Blending::Normal,
            premultiplied_alpha: false,
            side: Side::Front,
            shadow_side: None,
            depth_test: true,
            depth_write: true,
            depth_func: CompareFunction::LessEqual,
            color_write: true,
            alpha_test: 0.0,
            transmission: 0.0,
            polygon_offset: None,
            clipping_planes: Vec::new(),
            clip_intersection: false,
            clip_shadows: false,
            fog: true,
            vertex_colors: false,
            flat_shading: false,
            tone_mapped: true,
            precision: None,
        }
    }
}

// ============================================================================
// Kinds
// ============================================================================

/// User-authored WGSL. The source goes through the same template pass as
/// built-in shaders, so it may use the engine's chunks and defines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustomShader {
    pub name: Cow<'static, str>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MaterialKind {
    /// Unlit.
    Basic,
    Lambert,
    Phong,
    Standard,
    /// Writes depth only; used for shadow casters and depth pre-passes.
    Depth,
    Shader(CustomShader),
}

impl MaterialKind {
    /// Template / program family name.
    #[must_use]
    pub fn shader_id(&self) -> Cow<'static, str> {
        match self {
            MaterialKind::Basic => Cow::Borrowed("basic"),
            MaterialKind::Lambert => Cow::Borrowed("lambert"),
            MaterialKind::Phong => Cow::Borrowed("phong"),
            MaterialKind::Standard => Cow::Borrowed("standard"),
            MaterialKind::Depth => Cow::Borrowed("depth"),
            MaterialKind::Shader(s) => Cow::Owned(format!("shader:{}", s.name)),
        }
    }

    #[must_use]
    pub fn is_lit(&self) -> bool {
        matches!(
            self,
            MaterialKind::Lambert | MaterialKind::Phong | MaterialKind::Standard
        )
    }

    /// Declared properties and their defaults.
    fn properties(&self) -> Vec<(&'static str, UniformValue)> {
        let mut props = vec![
            ("opacity", UniformValue::Float(1.0)),
            ("map", UniformValue::Texture(None)),
            ("alphaMap", UniformValue::Texture(None)),
        ];
        match self {
            MaterialKind::Depth | MaterialKind::Shader(_) => {}
            MaterialKind::Basic => {
                props.push(("diffuse", UniformValue::Vec3(Vec3::ONE)));
            }
            MaterialKind::Lambert => {
                props.push(("diffuse", UniformValue::Vec3(Vec3::ONE)));
                props.extend(emissive_props());
            }
            MaterialKind::Phong => {
                props.push(("diffuse", UniformValue::Vec3(Vec3::ONE)));
                props.extend(emissive_props());
                props.extend([
                    ("specular", UniformValue::Vec3(Vec3::splat(0.066_666_67))),
                    ("shininess", UniformValue::Float(30.0)),
                    ("normalMap", UniformValue::Texture(None)),
                    ("normalScale", UniformValue::Vec2(Vec2::ONE)),
                ]);
            }
            MaterialKind::Standard => {
                props.push(("diffuse", UniformValue::Vec3(Vec3::ONE)));
                props.extend(emissive_props());
                props.extend([
                    ("roughness", UniformValue::Float(1.0)),
                    ("metalness", UniformValue::Float(0.0)),
                    ("roughnessMap", UniformValue::Texture(None)),
                    ("metalnessMap", UniformValue::Texture(None)),
                    ("normalMap", UniformValue::Texture(None)),
                    ("normalScale", UniformValue::Vec2(Vec2::ONE)),
                    ("ior", UniformValue::Float(1.5)),
                    ("thickness", UniformValue::Float(0.0)),
                    ("transmissionMap", UniformValue::Texture(None)),
                ]);
            }
        }
        props
    }
}

fn emissive_props() -> [(&'static str, UniformValue); 2] {
    [
        ("emissive", UniformValue::Vec3(Vec3::ZERO)),
        ("emissiveMap", UniformValue::Texture(None)),
    ]
}

// ============================================================================
// Material
// ============================================================================

#[derive(Debug, Clone)]
pub struct Material {
    pub name: Cow<'static, str>,
    kind: MaterialKind,
    uniforms: UniformMap,
    settings: MaterialSettings,
    uniform_groups: Vec<UniformGroupHandle>,
    version: u64,
}

impl Material {
    #[must_use]
    pub fn new(kind: MaterialKind) -> Self {
        let uniforms = kind
            .properties()
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect();
        Self {
            name: Cow::Borrowed("Material"),
            kind,
            uniforms,
            settings: MaterialSettings::default(),
            uniform_groups: Vec::new(),
            version: 1,
        }
    }

    #[must_use]
    pub fn new_basic(color: Vec3) -> Self {
        Self::new(MaterialKind::Basic).with_color(color)
    }

    #[must_use]
    pub fn new_lambert(color: Vec3) -> Self {
        Self::new(MaterialKind::Lambert).with_color(color)
    }

    #[must_use]
    pub fn new_phong(color: Vec3) -> Self {
        Self::new(MaterialKind::Phong).with_color(color)
    }

    #[must_use]
    pub fn new_standard(color: Vec3) -> Self {
        Self::new(MaterialKind::Standard).with_color(color)
    }

    #[must_use]
    pub fn new_depth() -> Self {
        Self::new(MaterialKind::Depth)
    }

    #[must_use]
    pub fn new_shader(name: impl Into<Cow<'static, str>>, source: impl Into<String>) -> Self {
        Self::new(MaterialKind::Shader(CustomShader {
            name: name.into(),
            source: source.into(),
        }))
    }

    fn with_color(mut self, color: Vec3) -> Self {
        self.uniforms.insert("diffuse".to_owned(), UniformValue::Vec3(color));
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Marks the material transparent with the given opacity.
    #[must_use]
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.uniforms.insert("opacity".to_owned(), UniformValue::Float(opacity));
        self.settings.transparent = true;
        self.settings.depth_write = false;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: MaterialSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &MaterialKind {
        &self.kind
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Assigns a property.
    ///
    /// Built-in kinds only accept their declared properties, and a value must
    /// keep the property's type. Custom shader materials accept any name; an
    /// existing name still keeps its type. The version changes only when the
    /// stored value changes.
    pub fn set_value(&mut self, name: &str, value: impl Into<UniformValue>) -> Result<()> {
        let value = value.into();
        match self.uniforms.get_mut(name) {
            Some(slot) if slot.kind() != value.kind() => Err(TrellisError::UniformTypeMismatch {
                property: name.to_owned(),
                expected: slot.kind(),
                found: value.kind(),
            }),
            Some(slot) => {
                if *slot != value {
                    *slot = value;
                    self.version = self.version.wrapping_add(1);
                }
                Ok(())
            }
            None if matches!(self.kind, MaterialKind::Shader(_)) => {
                self.uniforms.insert(name.to_owned(), value);
                self.version = self.version.wrapping_add(1);
                Ok(())
            }
            None => {
                warn!("Material '{}': unknown property '{}' for {:?}", self.name, name, self.kind.shader_id());
                Err(TrellisError::UnknownMaterialProperty {
                    material: self.name.to_string(),
                    property: name.to_owned(),
                })
            }
        }
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms.get(name)
    }

    #[must_use]
    pub fn uniforms(&self) -> &UniformMap {
        &self.uniforms
    }

    /// Texture handles referenced by the material, with their property names.
    pub fn textures(&self) -> impl Iterator<Item = (&str, TextureHandle)> {
        self.uniforms
            .iter()
            .filter_map(|(name, v)| v.as_texture().map(|t| (name.as_str(), t)))
    }

    fn has_texture(&self, name: &str) -> bool {
        self.uniforms.get(name).and_then(UniformValue::as_texture).is_some()
    }

    #[must_use]
    pub fn color(&self) -> Vec3 {
        self.uniforms
            .get("diffuse")
            .and_then(UniformValue::as_vec3)
            .unwrap_or(Vec3::ONE)
    }

    pub fn set_color(&mut self, color: Vec3) -> Result<()> {
        self.set_value("diffuse", color)
    }

    #[must_use]
    pub fn opacity(&self) -> f32 {
        self.uniforms
            .get("opacity")
            .and_then(UniformValue::as_f32)
            .unwrap_or(1.0)
    }

    pub fn set_opacity(&mut self, opacity: f32) -> Result<()> {
        self.set_value("opacity", opacity)
    }

    pub fn set_map(&mut self, texture: Option<TextureHandle>) -> Result<()> {
        self.set_value("map", UniformValue::Texture(texture))
    }

    // ========================================================================
    // Settings & groups
    // ========================================================================

    #[must_use]
    pub fn settings(&self) -> &MaterialSettings {
        &self.settings
    }

    /// Mutable settings; the version is bumped when the guard drops.
    pub fn settings_mut(&mut self) -> MutGuard<'_, MaterialSettings> {
        MutGuard::new(&mut self.settings, &mut self.version)
    }

    pub fn add_uniform_group(&mut self, group: UniformGroupHandle) {
        if !self.uniform_groups.contains(&group) {
            self.uniform_groups.push(group);
            self.version = self.version.wrapping_add(1);
        }
    }

    #[must_use]
    pub fn uniform_groups(&self) -> &[UniformGroupHandle] {
        &self.uniform_groups
    }

    #[must_use]
    pub fn is_transmissive(&self) -> bool {
        self.settings.transmission > 0.0
    }

    #[must_use]
    pub fn is_transparent(&self) -> bool {
        self.settings.transparent
    }

    /// Shader features implied by the current properties and settings.
    #[must_use]
    pub fn features(&self) -> MaterialFeatures {
        let mut f = MaterialFeatures::empty();
        let s = &self.settings;

        f.set(MaterialFeatures::USE_MAP, self.has_texture("map"));
        f.set(MaterialFeatures::USE_ALPHA_MAP, self.has_texture("alphaMap"));
        f.set(MaterialFeatures::USE_NORMAL_MAP, self.has_texture("normalMap"));
        f.set(MaterialFeatures::USE_ROUGHNESS_MAP, self.has_texture("roughnessMap"));
        f.set(MaterialFeatures::USE_METALNESS_MAP, self.has_texture("metalnessMap"));
        f.set(MaterialFeatures::USE_EMISSIVE_MAP, self.has_texture("emissiveMap"));
        f.set(MaterialFeatures::USE_TRANSMISSION, self.is_transmissive());
        f.set(
            MaterialFeatures::USE_TRANSMISSION_MAP,
            self.is_transmissive() && self.has_texture("transmissionMap"),
        );
        f.set(MaterialFeatures::ALPHA_TEST, s.alpha_test > 0.0);
        f.set(MaterialFeatures::VERTEX_COLORS, s.vertex_colors);
        f.set(MaterialFeatures::FLAT_SHADING, s.flat_shading);
        f.set(MaterialFeatures::DOUBLE_SIDED, s.side == Side::Double);
        f.set(MaterialFeatures::BACK_SIDE, s.side == Side::Back);
        f.set(MaterialFeatures::PREMULTIPLIED_ALPHA, s.premultiplied_alpha);
        f.set(MaterialFeatures::FOG, s.fog);
        f.set(MaterialFeatures::TONE_MAPPED, s.tone_mapped);
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    #[test]
    fn test_unknown_property_is_rejected() {
        let mut mat = Material::new_basic(Vec3::ONE);
        let v0 = mat.version();
        let err = mat.set_value("roughness", 0.5_f32).unwrap_err();
        assert!(matches!(err, TrellisError::UnknownMaterialProperty { .. }));
        assert_eq!(mat.version(), v0);
        assert!(mat.value("roughness").is_none());
    }

    #[test]
    fn test_type_mismatch() {
        let mut mat = Material::new_standard(Vec3::ONE);
        assert!(matches!(
            mat.set_value("roughness", Vec3::ONE),
            Err(TrellisError::UniformTypeMismatch { .. })
        ));
        assert!(mat.set_value("roughness", 0.25_f32).is_ok());
    }

    #[test]
    fn test_version_bumps_only_on_change() {
        let mut mat = Material::new_phong(Vec3::ONE);
        let v0 = mat.version();
        mat.set_color(Vec3::ONE).unwrap();
        assert_eq!(mat.version(), v0);
        mat.set_color(Vec3::X).unwrap();
        assert_eq!(mat.version(), v0 + 1);

        mat.settings_mut().side = Side::Double;
        assert_eq!(mat.version(), v0 + 2);
    }

    #[test]
    fn test_shader_material_accepts_any_property() {
        let mut mat = Material::new_shader("wave", "fn vs_main() {} fn fs_main() {}");
        mat.set_value("amplitude", 2.0_f32).unwrap();
        assert!(mat.set_value("amplitude", Vec2::ONE).is_err());
    }

    #[test]
    fn test_features_follow_maps_and_settings() {
        let mut mat = Material::new_standard(Vec3::ONE);
        assert!(!mat.features().contains(MaterialFeatures::USE_MAP));

        let texture = TextureHandle::from(KeyData::from_ffi(1));
        mat.set_map(Some(texture)).unwrap();
        mat.settings_mut().transmission = 0.5;

        let f = mat.features();
        assert!(f.contains(MaterialFeatures::USE_MAP));
        assert!(f.contains(MaterialFeatures::USE_TRANSMISSION));
        assert!(mat.is_transmissive());
    }
}
