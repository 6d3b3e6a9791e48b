//! Typed uniform values.
//!
//! Materials and uniform groups store parameters as a tagged union instead of
//! an open property bag. Every value knows its [`UniformKind`], which drives
//! type checking on assignment, the WGSL declaration emitted for it, and its
//! position inside a uniform block.

use std::collections::BTreeMap;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};

use crate::assets::TextureHandle;
use crate::errors::{Result, TrellisError};

/// Type tag of a [`UniformValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Float,
    Int,
    UInt,
    Bool,
    Vec2,
    Vec3,
    Vec4,
    Mat3,
    Mat4,
    Texture,
    FloatArray,
    Vec4Array,
}

impl UniformKind {
    /// WGSL type of a uniform-block member, `None` for textures.
    #[must_use]
    pub fn wgsl_type(self, array_len: usize) -> Option<String> {
        let ty = match self {
            UniformKind::Float => "f32".to_owned(),
            UniformKind::Int => "i32".to_owned(),
            UniformKind::UInt | UniformKind::Bool => "u32".to_owned(),
            UniformKind::Vec2 => "vec2<f32>".to_owned(),
            UniformKind::Vec3 => "vec3<f32>".to_owned(),
            UniformKind::Vec4 => "vec4<f32>".to_owned(),
            UniformKind::Mat3 => "mat3x3<f32>".to_owned(),
            UniformKind::Mat4 => "mat4x4<f32>".to_owned(),
            // Scalars in a uniform array need a 16-byte stride.
            UniformKind::FloatArray => format!("array<vec4<f32>, {}>", array_len.max(1)),
            UniformKind::Vec4Array => format!("array<vec4<f32>, {}>", array_len.max(1)),
            UniformKind::Texture => return None,
        };
        Some(ty)
    }

    /// (alignment, size) of one member in a uniform block.
    #[must_use]
    pub fn layout(self, array_len: usize) -> Option<(usize, usize)> {
        Some(match self {
            UniformKind::Float | UniformKind::Int | UniformKind::UInt | UniformKind::Bool => (4, 4),
            UniformKind::Vec2 => (8, 8),
            UniformKind::Vec3 => (16, 12),
            UniformKind::Vec4 => (16, 16),
            UniformKind::Mat3 => (16, 48),
            UniformKind::Mat4 => (16, 64),
            UniformKind::FloatArray | UniformKind::Vec4Array => (16, 16 * array_len.max(1)),
            UniformKind::Texture => return None,
        })
    }
}

/// A single shader parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    UInt(u32),
    Bool(bool),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat3(Mat3),
    Mat4(Mat4),
    Texture(Option<TextureHandle>),
    FloatArray(Vec<f32>),
    Vec4Array(Vec<Vec4>),
}

impl UniformValue {
    #[must_use]
    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::Float(_) => UniformKind::Float,
            UniformValue::Int(_) => UniformKind::Int,
            UniformValue::UInt(_) => UniformKind::UInt,
            UniformValue::Bool(_) => UniformKind::Bool,
            UniformValue::Vec2(_) => UniformKind::Vec2,
            UniformValue::Vec3(_) => UniformKind::Vec3,
            UniformValue::Vec4(_) => UniformKind::Vec4,
            UniformValue::Mat3(_) => UniformKind::Mat3,
            UniformValue::Mat4(_) => UniformKind::Mat4,
            UniformValue::Texture(_) => UniformKind::Texture,
            UniformValue::FloatArray(_) => UniformKind::FloatArray,
            UniformValue::Vec4Array(_) => UniformKind::Vec4Array,
        }
    }

    /// Element count for arrays, 1 otherwise.
    #[must_use]
    pub fn array_len(&self) -> usize {
        match self {
            UniformValue::FloatArray(v) => v.len(),
            UniformValue::Vec4Array(v) => v.len(),
            _ => 1,
        }
    }

    #[must_use]
    pub fn as_texture(&self) -> Option<TextureHandle> {
        match self {
            UniformValue::Texture(t) => *t,
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            UniformValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            UniformValue::Vec3(v) => Some(*v),
            _ => None,
        }
    }
}

macro_rules! impl_from_uniform {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for UniformValue {
                fn from(v: $ty) -> Self {
                    UniformValue::$variant(v)
                }
            }
        )*
    };
}

impl_from_uniform! {
    f32 => Float,
    i32 => Int,
    u32 => UInt,
    bool => Bool,
    Vec2 => Vec2,
    Vec3 => Vec3,
    Vec4 => Vec4,
    Mat3 => Mat3,
    Mat4 => Mat4,
    Vec<f32> => FloatArray,
    Vec<Vec4> => Vec4Array,
}

impl From<TextureHandle> for UniformValue {
    fn from(t: TextureHandle) -> Self {
        UniformValue::Texture(Some(t))
    }
}

/// Named uniforms, ordered by name so generated layouts are deterministic.
pub type UniformMap = BTreeMap<String, UniformValue>;

// ============================================================================
// Uniform block packing
// ============================================================================

/// Packs values with WGSL uniform address-space rules (std140-compatible).
#[derive(Debug, Default)]
pub struct UniformBlockWriter {
    bytes: Vec<u8>,
}

impl UniformBlockWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn align_to(&mut self, align: usize) {
        let padded = self.bytes.len().next_multiple_of(align);
        self.bytes.resize(padded, 0);
    }

    fn push_f32s(&mut self, values: &[f32]) {
        self.bytes.extend_from_slice(bytemuck::cast_slice(values));
    }

    pub fn write(&mut self, name: &str, value: &UniformValue) -> Result<()> {
        let kind = value.kind();
        let Some((align, _)) = kind.layout(value.array_len()) else {
            return Err(TrellisError::UnpackableUniform(name.to_owned()));
        };
        self.align_to(align);

        match value {
            UniformValue::Float(v) => self.push_f32s(&[*v]),
            UniformValue::Int(v) => self.bytes.extend_from_slice(&v.to_le_bytes()),
            UniformValue::UInt(v) => self.bytes.extend_from_slice(&v.to_le_bytes()),
            UniformValue::Bool(v) => self.bytes.extend_from_slice(&u32::from(*v).to_le_bytes()),
            UniformValue::Vec2(v) => self.push_f32s(&v.to_array()),
            UniformValue::Vec3(v) => self.push_f32s(&v.to_array()),
            UniformValue::Vec4(v) => self.push_f32s(&v.to_array()),
            UniformValue::Mat3(m) => {
                for col in [m.x_axis, m.y_axis, m.z_axis] {
                    self.push_f32s(&col.extend(0.0).to_array());
                }
            }
            UniformValue::Mat4(m) => self.push_f32s(&m.to_cols_array()),
            UniformValue::FloatArray(values) => {
                for v in values {
                    self.push_f32s(&[*v, 0.0, 0.0, 0.0]);
                }
                if values.is_empty() {
                    self.push_f32s(&[0.0; 4]);
                }
            }
            UniformValue::Vec4Array(values) => {
                for v in values {
                    self.push_f32s(&v.to_array());
                }
                if values.is_empty() {
                    self.push_f32s(&[0.0; 4]);
                }
            }
            UniformValue::Texture(_) => unreachable!("textures have no block layout"),
        }
        Ok(())
    }

    /// Pads the block to a 16-byte multiple.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        self.align_to(16);
        self.bytes
    }
}

/// Packs `values` in iteration order.
pub fn pack_uniform_block<'a>(values: impl IntoIterator<Item = (&'a str, &'a UniformValue)>) -> Result<Vec<u8>> {
    let mut writer = UniformBlockWriter::new();
    for (name, value) in values {
        writer.write(name, value)?;
    }
    Ok(writer.finish())
}

// ============================================================================
// Uniform groups
// ============================================================================

/// A named block of uniforms shared by several materials.
///
/// Uploaded once per version by the renderer and bound alongside the
/// material's own uniforms.
#[derive(Debug, Clone)]
pub struct UniformGroup {
    pub name: String,
    values: Vec<(String, UniformValue)>,
    version: u64,
}

impl UniformGroup {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            version: 1,
        }
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<UniformValue>) -> Self {
        self.values.push((name.to_owned(), value.into()));
        self
    }

    /// Updates an existing member or appends a new one. An existing member
    /// keeps its type.
    pub fn set(&mut self, name: &str, value: impl Into<UniformValue>) -> Result<()> {
        let value = value.into();
        if value.kind() == UniformKind::Texture {
            return Err(TrellisError::UnpackableUniform(name.to_owned()));
        }
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) if slot.kind() != value.kind() => Err(TrellisError::UniformTypeMismatch {
                property: name.to_owned(),
                expected: slot.kind(),
                found: value.kind(),
            }),
            Some((_, slot)) => {
                if *slot != value {
                    *slot = value;
                    self.version = self.version.wrapping_add(1);
                }
                Ok(())
            }
            None => {
                self.values.push((name.to_owned(), value));
                self.version = self.version.wrapping_add(1);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&UniformValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &UniformValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        pack_uniform_block(self.values())
    }
}
