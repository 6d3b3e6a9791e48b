use glam::{Vec2, Vec3, Vec4};

use crate::resources::version_tracker::{UpdateRange, UpdateRanges};

/// Component type of an attribute array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    F32,
    U32,
    U16,
    U8,
    I32,
    I16,
    I8,
}

impl ComponentType {
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            ComponentType::F32 | ComponentType::U32 | ComponentType::I32 => 4,
            ComponentType::U16 | ComponentType::I16 => 2,
            ComponentType::U8 | ComponentType::I8 => 1,
        }
    }
}

/// Typed backing storage of an [`Attribute`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeData {
    F32(Vec<f32>),
    U32(Vec<u32>),
    U16(Vec<u16>),
    U8(Vec<u8>),
    I32(Vec<i32>),
    I16(Vec<i16>),
    I8(Vec<i8>),
}

impl AttributeData {
    /// Number of scalar components.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            AttributeData::F32(v) => v.len(),
            AttributeData::U32(v) => v.len(),
            AttributeData::U16(v) => v.len(),
            AttributeData::U8(v) => v.len(),
            AttributeData::I32(v) => v.len(),
            AttributeData::I16(v) => v.len(),
            AttributeData::I8(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn component_type(&self) -> ComponentType {
        match self {
            AttributeData::F32(_) => ComponentType::F32,
            AttributeData::U32(_) => ComponentType::U32,
            AttributeData::U16(_) => ComponentType::U16,
            AttributeData::U8(_) => ComponentType::U8,
            AttributeData::I32(_) => ComponentType::I32,
            AttributeData::I16(_) => ComponentType::I16,
            AttributeData::I8(_) => ComponentType::I8,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeData::F32(v) => bytemuck::cast_slice(v),
            AttributeData::U32(v) => bytemuck::cast_slice(v),
            AttributeData::U16(v) => bytemuck::cast_slice(v),
            AttributeData::U8(v) => v,
            AttributeData::I32(v) => bytemuck::cast_slice(v),
            AttributeData::I16(v) => bytemuck::cast_slice(v),
            AttributeData::I8(v) => bytemuck::cast_slice(v),
        }
    }

    /// Component `i` as f32, mapped to `[0, 1]` / `[-1, 1]` when `normalized`.
    #[must_use]
    pub fn get_f32(&self, i: usize, normalized: bool) -> Option<f32> {
        let (raw, max) = match self {
            AttributeData::F32(v) => return v.get(i).copied(),
            AttributeData::U32(v) => (*v.get(i)? as f32, u32::MAX as f32),
            AttributeData::U16(v) => (f32::from(*v.get(i)?), f32::from(u16::MAX)),
            AttributeData::U8(v) => (f32::from(*v.get(i)?), f32::from(u8::MAX)),
            AttributeData::I32(v) => (*v.get(i)? as f32, i32::MAX as f32),
            AttributeData::I16(v) => (f32::from(*v.get(i)?), f32::from(i16::MAX)),
            AttributeData::I8(v) => (f32::from(*v.get(i)?), f32::from(i8::MAX)),
        };
        Some(if normalized { (raw / max).max(-1.0) } else { raw })
    }

    /// Component `i` as an unsigned index.
    #[must_use]
    pub fn get_u32(&self, i: usize) -> Option<u32> {
        match self {
            AttributeData::U32(v) => v.get(i).copied(),
            AttributeData::U16(v) => v.get(i).map(|&x| u32::from(x)),
            AttributeData::U8(v) => v.get(i).map(|&x| u32::from(x)),
            _ => None,
        }
    }
}

/// Vertex format description used to key vertex layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeFormat {
    pub component: ComponentType,
    pub item_size: u32,
    pub normalized: bool,
}

/// A per-vertex (or index) array with its item size and a version.
///
/// [`Attribute::set_data`] asks for a full re-upload. [`Attribute::write_f32`]
/// patches a sub-range in place and records it so only that range is sent.
#[derive(Debug, Clone)]
pub struct Attribute {
    data: AttributeData,
    item_size: u32,
    pub normalized: bool,
    version: u64,
    ranges: UpdateRanges,
}

impl Attribute {
    #[must_use]
    pub fn new(data: AttributeData, item_size: u32) -> Self {
        Self {
            data,
            item_size: item_size.max(1),
            normalized: false,
            version: 1,
            ranges: UpdateRanges::new(1),
        }
    }

    #[must_use]
    pub fn f32(data: Vec<f32>, item_size: u32) -> Self {
        Self::new(AttributeData::F32(data), item_size)
    }

    #[must_use]
    pub fn from_vec2(values: &[Vec2]) -> Self {
        Self::f32(values.iter().flat_map(|v| v.to_array()).collect(), 2)
    }

    #[must_use]
    pub fn from_vec3(values: &[Vec3]) -> Self {
        Self::f32(values.iter().flat_map(|v| v.to_array()).collect(), 3)
    }

    #[must_use]
    pub fn from_vec4(values: &[Vec4]) -> Self {
        Self::f32(values.iter().flat_map(|v| v.to_array()).collect(), 4)
    }

    #[must_use]
    pub fn data(&self) -> &AttributeData {
        &self.data
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    #[must_use]
    pub fn item_size(&self) -> u32 {
        self.item_size
    }

    /// Number of items (vertices, or indices for an index attribute).
    #[must_use]
    pub fn count(&self) -> usize {
        self.data.len() / self.item_size as usize
    }

    #[must_use]
    pub fn format(&self) -> AttributeFormat {
        AttributeFormat {
            component: self.data.component_type(),
            item_size: self.item_size,
            normalized: self.normalized,
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replaces the whole array.
    pub fn set_data(&mut self, data: AttributeData) {
        self.data = data;
        self.version = self.version.wrapping_add(1);
        self.ranges.reset(self.version);
    }

    /// Overwrites f32 components starting at component `offset`.
    ///
    /// Returns false, changing nothing, for non-f32 data or an out-of-range write.
    pub fn write_f32(&mut self, offset: usize, values: &[f32]) -> bool {
        let AttributeData::F32(data) = &mut self.data else {
            return false;
        };
        let end = offset + values.len();
        if end > data.len() {
            return false;
        }
        data[offset..end].copy_from_slice(values);
        self.version = self.version.wrapping_add(1);
        self.ranges.record(offset, values.len(), self.version);
        true
    }

    /// Flags the whole array for re-upload after an external edit.
    pub fn needs_update(&mut self) {
        self.version = self.version.wrapping_add(1);
        self.ranges.reset(self.version);
    }

    #[must_use]
    pub fn update_ranges(&self) -> &[UpdateRange] {
        self.ranges.as_slice()
    }

    /// Component ranges still missing on a cache that uploaded at
    /// `cached_version`, or `None` when a full upload is required.
    #[must_use]
    pub fn pending_ranges(&self, cached_version: u64) -> Option<Vec<UpdateRange>> {
        self.ranges.pending_since(cached_version)
    }

    #[must_use]
    pub fn get_component(&self, item: usize, component: usize) -> Option<f32> {
        if component >= self.item_size as usize {
            return None;
        }
        self.data
            .get_f32(item * self.item_size as usize + component, self.normalized)
    }

    /// First three components of `item`; missing components read as zero.
    #[must_use]
    pub fn get_vec3(&self, item: usize) -> Option<Vec3> {
        let x = self.get_component(item, 0)?;
        Some(Vec3::new(
            x,
            self.get_component(item, 1).unwrap_or(0.0),
            self.get_component(item, 2).unwrap_or(0.0),
        ))
    }
}
