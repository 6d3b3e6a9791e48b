use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Range;

use glam::Vec3;

use crate::errors::{Result, TrellisError};
use crate::math::{Box3, Sphere};
use crate::resources::attribute::{Attribute, AttributeData};

/// A sub-range of the draw drawn with one material slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryGroup {
    pub start: u32,
    pub count: u32,
    pub material_index: usize,
}

/// Vertex attributes, optional index, draw range and material groups.
///
/// Bounding volumes are computed from the `position` attribute on first use
/// and cached until a position write invalidates them.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub name: Cow<'static, str>,
    attributes: BTreeMap<String, Attribute>,
    index: Option<Attribute>,
    draw_start: u32,
    draw_count: u32,
    groups: Vec<GeometryGroup>,
    /// Bumped when the set of attributes (the vertex layout) changes.
    layout_version: u64,

    bounding_box: RefCell<Option<Box3>>,
    bounding_sphere: RefCell<Option<Sphere>>,
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new()
    }
}

impl Geometry {
    pub const POSITION: &'static str = "position";
    pub const NORMAL: &'static str = "normal";
    pub const UV: &'static str = "uv";
    pub const COLOR: &'static str = "color";

    #[must_use]
    pub fn new() -> Self {
        Self {
            name: Cow::Borrowed("Geometry"),
            attributes: BTreeMap::new(),
            index: None,
            draw_start: 0,
            draw_count: u32::MAX,
            groups: Vec::new(),
            layout_version: 1,
            bounding_box: RefCell::new(None),
            bounding_sphere: RefCell::new(None),
        }
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    pub fn set_attribute(&mut self, name: &str, attribute: Attribute) {
        if name == Self::POSITION {
            self.invalidate_bounds();
        }
        let layout_changed = self
            .attributes
            .get(name)
            .is_none_or(|old| old.format() != attribute.format());
        self.attributes.insert(name.to_owned(), attribute);
        if layout_changed {
            self.layout_version = self.layout_version.wrapping_add(1);
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        let removed = self.attributes.remove(name);
        if removed.is_some() {
            if name == Self::POSITION {
                self.invalidate_bounds();
            }
            self.layout_version = self.layout_version.wrapping_add(1);
        }
        removed
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Mutable access. Borrowing `position` mutably drops the cached bounds.
    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        if name == Self::POSITION {
            self.invalidate_bounds();
        }
        self.attributes.get_mut(name)
    }

    #[must_use]
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn layout_version(&self) -> u64 {
        self.layout_version
    }

    // ========================================================================
    // Index
    // ========================================================================

    /// Stores indices as u16 when every value fits, u32 otherwise.
    pub fn set_index(&mut self, indices: Vec<u32>) {
        let data = if indices.iter().all(|&i| i < u32::from(u16::MAX)) {
            AttributeData::U16(indices.into_iter().map(|i| i as u16).collect())
        } else {
            AttributeData::U32(indices)
        };
        let index = Attribute::new(data, 1);
        let layout_changed = self
            .index
            .as_ref()
            .is_none_or(|old| old.format() != index.format());
        self.index = Some(index);
        if layout_changed {
            self.layout_version = self.layout_version.wrapping_add(1);
        }
    }

    #[must_use]
    pub fn index(&self) -> Option<&Attribute> {
        self.index.as_ref()
    }

    pub fn index_mut(&mut self) -> Option<&mut Attribute> {
        self.index.as_mut()
    }

    // ========================================================================
    // Draw range & groups
    // ========================================================================

    /// `count = u32::MAX` draws to the end.
    pub fn set_draw_range(&mut self, start: u32, count: u32) {
        self.draw_start = start;
        self.draw_count = count;
    }

    pub fn add_group(&mut self, start: u32, count: u32, material_index: usize) {
        self.groups.push(GeometryGroup {
            start,
            count,
            material_index,
        });
    }

    pub fn clear_groups(&mut self) {
        self.groups.clear();
    }

    #[must_use]
    pub fn groups(&self) -> &[GeometryGroup] {
        &self.groups
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.attributes.get(Self::POSITION).map_or(0, Attribute::count)
    }

    /// Indices (or vertices when unindexed) available to draw.
    #[must_use]
    pub fn element_count(&self) -> u32 {
        match &self.index {
            Some(index) => index.count() as u32,
            None => self.vertex_count() as u32,
        }
    }

    /// Draw range clipped to the available elements.
    #[must_use]
    pub fn draw_range(&self) -> Range<u32> {
        let total = self.element_count();
        let start = self.draw_start.min(total);
        let end = start.saturating_add(self.draw_count).min(total);
        start..end
    }

    /// Intersection of the draw range and a group.
    #[must_use]
    pub fn group_range(&self, group: &GeometryGroup) -> Range<u32> {
        let range = self.draw_range();
        let start = group.start.max(range.start);
        let end = group.start.saturating_add(group.count).min(range.end);
        start..end.max(start)
    }

    /// No triangles to draw, or all vertices coincide.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        let range = self.draw_range();
        if range.end - range.start < 3 {
            return true;
        }
        let sphere = self.bounding_sphere();
        sphere.is_empty() || sphere.radius <= f32::EPSILON
    }

    // ========================================================================
    // Validation & derived data
    // ========================================================================

    /// Checks item sizes, per-attribute vertex counts and index bounds.
    pub fn validate(&self) -> Result<()> {
        let expected = self.vertex_count();
        for (name, attr) in &self.attributes {
            let len = attr.data().len();
            if len % attr.item_size() as usize != 0 {
                return Err(TrellisError::AttributeSize {
                    name: name.clone(),
                    len,
                    item_size: attr.item_size(),
                });
            }
            if attr.count() != expected {
                return Err(TrellisError::AttributeCountMismatch {
                    name: name.clone(),
                    count: attr.count(),
                    expected,
                });
            }
        }
        if let Some(index) = &self.index {
            for position in 0..index.count() {
                let Some(value) = index.data().get_u32(position) else {
                    continue;
                };
                if value as usize >= expected {
                    return Err(TrellisError::IndexOutOfRange {
                        position,
                        index: value,
                        vertex_count: expected,
                    });
                }
            }
        }
        Ok(())
    }

    fn invalidate_bounds(&self) {
        *self.bounding_box.borrow_mut() = None;
        *self.bounding_sphere.borrow_mut() = None;
    }

    fn positions(&self) -> Vec<Vec3> {
        let Some(position) = self.attributes.get(Self::POSITION) else {
            return Vec::new();
        };
        (0..position.count())
            .filter_map(|i| position.get_vec3(i))
            .collect()
    }

    #[must_use]
    pub fn compute_bounding_box(&self) -> Box3 {
        Box3::from_points(self.positions())
    }

    #[must_use]
    pub fn compute_bounding_sphere(&self) -> Sphere {
        Sphere::from_points(&self.positions())
    }

    /// Cached local-space bounding box.
    #[must_use]
    pub fn bounding_box(&self) -> Box3 {
        if let Some(b) = *self.bounding_box.borrow() {
            return b;
        }
        let b = self.compute_bounding_box();
        *self.bounding_box.borrow_mut() = Some(b);
        b
    }

    /// Cached local-space bounding sphere.
    #[must_use]
    pub fn bounding_sphere(&self) -> Sphere {
        if let Some(s) = *self.bounding_sphere.borrow() {
            return s;
        }
        let s = self.compute_bounding_sphere();
        *self.bounding_sphere.borrow_mut() = Some(s);
        s
    }

    /// Area-weighted smooth normals for indexed geometry, flat face normals
    /// otherwise. Replaces any existing `normal` attribute.
    pub fn compute_vertex_normals(&mut self) {
        let positions = self.positions();
        if positions.is_empty() {
            return;
        }
        let mut normals = vec![Vec3::ZERO; positions.len()];

        let triangles: Vec<[usize; 3]> = match &self.index {
            Some(index) => (0..index.count() / 3)
                .filter_map(|t| {
                    let a = index.data().get_u32(t * 3)? as usize;
                    let b = index.data().get_u32(t * 3 + 1)? as usize;
                    let c = index.data().get_u32(t * 3 + 2)? as usize;
                    Some([a, b, c])
                })
                .collect(),
            None => (0..positions.len() / 3).map(|t| [t * 3, t * 3 + 1, t * 3 + 2]).collect(),
        };

        for [a, b, c] in triangles {
            let (Some(pa), Some(pb), Some(pc)) = (positions.get(a), positions.get(b), positions.get(c)) else {
                continue;
            };
            // Unnormalized cross product weights by triangle area.
            let face = (*pc - *pb).cross(*pa - *pb);
            normals[a] += face;
            normals[b] += face;
            normals[c] += face;
        }

        let normals: Vec<Vec3> = normals.into_iter().map(Vec3::normalize_or_zero).collect();
        self.set_attribute(Self::NORMAL, Attribute::from_vec3(&normals));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Geometry {
        let mut g = Geometry::new();
        g.set_attribute(
            Geometry::POSITION,
            Attribute::from_vec3(&[Vec3::ZERO, Vec3::X, Vec3::Y]),
        );
        g
    }

    #[test]
    fn test_bounds_invalidated_by_position_write() {
        let mut g = triangle();
        assert_eq!(g.bounding_box().max, Vec3::new(1.0, 1.0, 0.0));

        g.attribute_mut(Geometry::POSITION)
            .unwrap()
            .write_f32(0, &[-2.0, 0.0, 0.0]);
        assert_eq!(g.bounding_box().min.x, -2.0);
    }

    #[test]
    fn test_validate_index_range() {
        let mut g = triangle();
        g.set_index(vec![0, 1, 2]);
        assert!(g.validate().is_ok());

        g.set_index(vec![0, 1, 3]);
        assert!(matches!(
            g.validate(),
            Err(TrellisError::IndexOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn test_validate_item_size() {
        let mut g = triangle();
        g.set_attribute(Geometry::UV, Attribute::f32(vec![0.0; 5], 2));
        assert!(matches!(g.validate(), Err(TrellisError::AttributeSize { .. })));
    }

    #[test]
    fn test_draw_range_and_groups() {
        let mut g = triangle();
        g.set_index(vec![0, 1, 2, 2, 1, 0]);
        assert_eq!(g.draw_range(), 0..6);

        g.set_draw_range(3, 100);
        assert_eq!(g.draw_range(), 3..6);

        let group = GeometryGroup {
            start: 0,
            count: 4,
            material_index: 0,
        };
        assert_eq!(g.group_range(&group), 3..4);
    }

    #[test]
    fn test_degenerate() {
        let mut g = Geometry::new();
        assert!(g.is_degenerate());

        g.set_attribute(Geometry::POSITION, Attribute::from_vec3(&[Vec3::ONE; 3]));
        assert!(g.is_degenerate(), "coincident vertices have zero size");

        assert!(!triangle().is_degenerate());
    }

    #[test]
    fn test_vertex_normals_face_ccw() {
        let mut g = triangle();
        g.compute_vertex_normals();
        let n = g.attribute(Geometry::NORMAL).unwrap().get_vec3(0).unwrap();
        assert!((n - Vec3::Z).length() < 1e-6);
    }
}
