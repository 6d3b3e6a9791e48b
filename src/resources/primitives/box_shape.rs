use glam::{Vec2, Vec3};

use crate::resources::attribute::Attribute;
use crate::resources::geometry::Geometry;

/// (normal, u axis, v axis) per face, in material-slot order
/// +X, -X, +Y, -Y, +Z, -Z. `u × v == normal`.
const FACES: [(Vec3, Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Z, Vec3::Y),
    (Vec3::NEG_X, Vec3::Z, Vec3::Y),
    (Vec3::Y, Vec3::X, Vec3::NEG_Z),
    (Vec3::NEG_Y, Vec3::X, Vec3::Z),
    (Vec3::Z, Vec3::X, Vec3::Y),
    (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
];

/// Axis-aligned box centered at the origin.
///
/// Each face is its own geometry group, so a mesh with six materials shades
/// every face separately.
#[must_use]
pub fn create_box(width: f32, height: f32, depth: f32) -> Geometry {
    let half = Vec3::new(width, height, depth) * 0.5;

    let mut positions = Vec::with_capacity(24);
    let mut normals = Vec::with_capacity(24);
    let mut uvs = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    let mut geo = Geometry::new();
    geo.name = "Box".into();

    for (face, (normal, u, v)) in FACES.into_iter().enumerate() {
        let base = positions.len() as u32;
        for (a, b) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            positions.push((normal + u * a + v * b) * half);
            normals.push(normal);
            uvs.push(Vec2::new((a + 1.0) * 0.5, 1.0 - (b + 1.0) * 0.5));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        geo.add_group(face as u32 * 6, 6, face);
    }

    geo.set_attribute(Geometry::POSITION, Attribute::from_vec3(&positions));
    geo.set_attribute(Geometry::NORMAL, Attribute::from_vec3(&normals));
    geo.set_attribute(Geometry::UV, Attribute::from_vec2(&uvs));
    geo.set_index(indices);
    geo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_bounds_and_groups() {
        let geo = create_box(2.0, 4.0, 6.0);
        assert!(geo.validate().is_ok());
        assert_eq!(geo.vertex_count(), 24);
        assert_eq!(geo.groups().len(), 6);
        assert_eq!(geo.bounding_box().max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_box_winding_matches_normals() {
        let mut geo = create_box(1.0, 1.0, 1.0);
        let authored: Vec<Vec3> = (0..24)
            .filter_map(|i| geo.attribute(Geometry::NORMAL).and_then(|a| a.get_vec3(i)))
            .collect();
        geo.compute_vertex_normals();
        let computed = geo.attribute(Geometry::NORMAL).unwrap();
        for (i, n) in authored.iter().enumerate() {
            assert!((computed.get_vec3(i).unwrap() - *n).length() < 1e-5);
        }
    }
}
