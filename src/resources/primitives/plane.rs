use glam::{Vec2, Vec3};

use crate::resources::attribute::Attribute;
use crate::resources::geometry::Geometry;

#[derive(Debug, Clone, Copy)]
pub struct PlaneOptions {
    pub width: f32,
    pub height: f32,
    pub width_segments: u32,
    pub height_segments: u32,
}

impl Default for PlaneOptions {
    fn default() -> Self {
        Self {
            width: 1.0,
            height: 1.0,
            width_segments: 1,
            height_segments: 1,
        }
    }
}

/// Plane in XY facing +Z.
#[must_use]
pub fn create_plane(options: PlaneOptions) -> Geometry {
    let grid_x = options.width_segments.max(1);
    let grid_y = options.height_segments.max(1);
    let grid_x1 = grid_x + 1;

    let segment_width = options.width / grid_x as f32;
    let segment_height = options.height / grid_y as f32;

    let mut positions = Vec::new();
    let mut uvs = Vec::new();
    let mut indices = Vec::new();

    for iy in 0..=grid_y {
        let y = iy as f32 * segment_height - options.height * 0.5;
        for ix in 0..=grid_x {
            let x = ix as f32 * segment_width - options.width * 0.5;
            // Rows run top to bottom so v decreases with iy.
            positions.push(Vec3::new(x, -y, 0.0));
            uvs.push(Vec2::new(ix as f32 / grid_x as f32, 1.0 - iy as f32 / grid_y as f32));
        }
    }

    for iy in 0..grid_y {
        for ix in 0..grid_x {
            let a = ix + grid_x1 * iy;
            let b = ix + grid_x1 * (iy + 1);
            let c = (ix + 1) + grid_x1 * (iy + 1);
            let d = (ix + 1) + grid_x1 * iy;
            indices.extend_from_slice(&[a, b, d, b, c, d]);
        }
    }

    let normals = vec![Vec3::Z; positions.len()];

    let mut geo = Geometry::new();
    geo.name = "Plane".into();
    geo.set_attribute(Geometry::POSITION, Attribute::from_vec3(&positions));
    geo.set_attribute(Geometry::NORMAL, Attribute::from_vec3(&normals));
    geo.set_attribute(Geometry::UV, Attribute::from_vec2(&uvs));
    geo.set_index(indices);
    geo
}
