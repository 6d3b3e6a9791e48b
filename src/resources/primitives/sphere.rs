use std::f32::consts::PI;

use glam::{Vec2, Vec3};

use crate::resources::attribute::Attribute;
use crate::resources::geometry::Geometry;

#[derive(Debug, Clone, Copy)]
pub struct SphereOptions {
    pub radius: f32,
    pub width_segments: u32,
    pub height_segments: u32,
}

impl Default for SphereOptions {
    fn default() -> Self {
        Self {
            radius: 1.0,
            width_segments: 32,
            height_segments: 16,
        }
    }
}

/// UV sphere. Rings run from the north pole (v = 0) to the south pole.
#[must_use]
pub fn create_sphere(options: SphereOptions) -> Geometry {
    let radius = options.radius;
    let width_segments = options.width_segments.max(3);
    let height_segments = options.height_segments.max(2);
    let stride = width_segments + 1;

    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut uvs = Vec::new();

    for iy in 0..=height_segments {
        let v = iy as f32 / height_segments as f32;
        let theta = v * PI;
        for ix in 0..=width_segments {
            let u = ix as f32 / width_segments as f32;
            let phi = u * 2.0 * PI;

            let normal = Vec3::new(-phi.cos() * theta.sin(), theta.cos(), phi.sin() * theta.sin());
            positions.push(normal * radius);
            normals.push(normal);
            uvs.push(Vec2::new(u, 1.0 - v));
        }
    }

    let mut indices = Vec::new();
    for iy in 0..height_segments {
        for ix in 0..width_segments {
            let a = iy * stride + ix + 1;
            let b = iy * stride + ix;
            let c = (iy + 1) * stride + ix;
            let d = (iy + 1) * stride + ix + 1;

            // The pole rows collapse to a point; skip their zero-area halves.
            if iy != 0 {
                indices.extend_from_slice(&[a, b, d]);
            }
            if iy != height_segments - 1 {
                indices.extend_from_slice(&[b, c, d]);
            }
        }
    }

    let mut geo = Geometry::new();
    geo.name = "Sphere".into();
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
    fn test_sphere_bounds() {
        let geo = create_sphere(SphereOptions {
            radius: 2.0,
            ..Default::default()
        });
        assert!(geo.validate().is_ok());
        let sphere = geo.bounding_sphere();
        assert!(sphere.center.length() < 1e-4);
        assert!((sphere.radius - 2.0).abs() < 1e-3);
    }
}
