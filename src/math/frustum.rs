use glam::{Mat4, Vec3, Vec4};

use super::bounds::{Box3, Sphere};

/// Plane in Hessian normal form: `normal · p + constant = 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub constant: f32,
}

impl Default for Plane {
    fn default() -> Self {
        Self {
            normal: Vec3::Y,
            constant: 0.0,
        }
    }
}

impl Plane {
    #[must_use]
    pub const fn new(normal: Vec3, constant: f32) -> Self {
        Self { normal, constant }
    }

    #[must_use]
    pub fn from_normal_and_point(normal: Vec3, point: Vec3) -> Self {
        let normal = normal.normalize();
        Self {
            normal,
            constant: -normal.dot(point),
        }
    }

    /// Builds a normalized plane from `(a, b, c, d)` coefficients.
    #[must_use]
    pub fn from_vec4(v: Vec4) -> Self {
        let len = v.truncate().length();
        if len <= f32::EPSILON {
            return Self::default();
        }
        Self {
            normal: v.truncate() / len,
            constant: v.w / len,
        }
    }

    #[must_use]
    pub fn to_vec4(&self) -> Vec4 {
        self.normal.extend(self.constant)
    }

    #[must_use]
    pub fn distance_to_point(&self, p: Vec3) -> f32 {
        self.normal.dot(p) + self.constant
    }

    /// Transforms the plane by `m`, using the inverse-transpose for the normal.
    #[must_use]
    pub fn transform(&self, m: &Mat4) -> Self {
        Self::from_vec4(m.inverse().transpose() * self.to_vec4())
    }
}

/// Six clip planes, normals pointing inward.
///
/// Extracted from a view-projection matrix with a `[0, 1]` depth range.
#[derive(Debug, Clone, Copy, Default)]
pub struct Frustum {
    planes: [Plane; 6], // Left, Right, Bottom, Top, Near, Far
}

impl Frustum {
    /// Gribb-Hartmann plane extraction.
    #[must_use]
    pub fn from_matrix(m: Mat4) -> Self {
        let rows = [m.row(0), m.row(1), m.row(2), m.row(3)];

        let planes = [
            rows[3] + rows[0],
            rows[3] - rows[0],
            rows[3] + rows[1],
            rows[3] - rows[1],
            // Depth range is [0, 1], so near is the bare z row.
            rows[2],
            rows[3] - rows[2],
        ];

        Self {
            planes: planes.map(Plane::from_vec4),
        }
    }

    #[must_use]
    pub fn planes(&self) -> &[Plane; 6] {
        &self.planes
    }

    #[must_use]
    pub fn intersects_sphere(&self, sphere: &Sphere) -> bool {
        if sphere.is_empty() {
            return false;
        }
        self.planes
            .iter()
            .all(|p| p.distance_to_point(sphere.center) >= -sphere.radius)
    }

    /// Positive-vertex test per plane.
    #[must_use]
    pub fn intersects_box(&self, b: &Box3) -> bool {
        if b.is_empty() {
            return false;
        }
        self.planes.iter().all(|p| {
            let v = Vec3::new(
                if p.normal.x > 0.0 { b.max.x } else { b.min.x },
                if p.normal.y > 0.0 { b.max.y } else { b.min.y },
                if p.normal.z > 0.0 { b.max.z } else { b.min.z },
            );
            p.distance_to_point(v) >= 0.0
        })
    }

    #[must_use]
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.distance_to_point(point) >= 0.0)
    }
}
