use glam::{Affine3A, Vec3};

/// Axis-aligned bounding box.
///
/// An empty box has `min = +inf` and `max = -inf` so that expanding it by any
/// point yields a box containing exactly that point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Box3 {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Box3 {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Box3 {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    #[must_use]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut b = Self::EMPTY;
        for p in points {
            b.expand_by_point(p);
        }
        b
    }

    pub fn expand_by_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max.x < self.min.x || self.max.y < self.min.y || self.max.z < self.min.z
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn size(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            self.max - self.min
        }
    }

    #[must_use]
    pub fn union(&self, other: &Box3) -> Box3 {
        Box3 {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[must_use]
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    #[must_use]
    pub fn intersects_box(&self, other: &Box3) -> bool {
        self.max.cmpge(other.min).all() && self.min.cmple(other.max).all()
    }

    /// Bounds of the eight transformed corners.
    #[must_use]
    pub fn transform(&self, matrix: &Affine3A) -> Self {
        if self.is_empty() {
            return *self;
        }
        let (lo, hi) = (self.min, self.max);
        let corners = [
            Vec3::new(lo.x, lo.y, lo.z),
            Vec3::new(lo.x, lo.y, hi.z),
            Vec3::new(lo.x, hi.y, lo.z),
            Vec3::new(lo.x, hi.y, hi.z),
            Vec3::new(hi.x, lo.y, lo.z),
            Vec3::new(hi.x, lo.y, hi.z),
            Vec3::new(hi.x, hi.y, lo.z),
            Vec3::new(hi.x, hi.y, hi.z),
        ];
        Self::from_points(corners.into_iter().map(|c| matrix.transform_point3(c)))
    }
}

/// Bounding sphere. A negative radius marks an empty sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Default for Sphere {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Sphere {
    pub const EMPTY: Self = Self {
        center: Vec3::ZERO,
        radius: -1.0,
    };

    #[must_use]
    pub const fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.radius < 0.0
    }

    /// Sphere centred on the box that encloses it.
    #[must_use]
    pub fn from_box(b: &Box3) -> Self {
        if b.is_empty() {
            return Self::EMPTY;
        }
        Self {
            center: b.center(),
            radius: b.size().length() * 0.5,
        }
    }

    /// Sphere centred on the bounding box of `points`, with the tightest radius
    /// around that centre.
    #[must_use]
    pub fn from_points(points: &[Vec3]) -> Self {
        let b = Box3::from_points(points.iter().copied());
        if b.is_empty() {
            return Self::EMPTY;
        }
        let center = b.center();
        let max_dist_sq = points
            .iter()
            .map(|p| p.distance_squared(center))
            .fold(0.0_f32, f32::max);
        Self {
            center,
            radius: max_dist_sq.sqrt(),
        }
    }

    /// Transforms the centre and scales the radius by the largest axis scale.
    #[must_use]
    pub fn transform(&self, matrix: &Affine3A) -> Self {
        if self.is_empty() {
            return *self;
        }
        let m = matrix.matrix3;
        let max_scale_sq = m
            .x_axis
            .length_squared()
            .max(m.y_axis.length_squared())
            .max(m.z_axis.length_squared());
        Self {
            center: matrix.transform_point3(self.center),
            radius: self.radius * max_scale_sq.sqrt(),
        }
    }

    #[must_use]
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.distance_squared(self.center) <= self.radius * self.radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_empty_box() {
        let b = Box3::default();
        assert!(b.is_empty());
        assert_eq!(b.size(), Vec3::ZERO);
        assert!(Sphere::from_box(&b).is_empty());
    }

    #[test]
    fn test_box_transform_rotated() {
        let b = Box3::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let m = Affine3A::from_rotation_translation(
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_4),
            Vec3::new(5.0, 0.0, 0.0),
        );
        let t = b.transform(&m);
        let half_diag = 2.0_f32.sqrt();
        assert!((t.max.x - (5.0 + half_diag)).abs() < 1e-5);
        assert!((t.min.y + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sphere_transform_uses_max_scale() {
        let s = Sphere::new(Vec3::ZERO, 1.0);
        let m = Affine3A::from_scale_rotation_translation(
            Vec3::new(1.0, 3.0, 2.0),
            Quat::IDENTITY,
            Vec3::new(0.0, 1.0, 0.0),
        );
        let t = s.transform(&m);
        assert!((t.radius - 3.0).abs() < 1e-5);
        assert_eq!(t.center, Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_sphere_from_points() {
        let pts = [Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 0.5, 0.0)];
        let s = Sphere::from_points(&pts);
        assert!((s.center - Vec3::new(0.0, 0.25, 0.0)).length() < 1e-6);
        assert!(pts.iter().all(|p| s.contains_point(*p)));
    }
}
