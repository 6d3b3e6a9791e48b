use glam::{Affine3A, Mat4, Vec3};

use crate::math::{Frustum, Layers};

/// Projection parameters. Angles are in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        top: f32,
        bottom: f32,
        near: f32,
        far: f32,
    },
}

/// Camera component.
///
/// Attached to a node; the node's world matrix places the camera. The view,
/// projection and frustum are cached and refreshed by the transform system
/// whenever the node's world matrix changes, or by
/// [`Camera::update_projection_matrix`] after projection edits.
///
/// Depth maps to `[0, 1]` with near at 0.
#[derive(Debug, Clone)]
pub struct Camera {
    pub projection: Projection,
    pub zoom: f32,
    /// Objects are drawn only when their layers intersect this mask.
    pub layers: Layers,

    pub(crate) world_matrix: Affine3A,
    pub(crate) view_matrix: Mat4,
    pub(crate) projection_matrix: Mat4,
    pub(crate) view_projection_matrix: Mat4,
    pub(crate) frustum: Frustum,
}

impl Camera {
    /// `fov_y_degrees` is the vertical field of view.
    #[must_use]
    pub fn new_perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self::with_projection(Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        })
    }

    #[must_use]
    pub fn new_orthographic(left: f32, right: f32, top: f32, bottom: f32, near: f32, far: f32) -> Self {
        Self::with_projection(Projection::Orthographic {
            left,
            right,
            top,
            bottom,
            near,
            far,
        })
    }

    #[must_use]
    pub fn with_projection(projection: Projection) -> Self {
        let mut cam = Self {
            projection,
            zoom: 1.0,
            layers: Layers::default(),
            world_matrix: Affine3A::IDENTITY,
            view_matrix: Mat4::IDENTITY,
            projection_matrix: Mat4::IDENTITY,
            view_projection_matrix: Mat4::IDENTITY,
            frustum: Frustum::default(),
        };
        cam.update_projection_matrix();
        cam
    }

    /// Recomputes the projection from [`Camera::projection`] and [`Camera::zoom`].
    pub fn update_projection_matrix(&mut self) {
        let zoom = self.zoom.max(f32::EPSILON);
        self.projection_matrix = match self.projection {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => {
                let fov = 2.0 * ((fov_y * 0.5).tan() / zoom).atan();
                Mat4::perspective_rh(fov, aspect, near, far)
            }
            Projection::Orthographic {
                left,
                right,
                top,
                bottom,
                near,
                far,
            } => {
                let cx = (left + right) * 0.5;
                let cy = (top + bottom) * 0.5;
                let hw = (right - left) * 0.5 / zoom;
                let hh = (top - bottom) * 0.5 / zoom;
                Mat4::orthographic_rh(cx - hw, cx + hw, cy - hh, cy + hh, near, far)
            }
        };
        self.refresh_view_projection();
    }

    pub fn update_view_projection(&mut self, world_transform: &Affine3A) {
        self.world_matrix = *world_transform;
        self.view_matrix = Mat4::from(world_transform.inverse());
        self.refresh_view_projection();
    }

    fn refresh_view_projection(&mut self) {
        self.view_projection_matrix = self.projection_matrix * self.view_matrix;
        self.frustum = Frustum::from_matrix(self.view_projection_matrix);
    }

    pub fn set_aspect(&mut self, new_aspect: f32) {
        if let Projection::Perspective { aspect, .. } = &mut self.projection {
            *aspect = new_aspect;
        }
        self.update_projection_matrix();
    }

    #[must_use]
    pub fn near_far(&self) -> (f32, f32) {
        match self.projection {
            Projection::Perspective { near, far, .. } | Projection::Orthographic { near, far, .. } => {
                (near, far)
            }
        }
    }

    #[must_use]
    pub fn is_orthographic(&self) -> bool {
        matches!(self.projection, Projection::Orthographic { .. })
    }

    #[inline]
    #[must_use]
    pub fn position(&self) -> Vec3 {
        self.world_matrix.translation.into()
    }

    #[inline]
    #[must_use]
    pub fn view_matrix(&self) -> &Mat4 {
        &self.view_matrix
    }

    #[inline]
    #[must_use]
    pub fn projection_matrix(&self) -> &Mat4 {
        &self.projection_matrix
    }

    #[inline]
    #[must_use]
    pub fn view_projection_matrix(&self) -> &Mat4 {
        &self.view_projection_matrix
    }

    #[inline]
    #[must_use]
    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }
}
