use glam::{Affine3A, Mat3, Mat4, Quat, Vec3};

use crate::math::{Euler, EulerOrder};

/// Transform component
///
/// Holds a node's local position, rotation and scale together with the cached
/// local and world matrices. Public TRS fields may be written directly; the
/// change is picked up by a shadow-state comparison the next time the
/// hierarchy is updated, so setters never recompute matrices eagerly.
///
/// The rotation is stored as a quaternion. The Euler view is derived from it
/// on demand using [`Transform::euler_order`], so the two representations can
/// never drift apart.
#[derive(Debug, Clone)]
pub struct Transform {
    // === Public state ===
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    /// Order used by [`Transform::euler`] and [`Transform::set_rotation_euler`].
    pub euler_order: EulerOrder,
    /// When false the local matrix is only rebuilt after an explicit
    /// [`Transform::mark_dirty`] or matrix assignment.
    pub matrix_auto_update: bool,

    // === Matrix cache ===
    pub(crate) local_matrix: Affine3A,
    pub(crate) world_matrix: Affine3A,
    pub(crate) world_needs_update: bool,

    // === Shadow state ===
    last_position: Vec3,
    last_rotation: Quat,
    last_scale: Vec3,
    force_update: bool,
}

impl Transform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            euler_order: EulerOrder::default(),
            matrix_auto_update: true,

            local_matrix: Affine3A::IDENTITY,
            world_matrix: Affine3A::IDENTITY,
            world_needs_update: true,

            last_position: Vec3::ZERO,
            last_rotation: Quat::IDENTITY,
            last_scale: Vec3::ONE,
            force_update: true,
        }
    }

    #[must_use]
    pub fn from_trs(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        let mut t = Self::new();
        t.set_local(position, rotation, scale);
        t
    }

    // ========================================================================
    // Dirty tracking
    // ========================================================================

    /// Rebuilds the local matrix if TRS changed since the last call.
    ///
    /// Returns whether the local matrix changed.
    pub fn update_local_matrix(&mut self) -> bool {
        let trs_changed = self.position != self.last_position
            || self.rotation != self.last_rotation
            || self.scale != self.last_scale;

        let changed = self.force_update || (self.matrix_auto_update && trs_changed);

        if changed {
            // Shadow state always mirrors `local_matrix`, so an unchanged TRS
            // keeps a directly assigned matrix intact.
            if trs_changed {
                self.local_matrix =
                    Affine3A::from_scale_rotation_translation(self.scale, self.rotation, self.position);
            }

            self.last_position = self.position;
            self.last_rotation = self.rotation;
            self.last_scale = self.scale;
            self.force_update = false;
            self.world_needs_update = true;
        }

        changed
    }

    /// True while the cached world matrix may be stale.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.force_update
            || self.world_needs_update
            || self.position != self.last_position
            || self.rotation != self.last_rotation
            || self.scale != self.last_scale
    }

    /// Forces the local and world matrices to be rebuilt on the next update.
    pub fn mark_dirty(&mut self) {
        self.force_update = true;
        self.world_needs_update = true;
    }

    // ========================================================================
    // Setters
    // ========================================================================

    /// Replaces position, rotation and scale. Matrices are resolved lazily.
    pub fn set_local(&mut self, position: Vec3, rotation: Quat, scale: Vec3) {
        self.position = position;
        self.rotation = rotation;
        self.scale = scale;
    }

    /// Sets the rotation from angles in the current [`Transform::euler_order`].
    pub fn set_rotation_euler(&mut self, x: f32, y: f32, z: f32) {
        self.rotation = Euler::new(x, y, z, self.euler_order).to_quat();
    }

    /// Sets the rotation and adopts the Euler's order for later reads.
    pub fn set_euler(&mut self, euler: Euler) {
        self.euler_order = euler.order;
        self.rotation = euler.to_quat();
    }

    /// Euler view of the current rotation.
    #[must_use]
    pub fn euler(&self) -> Euler {
        Euler::from_quat(self.rotation, self.euler_order)
    }

    /// Replaces the local matrix and decomposes it back into TRS.
    ///
    /// Shear cannot be represented by TRS and is lost.
    pub fn set_local_matrix(&mut self, mat: Affine3A) {
        let (scale, rotation, translation) = mat.to_scale_rotation_translation();
        self.scale = scale;
        self.rotation = rotation;
        self.position = translation;
        self.local_matrix = mat;

        self.last_scale = scale;
        self.last_rotation = rotation;
        self.last_position = translation;

        self.mark_dirty();
    }

    /// Premultiplies the local matrix by `mat`, i.e. applies `mat` in the
    /// parent's space.
    pub fn apply_matrix(&mut self, mat: &Affine3A) {
        let current = Affine3A::from_scale_rotation_translation(self.scale, self.rotation, self.position);
        self.set_local_matrix(*mat * current);
    }

    /// Turns the local -Z axis toward `target`.
    ///
    /// `target` and `up` are expressed in the parent's space.
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = (target - self.position).normalize_or_zero();

        if forward == Vec3::ZERO || forward.cross(up).length_squared() < 1e-8 {
            return;
        }

        let right = forward.cross(up).normalize();
        let new_up = right.cross(forward).normalize();

        self.rotation = Quat::from_mat3(&Mat3::from_cols(right, new_up, -forward));
    }

    // ========================================================================
    // Getters
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn local_matrix(&self) -> &Affine3A {
        &self.local_matrix
    }

    #[inline]
    #[must_use]
    pub fn world_matrix(&self) -> &Affine3A {
        &self.world_matrix
    }

    #[inline]
    #[must_use]
    pub fn world_matrix_as_mat4(&self) -> Mat4 {
        Mat4::from(self.world_matrix)
    }

    #[inline]
    #[must_use]
    pub fn world_position(&self) -> Vec3 {
        self.world_matrix.translation.into()
    }

    pub(crate) fn set_world_matrix(&mut self, mat: Affine3A) {
        self.world_matrix = mat;
        self.world_needs_update = false;
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new()
    }
}
