//! Euler angles with an explicit rotation order.
//!
//! # Convention
//!
//! Rotations are intrinsic and right-handed in a Y-up frame: a positive angle
//! turns counter-clockwise when looking down the axis toward the origin. The
//! order names the axes from left to right in the matrix product, so
//! [`EulerOrder::Xyz`] builds `Rx * Ry * Rz` and the Z rotation is applied to
//! a vector first.
//!
//! Rotating `(1, 0, 0)` by +90° about Y therefore yields `(0, 0, -1)`.

use glam::{Mat3, Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Axis order used when composing or decomposing Euler angles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EulerOrder {
    #[default]
    Xyz,
    Xzy,
    Yxz,
    Yzx,
    Zxy,
    Zyx,
}

impl EulerOrder {
    pub const ALL: [EulerOrder; 6] = [
        EulerOrder::Xyz,
        EulerOrder::Xzy,
        EulerOrder::Yxz,
        EulerOrder::Yzx,
        EulerOrder::Zxy,
        EulerOrder::Zyx,
    ];

    /// Axis indices (0 = X, 1 = Y, 2 = Z) in product order.
    #[must_use]
    pub const fn axes(self) -> [usize; 3] {
        match self {
            EulerOrder::Xyz => [0, 1, 2],
            EulerOrder::Xzy => [0, 2, 1],
            EulerOrder::Yxz => [1, 0, 2],
            EulerOrder::Yzx => [1, 2, 0],
            EulerOrder::Zxy => [2, 0, 1],
            EulerOrder::Zyx => [2, 1, 0],
        }
    }
}

/// Rotation expressed as three angles in radians plus the order they compose in.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Euler {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub order: EulerOrder,
}

impl Euler {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32, order: EulerOrder) -> Self {
        Self { x, y, z, order }
    }

    /// Angles as a vector, ignoring the order.
    #[must_use]
    pub fn to_vec3(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    #[must_use]
    pub fn to_quat(&self) -> Quat {
        let angles = [self.x, self.y, self.z];
        self.order
            .axes()
            .iter()
            .fold(Quat::IDENTITY, |acc, &axis| acc * axis_rotation(axis, angles[axis]))
    }

    #[must_use]
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_quat(self.to_quat())
    }

    /// Decomposes a rotation into angles for the given order.
    ///
    /// Near gimbal lock the last angle of the order collapses to zero.
    #[must_use]
    pub fn from_quat(q: Quat, order: EulerOrder) -> Self {
        Self::from_rotation_matrix(&Mat3::from_quat(q.normalize()), order)
    }

    /// Decomposes a pure rotation matrix (no scale) for the given order.
    #[must_use]
    pub fn from_rotation_matrix(m: &Mat3, order: EulerOrder) -> Self {
        const LOCK: f32 = 0.999_999_9;

        // m[r][c] in row/column notation; glam stores columns.
        let e = |r: usize, c: usize| m.col(c).to_array()[r];
        let (m11, m12, m13) = (e(0, 0), e(0, 1), e(0, 2));
        let (m21, m22, m23) = (e(1, 0), e(1, 1), e(1, 2));
        let (m31, m32, m33) = (e(2, 0), e(2, 1), e(2, 2));

        let (x, y, z) = match order {
            EulerOrder::Xyz => {
                let y = m13.clamp(-1.0, 1.0).asin();
                if m13.abs() < LOCK {
                    (f32::atan2(-m23, m33), y, f32::atan2(-m12, m11))
                } else {
                    (f32::atan2(m32, m22), y, 0.0)
                }
            }
            EulerOrder::Yxz => {
                let x = (-m23.clamp(-1.0, 1.0)).asin();
                if m23.abs() < LOCK {
                    (x, f32::atan2(m13, m33), f32::atan2(m21, m22))
                } else {
                    (x, f32::atan2(-m31, m11), 0.0)
                }
            }
            EulerOrder::Zxy => {
                let x = m32.clamp(-1.0, 1.0).asin();
                if m32.abs() < LOCK {
                    (x, f32::atan2(-m31, m33), f32::atan2(-m12, m22))
                } else {
                    (x, 0.0, f32::atan2(m21, m11))
                }
            }
            EulerOrder::Zyx => {
                let y = (-m31.clamp(-1.0, 1.0)).asin();
                if m31.abs() < LOCK {
                    (f32::atan2(m32, m33), y, f32::atan2(m21, m11))
                } else {
                    (0.0, y, f32::atan2(-m12, m22))
                }
            }
            EulerOrder::Yzx => {
                let z = m21.clamp(-1.0, 1.0).asin();
                if m21.abs() < LOCK {
                    (f32::atan2(-m23, m22), f32::atan2(-m31, m11), z)
                } else {
                    (0.0, f32::atan2(m13, m33), z)
                }
            }
            EulerOrder::Xzy => {
                let z = (-m12.clamp(-1.0, 1.0)).asin();
                if m12.abs() < LOCK {
                    (f32::atan2(m32, m22), f32::atan2(m13, m11), z)
                } else {
                    (f32::atan2(-m23, m33), 0.0, z)
                }
            }
        };

        Self { x, y, z, order }
    }

    /// Re-expresses the same rotation in another order.
    #[must_use]
    pub fn reorder(&self, order: EulerOrder) -> Self {
        Self::from_quat(self.to_quat(), order)
    }
}

fn axis_rotation(axis: usize, angle: f32) -> Quat {
    match axis {
        0 => Quat::from_rotation_x(angle),
        1 => Quat::from_rotation_y(angle),
        _ => Quat::from_rotation_z(angle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn test_positive_yaw_maps_x_to_negative_z() {
        let q = Euler::new(0.0, FRAC_PI_2, 0.0, EulerOrder::Xyz).to_quat();
        let v = q * Vec3::X;
        assert!((v - Vec3::new(0.0, 0.0, -1.0)).length() < EPSILON, "got {v:?}");
    }

    #[test]
    fn test_order_controls_composition() {
        let xyz = Euler::new(0.3, 0.5, 0.7, EulerOrder::Xyz).to_quat();
        let manual = Quat::from_rotation_x(0.3) * Quat::from_rotation_y(0.5) * Quat::from_rotation_z(0.7);
        assert!(xyz.abs_diff_eq(manual, EPSILON));

        let zyx = Euler::new(0.3, 0.5, 0.7, EulerOrder::Zyx).to_quat();
        let manual = Quat::from_rotation_z(0.7) * Quat::from_rotation_y(0.5) * Quat::from_rotation_x(0.3);
        assert!(zyx.abs_diff_eq(manual, EPSILON));
    }

    #[test]
    fn test_decompose_every_order() {
        for order in EulerOrder::ALL {
            let euler = Euler::new(0.2, -0.4, 0.9, order);
            let back = Euler::from_quat(euler.to_quat(), order);
            assert!(
                (back.to_vec3() - euler.to_vec3()).length() < 1e-4,
                "order {order:?}: {back:?} != {euler:?}"
            );
        }
    }

    #[test]
    fn test_reorder_preserves_rotation() {
        let euler = Euler::new(0.1, 0.2, 0.3, EulerOrder::Xyz);
        let other = euler.reorder(EulerOrder::Zxy);
        assert_eq!(other.order, EulerOrder::Zxy);
        let a = euler.to_quat();
        let b = other.to_quat();
        // q and -q are the same rotation
        assert!(a.dot(b).abs() > 1.0 - EPSILON);
    }
}
