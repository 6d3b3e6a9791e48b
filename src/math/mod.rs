//! Math primitives.
//!
//! Vectors, matrices and quaternions come straight from [`glam`]; this module
//! adds the pieces a scene graph needs on top: an Euler view with a
//! runtime-selectable rotation order, bounding volumes, frustum planes and
//! layer masks.

pub mod bounds;
pub mod euler;
pub mod frustum;
pub mod layers;

pub use bounds::{Box3, Sphere};
pub use euler::{Euler, EulerOrder};
pub use frustum::{Frustum, Plane};
pub use layers::Layers;

pub use glam::{Affine3A, Mat3, Mat4, Quat, Vec2, Vec3, Vec3A, Vec4};
