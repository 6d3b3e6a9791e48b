//! Built-in geometry generators. All winding is counter-clockwise when seen
//! from the outside.

pub mod box_shape;
pub mod plane;
pub mod sphere;

pub use box_shape::create_box;
pub use plane::{PlaneOptions, create_plane};
pub use sphere::{SphereOptions, create_sphere};
