//! Scene graph
//!
//! - [`Node`]: hierarchy links, transform, visibility and layers
//! - [`Transform`]: local TRS with lazily resolved matrices
//! - [`Scene`]: node arena, component maps and lifecycle events
//! - [`Camera`], [`Light`], [`Mesh`]: components keyed by node handle
//! - [`transform_system`]: pre-order world-matrix propagation

pub mod background;
pub mod camera;
pub mod light;
pub mod mesh;
pub mod node;
pub mod scene;
pub mod transform;
pub mod transform_system;

pub use background::{Background, Fog};
pub use camera::{Camera, Projection};
pub use light::{Light, LightKind, LightShadow};
pub use mesh::{InstanceData, Mesh};
pub use node::Node;
pub use scene::{Scene, SceneEvent};
pub use transform::Transform;

use slotmap::new_key_type;

new_key_type! {
    /// Handle of a node in a [`Scene`] arena.
    pub struct NodeHandle;
}
