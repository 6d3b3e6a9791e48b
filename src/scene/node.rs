use std::borrow::Cow;

use glam::Affine3A;

use crate::math::Layers;
use crate::scene::NodeHandle;
use crate::scene::transform::Transform;

/// A scene node containing only the data touched by every traversal.
///
/// # Design Principles
///
/// - Only keeps hierarchy, transform and visibility state
/// - Meshes, cameras and lights live in the [`Scene`](crate::scene::Scene)
///   component maps keyed by the node handle
///
/// # Hierarchy
///
/// - `parent`: non-owning handle into the scene arena (None for root nodes)
/// - `children`: owned child handles, in insertion order
///
/// A node has at most one parent. The scene keeps both sides of the link in
/// sync; the raw fields are crate-private for that reason.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: Cow<'static, str>,

    // === Core Hierarchy ===
    pub(crate) parent: Option<NodeHandle>,
    pub(crate) children: Vec<NodeHandle>,

    // === Core Spatial Data ===
    pub transform: Transform,

    // === Core State ===
    /// A hidden node hides its whole subtree.
    pub visible: bool,
    pub layers: Layers,
    /// Explicit sort hint, lower draws first within a bucket.
    pub render_order: i32,
    /// Marks a render group: descendants sort by this node's `render_order`
    /// before their own.
    pub is_group: bool,
}

impl Node {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: Cow::Borrowed(""),
            parent: None,
            children: Vec::new(),
            transform: Transform::new(),
            visible: true,
            layers: Layers::default(),
            render_order: 0,
            is_group: false,
        }
    }

    #[must_use]
    pub fn with_name(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            ..Self::new()
        }
    }

    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    #[inline]
    #[must_use]
    pub fn children(&self) -> &[NodeHandle] {
        &self.children
    }

    #[inline]
    #[must_use]
    pub fn world_matrix(&self) -> &Affine3A {
        &self.transform.world_matrix
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}
