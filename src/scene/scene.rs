use std::borrow::Cow;

use glam::{Affine3A, Quat, Vec3};
use slotmap::{SlotMap, SparseSecondaryMap};

use crate::assets::MaterialHandle;
use crate::math::Layers;
use crate::scene::NodeHandle;
use crate::scene::background::{Background, Fog};
use crate::scene::camera::Camera;
use crate::scene::light::Light;
use crate::scene::mesh::Mesh;
use crate::scene::node::Node;
use crate::scene::transform::Transform;
use crate::scene::transform_system;
use crate::utils::EventChannel;

/// Lifecycle notifications emitted by a [`Scene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneEvent {
    Added(NodeHandle),
    /// Emitted once per node of a removed subtree, parents first.
    Removed(NodeHandle),
    /// The node moved under `parent` (None = became a root).
    Reparented {
        node: NodeHandle,
        parent: Option<NodeHandle>,
    },
}

/// Scene graph
///
/// Owns the node arena and the component maps. Parent links are plain
/// handles into the arena, so no node owns its parent and removing a subtree
/// never leaves a dangling strong reference.
///
/// The graph must stay a tree. Attaching a node beneath its own descendant is
/// a caller error and is not detected.
pub struct Scene {
    pub(crate) nodes: SlotMap<NodeHandle, Node>,
    pub(crate) roots: Vec<NodeHandle>,

    // ==== Components ====
    pub(crate) meshes: SparseSecondaryMap<NodeHandle, Mesh>,
    pub(crate) cameras: SparseSecondaryMap<NodeHandle, Camera>,
    pub(crate) lights: SparseSecondaryMap<NodeHandle, Light>,

    // ==== Scene-wide state ====
    pub background: Background,
    pub fog: Option<Fog>,
    /// Replaces every drawable's material when set.
    pub override_material: Option<MaterialHandle>,

    events: EventChannel<SceneEvent>,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            roots: Vec::new(),
            meshes: SparseSecondaryMap::new(),
            cameras: SparseSecondaryMap::new(),
            lights: SparseSecondaryMap::new(),
            background: Background::None,
            fog: None,
            override_material: None,
            events: EventChannel::new(),
        }
    }

    /// Receives every [`SceneEvent`] emitted after this call.
    pub fn subscribe(&mut self) -> flume::Receiver<SceneEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Inserts a node as a new root.
    pub fn add_node(&mut self, node: Node) -> NodeHandle {
        let handle = self.nodes.insert(node);
        self.roots.push(handle);
        self.events.emit(SceneEvent::Added(handle));
        handle
    }

    /// Inserts a node directly beneath `parent`. Falls back to a root when the
    /// parent does not exist.
    pub fn add_to_parent(&mut self, mut node: Node, parent: NodeHandle) -> NodeHandle {
        if !self.nodes.contains_key(parent) {
            log::warn!("Parent node not found, inserting '{}' as a root", node.name);
            return self.add_node(node);
        }
        node.parent = Some(parent);
        let handle = self.nodes.insert(node);
        self.nodes[parent].children.push(handle);
        self.events.emit(SceneEvent::Added(handle));
        handle
    }

    /// Creates an empty named node, optionally under `parent`.
    pub fn spawn(&mut self, name: impl Into<Cow<'static, str>>, parent: Option<NodeHandle>) -> NodeHandle {
        let node = Node::with_name(name);
        match parent {
            Some(p) => self.add_to_parent(node, p),
            None => self.add_node(node),
        }
    }

    pub fn add_mesh(&mut self, name: impl Into<Cow<'static, str>>, mesh: Mesh, parent: Option<NodeHandle>) -> NodeHandle {
        let handle = self.spawn(name, parent);
        self.meshes.insert(handle, mesh);
        handle
    }

    pub fn add_camera(&mut self, camera: Camera, parent: Option<NodeHandle>) -> NodeHandle {
        let handle = self.spawn("Camera", parent);
        self.cameras.insert(handle, camera);
        handle
    }

    pub fn add_light(&mut self, light: Light, parent: Option<NodeHandle>) -> NodeHandle {
        let handle = self.spawn("Light", parent);
        self.lights.insert(handle, light);
        handle
    }

    pub fn set_mesh(&mut self, node: NodeHandle, mesh: Mesh) {
        if self.nodes.contains_key(node) {
            self.meshes.insert(node, mesh);
        }
    }

    pub fn set_camera(&mut self, node: NodeHandle, camera: Camera) {
        if self.nodes.contains_key(node) {
            self.cameras.insert(node, camera);
        }
    }

    pub fn set_light(&mut self, node: NodeHandle, light: Light) {
        if self.nodes.contains_key(node) {
            self.lights.insert(node, light);
        }
    }

    // ========================================================================
    // Hierarchy edits
    // ========================================================================

    /// Makes `child` a child of `parent`, keeping its *local* transform.
    ///
    /// The child is unlinked from its previous parent first, so the subtree
    /// visibly jumps if the two parents differ. Use [`Scene::attach`] to keep
    /// the world transform instead.
    pub fn add_child(&mut self, parent: NodeHandle, child: NodeHandle) {
        if parent == child {
            log::warn!("Cannot add a node as a child of itself");
            return;
        }
        if !self.nodes.contains_key(parent) || !self.nodes.contains_key(child) {
            log::error!("add_child called with a missing node");
            return;
        }

        self.unlink(child);
        self.nodes[parent].children.push(child);

        let node = &mut self.nodes[child];
        node.parent = Some(parent);
        node.transform.mark_dirty();

        self.events.emit(SceneEvent::Reparented {
            node: child,
            parent: Some(parent),
        });
    }

    /// Reparents `child` under `parent` while preserving its world transform.
    ///
    /// The new local matrix is `inverse(parent.world) * child.world`, decomposed
    /// back into position, rotation and scale.
    pub fn attach(&mut self, parent: NodeHandle, child: NodeHandle) {
        if parent == child {
            log::warn!("Cannot attach node to itself!");
            return;
        }
        let (Some(parent_world), Some(child_world)) = (
            self.update_world_matrix(parent, true, false),
            self.update_world_matrix(child, true, false),
        ) else {
            log::error!("attach called with a missing node");
            return;
        };

        let local = parent_world.inverse() * child_world;

        self.add_child(parent, child);
        self.nodes[child].transform.set_local_matrix(local);
        self.update_world_matrix(child, false, true);
    }

    /// Moves `child` to the root level while preserving its world transform.
    pub fn detach(&mut self, child: NodeHandle) {
        let Some(world) = self.update_world_matrix(child, true, false) else {
            return;
        };
        if self.nodes[child].parent.is_none() {
            return;
        }

        self.unlink(child);
        self.roots.push(child);

        let node = &mut self.nodes[child];
        node.parent = None;
        node.transform.set_local_matrix(world);

        self.update_world_matrix(child, false, true);
        self.events.emit(SceneEvent::Reparented {
            node: child,
            parent: None,
        });
    }

    /// Removes a node and its whole subtree together with their components.
    ///
    /// Returns the number of nodes removed.
    pub fn remove(&mut self, handle: NodeHandle) -> usize {
        if !self.nodes.contains_key(handle) {
            return 0;
        }
        self.unlink(handle);

        let mut removed = 0;
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            let Some(node) = self.nodes.remove(h) else {
                continue;
            };
            stack.extend(node.children.iter().rev().copied());

            self.meshes.remove(h);
            self.cameras.remove(h);
            self.lights.remove(h);

            self.events.emit(SceneEvent::Removed(h));
            removed += 1;
        }
        removed
    }

    /// Removes every node.
    pub fn clear(&mut self) {
        while let Some(&root) = self.roots.last() {
            self.remove(root);
        }
    }

    /// Drops the parent's (or the root list's) reference to `child`.
    fn unlink(&mut self, child: NodeHandle) {
        match self.nodes.get(child).and_then(|n| n.parent) {
            Some(parent) => {
                if let Some(p) = self.nodes.get_mut(parent)
                    && let Some(i) = p.children.iter().position(|&c| c == child)
                {
                    p.children.remove(i);
                }
            }
            None => {
                if let Some(i) = self.roots.iter().position(|&r| r == child) {
                    self.roots.remove(i);
                }
            }
        }
    }

    // ========================================================================
    // Per-node state
    // ========================================================================

    /// Replaces the local TRS. World matrices are resolved on the next update.
    pub fn set_local(&mut self, handle: NodeHandle, position: Vec3, rotation: Quat, scale: Vec3) {
        if let Some(node) = self.nodes.get_mut(handle) {
            node.transform.set_local(position, rotation, scale);
        }
    }

    pub fn set_visible(&mut self, handle: NodeHandle, visible: bool) {
        if let Some(node) = self.nodes.get_mut(handle) {
            node.visible = visible;
        }
    }

    pub fn set_layers(&mut self, handle: NodeHandle, layers: Layers) {
        if let Some(node) = self.nodes.get_mut(handle) {
            node.layers = layers;
        }
    }

    // ========================================================================
    // Matrix updates
    // ========================================================================

    /// Resolves every dirty world matrix, parents before children.
    ///
    /// `force` recomputes the whole graph regardless of dirty state.
    pub fn update_matrix_world(&mut self, force: bool) {
        transform_system::update_hierarchy_iterative(&mut self.nodes, &mut self.cameras, &self.roots, force);
    }

    /// Brings one node's world matrix up to date.
    ///
    /// With `update_parents` every ancestor is recomputed first, root down.
    /// With `update_children` the whole subtree below is recomputed after.
    /// Returns the node's new world matrix.
    pub fn update_world_matrix(
        &mut self,
        handle: NodeHandle,
        update_parents: bool,
        update_children: bool,
    ) -> Option<Affine3A> {
        if update_parents {
            let mut chain = Vec::new();
            let mut cursor = self.nodes.get(handle)?.parent;
            while let Some(p) = cursor {
                chain.push(p);
                cursor = self.nodes.get(p).and_then(|n| n.parent);
            }
            for &ancestor in chain.iter().rev() {
                transform_system::update_single(&mut self.nodes, &mut self.cameras, ancestor);
            }
        }

        let world = transform_system::update_single(&mut self.nodes, &mut self.cameras, handle)?;

        if update_children {
            let children = self.nodes[handle].children.clone();
            for child in children {
                transform_system::update_subtree(&mut self.nodes, &mut self.cameras, child);
            }
        }
        Some(world)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    #[must_use]
    pub fn node(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle)
    }

    pub fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(handle)
    }

    pub fn transform_mut(&mut self, handle: NodeHandle) -> Option<&mut Transform> {
        self.nodes.get_mut(handle).map(|n| &mut n.transform)
    }

    #[must_use]
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.nodes.contains_key(handle)
    }

    #[must_use]
    pub fn roots(&self) -> &[NodeHandle] {
        &self.roots
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn mesh(&self, handle: NodeHandle) -> Option<&Mesh> {
        self.meshes.get(handle)
    }

    pub fn mesh_mut(&mut self, handle: NodeHandle) -> Option<&mut Mesh> {
        self.meshes.get_mut(handle)
    }

    #[must_use]
    pub fn camera(&self, handle: NodeHandle) -> Option<&Camera> {
        self.cameras.get(handle)
    }

    pub fn camera_mut(&mut self, handle: NodeHandle) -> Option<&mut Camera> {
        self.cameras.get_mut(handle)
    }

    #[must_use]
    pub fn light(&self, handle: NodeHandle) -> Option<&Light> {
        self.lights.get(handle)
    }

    pub fn light_mut(&mut self, handle: NodeHandle) -> Option<&mut Light> {
        self.lights.get_mut(handle)
    }

    /// Lights on visible nodes, with their world matrices.
    pub fn iter_active_lights(&self) -> impl Iterator<Item = (NodeHandle, &Light, &Affine3A)> {
        self.lights.iter().filter_map(|(handle, light)| {
            let node = self.nodes.get(handle)?;
            self.is_effectively_visible(handle)
                .then_some((handle, light, &node.transform.world_matrix))
        })
    }

    /// False when the node or any ancestor is hidden.
    #[must_use]
    pub fn is_effectively_visible(&self, handle: NodeHandle) -> bool {
        let mut cursor = Some(handle);
        while let Some(h) = cursor {
            match self.nodes.get(h) {
                Some(node) if node.visible => cursor = node.parent,
                _ => return false,
            }
        }
        true
    }

    #[must_use]
    pub fn world_position(&self, handle: NodeHandle) -> Option<Vec3> {
        self.nodes.get(handle).map(|n| n.transform.world_position())
    }

    /// Pre-order walk from `root`, parents before children.
    pub fn traverse(&self, root: NodeHandle, mut visit: impl FnMut(NodeHandle, &Node)) {
        let mut stack = vec![root];
        while let Some(h) = stack.pop() {
            let Some(node) = self.nodes.get(h) else {
                continue;
            };
            visit(h, node);
            stack.extend(node.children.iter().rev().copied());
        }
    }

    /// Pre-order walk that skips hidden subtrees entirely.
    pub fn traverse_visible(&self, root: NodeHandle, mut visit: impl FnMut(NodeHandle, &Node)) {
        let mut stack = vec![root];
        while let Some(h) = stack.pop() {
            let Some(node) = self.nodes.get(h) else {
                continue;
            };
            if !node.visible {
                continue;
            }
            visit(h, node);
            stack.extend(node.children.iter().rev().copied());
        }
    }
}
