//! Transform System
//!
//! Resolves local-to-world matrices over the node arena. Kept apart from
//! [`Scene`](crate::scene::Scene) so it only borrows the node slot map, the
//! camera components and the root list, which avoids borrow conflicts with the
//! rest of the scene.
//!
//! Traversal is strictly pre-order: a node's world matrix is written before any
//! of its children read it.

use glam::Affine3A;
use slotmap::{SlotMap, SparseSecondaryMap};

use crate::scene::NodeHandle;
use crate::scene::camera::Camera;
use crate::scene::node::Node;

/// Updates the world matrix of every node reachable from `roots`.
///
/// A node is recomputed when its local TRS changed, when it was explicitly
/// marked dirty, when its parent was recomputed, or when `force` is set.
/// Uses an explicit stack instead of recursion so deep hierarchies cannot
/// overflow the call stack.
pub fn update_hierarchy_iterative(
    nodes: &mut SlotMap<NodeHandle, Node>,
    cameras: &mut SparseSecondaryMap<NodeHandle, Camera>,
    roots: &[NodeHandle],
    force: bool,
) {
    // (node, parent world, parent changed)
    let mut stack: Vec<(NodeHandle, Affine3A, bool)> = Vec::with_capacity(64);

    for &root in roots.iter().rev() {
        stack.push((root, Affine3A::IDENTITY, force));
    }

    drain_stack(nodes, cameras, &mut stack);
}

/// Updates `root` and its descendants, reading the parent's cached world
/// matrix as the starting point. The subtree is always recomputed.
pub fn update_subtree(
    nodes: &mut SlotMap<NodeHandle, Node>,
    cameras: &mut SparseSecondaryMap<NodeHandle, Camera>,
    root: NodeHandle,
) {
    let Some(node) = nodes.get(root) else {
        return;
    };
    let parent_world = node
        .parent
        .and_then(|p| nodes.get(p))
        .map_or(Affine3A::IDENTITY, |p| p.transform.world_matrix);

    let mut stack = vec![(root, parent_world, true)];
    drain_stack(nodes, cameras, &mut stack);
}

/// Recomputes a single node from its parent's cached world matrix without
/// touching descendants. Returns the new world matrix.
///
/// When the world matrix moves, the direct children are flagged stale so the
/// next hierarchy pass picks them up even though this node reads as clean.
pub fn update_single(
    nodes: &mut SlotMap<NodeHandle, Node>,
    cameras: &mut SparseSecondaryMap<NodeHandle, Camera>,
    handle: NodeHandle,
) -> Option<Affine3A> {
    let parent_world = nodes
        .get(handle)?
        .parent
        .and_then(|p| nodes.get(p))
        .map_or(Affine3A::IDENTITY, |p| p.transform.world_matrix);

    let node = nodes.get_mut(handle)?;
    node.transform.update_local_matrix();
    let world = parent_world * node.transform.local_matrix;
    let moved = node.transform.world_matrix != world;
    node.transform.set_world_matrix(world);

    if let Some(camera) = cameras.get_mut(handle) {
        camera.update_view_projection(&world);
    }

    if moved {
        let children = nodes.get(handle).map(|n| n.children.clone()).unwrap_or_default();
        for child in children {
            if let Some(child) = nodes.get_mut(child) {
                child.transform.world_needs_update = true;
            }
        }
    }
    Some(world)
}

fn drain_stack(
    nodes: &mut SlotMap<NodeHandle, Node>,
    cameras: &mut SparseSecondaryMap<NodeHandle, Camera>,
    stack: &mut Vec<(NodeHandle, Affine3A, bool)>,
) {
    while let Some((handle, parent_world, parent_changed)) = stack.pop() {
        let Some(node) = nodes.get_mut(handle) else {
            continue;
        };

        let world_stale = node.transform.world_needs_update;
        let local_changed = node.transform.update_local_matrix();
        let recompute = local_changed || parent_changed || world_stale;

        if recompute {
            let world = parent_world * node.transform.local_matrix;
            node.transform.set_world_matrix(world);

            if let Some(camera) = cameras.get_mut(handle) {
                camera.update_view_projection(&world);
            }
        }

        let world = node.transform.world_matrix;
        // Reverse push keeps children in insertion order.
        for &child in node.children.iter().rev() {
            stack.push((child, world, recompute));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_hierarchy_update() {
        let mut nodes: SlotMap<NodeHandle, Node> = SlotMap::with_key();
        let mut cameras: SparseSecondaryMap<NodeHandle, Camera> = SparseSecondaryMap::new();

        let mut parent = Node::new();
        parent.transform.position = Vec3::new(1.0, 0.0, 0.0);
        let parent_handle = nodes.insert(parent);

        let mut child = Node::new();
        child.transform.position = Vec3::new(0.0, 1.0, 0.0);
        child.parent = Some(parent_handle);
        let child_handle = nodes.insert(child);

        nodes[parent_handle].children.push(child_handle);

        update_hierarchy_iterative(&mut nodes, &mut cameras, &[parent_handle], false);

        let child_world_pos = nodes[child_handle].transform.world_matrix.translation;
        assert!((child_world_pos.x - 1.0).abs() < 1e-5);
        assert!((child_world_pos.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_unchanged_parent_skips_children() {
        let mut nodes: SlotMap<NodeHandle, Node> = SlotMap::with_key();
        let mut cameras: SparseSecondaryMap<NodeHandle, Camera> = SparseSecondaryMap::new();

        let parent = nodes.insert(Node::new());
        let mut child = Node::new();
        child.parent = Some(parent);
        let child = nodes.insert(child);
        nodes[parent].children.push(child);

        update_hierarchy_iterative(&mut nodes, &mut cameras, &[parent], false);
        assert!(!nodes[child].transform.is_dirty());

        // Sneak a stale value in; with nothing dirty it must survive.
        nodes[child].transform.world_matrix = Affine3A::from_translation(Vec3::splat(9.0));
        update_hierarchy_iterative(&mut nodes, &mut cameras, &[parent], false);
        assert_eq!(nodes[child].transform.world_matrix.translation.x, 9.0);

        update_hierarchy_iterative(&mut nodes, &mut cameras, &[parent], true);
        assert_eq!(nodes[child].transform.world_matrix.translation.x, 0.0);
    }

    #[test]
    fn test_single_update_flags_children() {
        let mut nodes: SlotMap<NodeHandle, Node> = SlotMap::with_key();
        let mut cameras: SparseSecondaryMap<NodeHandle, Camera> = SparseSecondaryMap::new();

        let parent = nodes.insert(Node::new());
        let mut child = Node::new();
        child.parent = Some(parent);
        let child = nodes.insert(child);
        nodes[parent].children.push(child);
        update_hierarchy_iterative(&mut nodes, &mut cameras, &[parent], false);

        nodes[parent].transform.position = Vec3::new(2.0, 0.0, 0.0);
        update_single(&mut nodes, &mut cameras, parent);
        assert!(nodes[child].transform.is_dirty());

        update_hierarchy_iterative(&mut nodes, &mut cameras, &[parent], false);
        assert_eq!(nodes[child].transform.world_matrix.translation.x, 2.0);

        // Recomputing an unmoved node leaves its children clean.
        update_single(&mut nodes, &mut cameras, parent);
        assert!(!nodes[child].transform.is_dirty());
    }
}
