//! Scene graph tests
//!
//! Tests for:
//! - Node lifecycle and change notifications
//! - Subtree removal together with attached components
//! - Effective visibility and traversal
//! - Camera frustums

use glam::Vec3;
use trellis::math::Sphere;
use trellis::scene::{Camera, Light, Mesh, Scene, SceneEvent};
use trellis::assets::Assets;
use trellis::resources::Material;
use trellis::resources::primitives::create_box;

// ============================================================================
// Lifecycle & events
// ============================================================================

#[test]
fn hierarchy_edits_are_broadcast() {
    let mut scene = Scene::new();
    let events = scene.subscribe();

    let a = scene.spawn("a", None);
    let b = scene.spawn("b", Some(a));
    scene.detach(b);
    scene.add_child(a, b);
    scene.remove(a);

    let seen: Vec<SceneEvent> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            SceneEvent::Added(a),
            SceneEvent::Added(b),
            SceneEvent::Reparented { node: b, parent: None },
            SceneEvent::Reparented { node: b, parent: Some(a) },
            SceneEvent::Removed(a),
            SceneEvent::Removed(b),
        ]
    );
}

#[test]
fn every_subscriber_sees_every_event() {
    let mut scene = Scene::new();
    let first = scene.subscribe();
    let second = scene.subscribe();
    let node = scene.spawn("node", None);

    assert_eq!(first.try_iter().collect::<Vec<_>>(), vec![SceneEvent::Added(node)]);
    assert_eq!(second.try_iter().collect::<Vec<_>>(), vec![SceneEvent::Added(node)]);
}

#[test]
fn remove_takes_subtree_and_components() {
    let mut scene = Scene::new();
    let mut assets = Assets::new();
    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let material = assets.add_material(Material::new_basic(Vec3::ONE));

    let root = scene.spawn("root", None);
    let mesh = scene.add_mesh("mesh", Mesh::new(geometry, material), Some(root));
    let light = scene.add_light(Light::new_point(Vec3::ONE, 1.0, 0.0), Some(mesh));
    let other = scene.spawn("other", None);

    assert_eq!(scene.remove(root), 3);
    assert!(!scene.contains(root));
    assert!(scene.mesh(mesh).is_none());
    assert!(scene.light(light).is_none());
    assert_eq!(scene.roots(), &[other]);
    assert_eq!(scene.node_count(), 1);

    assert_eq!(scene.remove(root), 0, "stale handles are ignored");
    assert!(assets.get_geometry(geometry).is_some(), "assets outlive nodes");
}

#[test]
fn clear_empties_the_scene() {
    let mut scene = Scene::new();
    let a = scene.spawn("a", None);
    scene.spawn("a child", Some(a));
    scene.spawn("b", None);

    scene.clear();
    assert_eq!(scene.node_count(), 0);
    assert!(scene.roots().is_empty());
}

#[test]
fn self_parenting_is_rejected() {
    let mut scene = Scene::new();
    let a = scene.spawn("a", None);
    scene.add_child(a, a);
    scene.attach(a, a);
    assert_eq!(scene.node(a).unwrap().parent(), None);
    assert_eq!(scene.roots(), &[a]);
}

#[test]
fn attach_keeps_siblings_in_sync() {
    let mut scene = Scene::new();
    let parent = scene.spawn("parent", None);
    let sibling = scene.spawn("sibling", Some(parent));
    scene.transform_mut(sibling).unwrap().position = Vec3::new(0.0, 1.0, 0.0);
    let other = scene.spawn("other", None);
    scene.update_matrix_world(false);

    scene.transform_mut(parent).unwrap().position = Vec3::new(5.0, 0.0, 0.0);
    scene.attach(parent, other);
    scene.update_matrix_world(false);

    let p = scene.world_position(sibling).unwrap();
    assert!((p - Vec3::new(5.0, 1.0, 0.0)).length() < 1e-5, "{p}");
}

#[test]
fn partial_update_leaves_no_stale_siblings() {
    let mut scene = Scene::new();
    let parent = scene.spawn("parent", None);
    let a = scene.spawn("a", Some(parent));
    let b = scene.spawn("b", Some(parent));
    scene.update_matrix_world(false);

    scene.transform_mut(parent).unwrap().position = Vec3::new(3.0, 0.0, 0.0);
    scene.update_world_matrix(a, true, false);
    scene.update_matrix_world(false);

    for node in [a, b] {
        let p = scene.world_position(node).unwrap();
        assert!((p - Vec3::new(3.0, 0.0, 0.0)).length() < 1e-5, "{p}");
    }
}

// ============================================================================
// Visibility & traversal
// ============================================================================

#[test]
fn hidden_ancestor_hides_descendants() {
    let mut scene = Scene::new();
    let root = scene.spawn("root", None);
    let mid = scene.spawn("mid", Some(root));
    let leaf = scene.spawn("leaf", Some(mid));

    assert!(scene.is_effectively_visible(leaf));
    scene.set_visible(mid, false);
    assert!(!scene.is_effectively_visible(leaf));
    assert!(scene.is_effectively_visible(root));

    let mut all = Vec::new();
    scene.traverse(root, |h, _| all.push(h));
    assert_eq!(all, vec![root, mid, leaf]);

    let mut visible = Vec::new();
    scene.traverse_visible(root, |h, _| visible.push(h));
    assert_eq!(visible, vec![root]);
}

#[test]
fn hidden_lights_are_inactive() {
    let mut scene = Scene::new();
    let group = scene.spawn("group", None);
    let light = scene.add_light(Light::new_ambient(Vec3::ONE, 0.5), Some(group));
    assert_eq!(scene.iter_active_lights().count(), 1);

    scene.set_visible(group, false);
    assert_eq!(scene.iter_active_lights().count(), 0);
    assert!(scene.light(light).is_some());
}

// ============================================================================
// Camera
// ============================================================================

#[test]
fn perspective_frustum_culls_behind_camera() {
    let mut scene = Scene::new();
    let cam = scene.add_camera(Camera::new_perspective(60.0, 1.0, 0.1, 50.0), None);
    scene.transform_mut(cam).unwrap().position = Vec3::new(0.0, 0.0, 10.0);
    scene.update_matrix_world(false);

    let frustum = scene.camera(cam).unwrap().frustum();
    assert!(frustum.intersects_sphere(&Sphere::new(Vec3::ZERO, 1.0)));
    assert!(!frustum.intersects_sphere(&Sphere::new(Vec3::new(0.0, 0.0, 20.0), 1.0)));
    assert!(!frustum.intersects_sphere(&Sphere::new(Vec3::new(0.0, 0.0, -100.0), 1.0)));
    assert!(frustum.intersects_sphere(&Sphere::new(Vec3::new(0.0, 0.0, 20.0), 11.0)));
}

#[test]
fn orthographic_frustum_is_a_box() {
    let mut scene = Scene::new();
    let cam = scene.add_camera(Camera::new_orthographic(-2.0, 2.0, 2.0, -2.0, 0.1, 20.0), None);
    scene.transform_mut(cam).unwrap().position = Vec3::new(0.0, 0.0, 5.0);
    scene.update_matrix_world(false);

    let camera = scene.camera(cam).unwrap();
    assert!(camera.is_orthographic());
    let frustum = camera.frustum();
    assert!(frustum.contains_point(Vec3::new(1.9, -1.9, 0.0)));
    assert!(!frustum.contains_point(Vec3::new(2.1, 0.0, 0.0)));
}
