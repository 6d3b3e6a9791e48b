//! Transform and hierarchy tests
//!
//! Tests for:
//! - Euler composition order and handedness
//! - Lazy local matrix recomputation
//! - World matrix propagation through the scene graph
//! - Reparenting with and without world preservation

use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};

use glam::{Affine3A, Mat3, Quat, Vec3};
use trellis::math::{Euler, EulerOrder};
use trellis::scene::Scene;
use trellis::scene::transform::Transform;

// ============================================================================
// Helper
// ============================================================================

const EPSILON: f32 = 1e-4;

fn vec3_approx(a: Vec3, b: Vec3) -> bool {
    (a - b).abs().max_element() < EPSILON
}

fn quat_approx(a: Quat, b: Quat) -> bool {
    // q and -q are the same rotation
    a.dot(b).abs() > 1.0 - EPSILON
}

// ============================================================================
// Euler
// ============================================================================

#[test]
fn euler_y_quarter_turn_maps_x_to_negative_z() {
    let q = Euler::new(0.0, FRAC_PI_2, 0.0, EulerOrder::Xyz).to_quat();
    assert!(vec3_approx(q * Vec3::X, Vec3::NEG_Z));
}

#[test]
fn euler_order_is_intrinsic() {
    // XYZ composes as Rx * Ry * Rz, so Z is applied to the vector first.
    let e = Euler::new(FRAC_PI_2, 0.0, FRAC_PI_2, EulerOrder::Xyz);
    let expected = Quat::from_rotation_x(FRAC_PI_2) * Quat::from_rotation_z(FRAC_PI_2);
    assert!(quat_approx(e.to_quat(), expected));

    let zyx = Euler::new(FRAC_PI_2, 0.0, FRAC_PI_2, EulerOrder::Zyx);
    assert!(!quat_approx(e.to_quat(), zyx.to_quat()), "order must matter");
}

#[test]
fn euler_decomposition_recovers_angles_for_every_order() {
    for order in EulerOrder::ALL {
        let e = Euler::new(0.3, -0.7, 1.1, order);
        let back = Euler::from_quat(e.to_quat(), order);
        assert!(vec3_approx(e.to_vec3(), back.to_vec3()), "{order:?}: {back:?}");
        assert_eq!(back.order, order);
    }
}

#[test]
fn euler_gimbal_lock_still_reproduces_rotation() {
    let e = Euler::new(0.4, FRAC_PI_2, 0.2, EulerOrder::Xyz);
    let back = Euler::from_rotation_matrix(&Mat3::from_quat(e.to_quat()), EulerOrder::Xyz);
    assert!(quat_approx(e.to_quat(), back.to_quat()));
    assert!(back.z.abs() < EPSILON);
}

#[test]
fn euler_reorder_keeps_rotation() {
    let e = Euler::new(0.5, 0.25, -0.75, EulerOrder::Xyz);
    let r = e.reorder(EulerOrder::Yxz);
    assert_eq!(r.order, EulerOrder::Yxz);
    assert!(quat_approx(e.to_quat(), r.to_quat()));
}

// ============================================================================
// Transform
// ============================================================================

#[test]
fn transform_recomputes_local_matrix_only_when_changed() {
    let mut t = Transform::new();
    assert!(t.update_local_matrix());
    assert!(!t.update_local_matrix());

    t.position = Vec3::new(1.0, 2.0, 3.0);
    assert!(t.update_local_matrix());
    assert!(!t.update_local_matrix());

    t.scale = Vec3::splat(2.0);
    assert!(t.update_local_matrix());
    assert!(vec3_approx(t.local_matrix().transform_point3(Vec3::ONE), Vec3::new(3.0, 4.0, 5.0)));
}

#[test]
fn transform_euler_setter_matches_quaternion() {
    let mut t = Transform::new();
    t.set_rotation_euler(0.0, FRAC_PI_4, 0.0);
    assert!(quat_approx(t.rotation, Quat::from_rotation_y(FRAC_PI_4)));
    assert!((t.euler().y - FRAC_PI_4).abs() < EPSILON);
}

#[test]
fn transform_local_matrix_decomposes_into_trs() {
    let mut t = Transform::new();
    let m = Affine3A::from_scale_rotation_translation(
        Vec3::new(2.0, 1.0, 0.5),
        Quat::from_rotation_z(0.6),
        Vec3::new(-1.0, 4.0, 2.0),
    );
    t.set_local_matrix(m);
    assert!(vec3_approx(t.position, Vec3::new(-1.0, 4.0, 2.0)));
    assert!(vec3_approx(t.scale, Vec3::new(2.0, 1.0, 0.5)));
    assert!(quat_approx(t.rotation, Quat::from_rotation_z(0.6)));
}

#[test]
fn transform_look_at_points_negative_z_at_target() {
    let mut t = Transform::new();
    t.position = Vec3::new(0.0, 0.0, 5.0);
    t.look_at(Vec3::ZERO, Vec3::Y);
    assert!(vec3_approx(t.rotation * Vec3::NEG_Z, Vec3::NEG_Z));

    t.position = Vec3::new(5.0, 0.0, 0.0);
    t.look_at(Vec3::ZERO, Vec3::Y);
    assert!(vec3_approx(t.rotation * Vec3::NEG_Z, Vec3::NEG_X));
}

// ============================================================================
// Hierarchy
// ============================================================================

#[test]
fn world_matrix_composes_parent_then_child() {
    let mut scene = Scene::new();
    let parent = scene.spawn("parent", None);
    let child = scene.spawn("child", Some(parent));

    scene.set_local(parent, Vec3::new(10.0, 0.0, 0.0), Quat::from_rotation_y(FRAC_PI_2), Vec3::splat(2.0));
    scene.set_local(child, Vec3::new(1.0, 0.0, 0.0), Quat::IDENTITY, Vec3::ONE);
    scene.update_matrix_world(false);

    // child origin: scale 2, rotate +X onto -Z, then translate.
    let p = scene.world_position(child).unwrap();
    assert!(vec3_approx(p, Vec3::new(10.0, 0.0, -2.0)), "{p}");
}

#[test]
fn world_matrix_stays_stale_until_update() {
    let mut scene = Scene::new();
    let node = scene.spawn("node", None);
    scene.update_matrix_world(false);

    scene.transform_mut(node).unwrap().position = Vec3::new(3.0, 0.0, 0.0);
    assert!(vec3_approx(scene.world_position(node).unwrap(), Vec3::ZERO));

    scene.update_matrix_world(false);
    assert!(vec3_approx(scene.world_position(node).unwrap(), Vec3::new(3.0, 0.0, 0.0)));
}

#[test]
fn parent_change_propagates_to_deep_descendants() {
    let mut scene = Scene::new();
    let root = scene.spawn("root", None);
    let mut tip = root;
    for i in 0..5 {
        tip = scene.spawn(format!("link {i}"), Some(tip));
        scene.transform_mut(tip).unwrap().position = Vec3::Y;
    }
    scene.update_matrix_world(false);
    assert!(vec3_approx(scene.world_position(tip).unwrap(), Vec3::new(0.0, 5.0, 0.0)));

    scene.transform_mut(root).unwrap().position = Vec3::X;
    scene.update_matrix_world(false);
    assert!(vec3_approx(scene.world_position(tip).unwrap(), Vec3::new(1.0, 5.0, 0.0)));
}

#[test]
fn add_child_keeps_local_transform() {
    let mut scene = Scene::new();
    let a = scene.spawn("a", None);
    let b = scene.spawn("b", None);
    scene.transform_mut(a).unwrap().position = Vec3::new(5.0, 0.0, 0.0);
    scene.transform_mut(b).unwrap().position = Vec3::new(0.0, 1.0, 0.0);
    scene.update_matrix_world(false);

    scene.add_child(a, b);
    scene.update_matrix_world(false);
    assert!(vec3_approx(scene.world_position(b).unwrap(), Vec3::new(5.0, 1.0, 0.0)));
    assert_eq!(scene.node(b).unwrap().parent(), Some(a));
}

#[test]
fn attach_and_detach_preserve_world_transform() {
    let mut scene = Scene::new();
    let a = scene.spawn("a", None);
    let b = scene.spawn("b", None);
    scene.set_local(a, Vec3::new(5.0, 0.0, 0.0), Quat::from_rotation_z(FRAC_PI_2), Vec3::splat(2.0));
    scene.transform_mut(b).unwrap().position = Vec3::new(0.0, 1.0, 0.0);
    scene.update_matrix_world(false);
    let before = *scene.node(b).unwrap().world_matrix();

    scene.attach(a, b);
    scene.update_matrix_world(false);
    assert_eq!(scene.node(b).unwrap().parent(), Some(a));
    assert!(scene.node(b).unwrap().world_matrix().abs_diff_eq(before, EPSILON));
    assert!(!scene.roots().contains(&b));

    scene.detach(b);
    scene.update_matrix_world(false);
    assert_eq!(scene.node(b).unwrap().parent(), None);
    assert!(scene.roots().contains(&b));
    assert!(scene.node(b).unwrap().world_matrix().abs_diff_eq(before, EPSILON));
}

#[test]
fn camera_view_follows_its_node() {
    use trellis::scene::Camera;

    let mut scene = Scene::new();
    let rig = scene.spawn("rig", None);
    let cam = scene.add_camera(Camera::new_perspective(60.0, 1.0, 0.1, 100.0), Some(rig));
    scene.transform_mut(rig).unwrap().position = Vec3::new(0.0, 0.0, 10.0);
    scene.update_matrix_world(false);

    let camera = scene.camera(cam).unwrap();
    assert!(vec3_approx(camera.position(), Vec3::new(0.0, 0.0, 10.0)));
    let origin_in_view = camera.view_matrix().transform_point3(Vec3::ZERO);
    assert!(vec3_approx(origin_in_view, Vec3::new(0.0, 0.0, -10.0)));
}
