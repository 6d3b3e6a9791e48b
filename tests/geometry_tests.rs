//! Draw submission tests
//!
//! Tests for:
//! - Multi-material meshes split by geometry groups
//! - Instanced drawing
//! - Frustum and layer culling
//! - Uniform groups shared between materials
//! - Attribute edits reaching the GPU copy

use glam::{Mat4, Vec3};
use trellis::assets::Assets;
use trellis::math::Layers;
use trellis::renderer::{HeadlessDevice, OutputColorSpace, Renderer, RendererSettings};
use trellis::resources::primitives::create_box;
use trellis::resources::{Material, UniformGroup};
use trellis::scene::{InstanceData, Mesh, NodeHandle, Scene};
use trellis::renderer::GpuDevice;

// ============================================================================
// Helpers
// ============================================================================

struct Stage {
    scene: Scene,
    assets: Assets,
    camera: NodeHandle,
    renderer: Renderer<HeadlessDevice>,
}

impl Stage {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut scene = Scene::new();
        let camera = scene.add_camera(trellis::scene::Camera::new_perspective(45.0, 1.0, 0.1, 100.0), None);
        scene.transform_mut(camera).unwrap().position = Vec3::new(0.0, 0.0, 8.0);
        let settings = RendererSettings {
            output_color_space: OutputColorSpace::Linear,
            ..Default::default()
        };
        Self {
            scene,
            assets: Assets::new(),
            camera,
            renderer: Renderer::new(HeadlessDevice::new(32, 32), settings),
        }
    }

    fn render(&mut self) {
        self.renderer
            .render(&mut self.scene, self.camera, &mut self.assets)
            .expect("camera exists");
    }

    fn cube(&mut self, color: Vec3) -> NodeHandle {
        let geometry = self.assets.add_geometry(create_box(1.0, 1.0, 1.0));
        let material = self.assets.add_material(Material::new_basic(color));
        self.scene.add_mesh("cube", Mesh::new(geometry, material), None)
    }
}

// ============================================================================
// Submission
// ============================================================================

#[test]
fn groups_split_draws_only_for_multi_material_meshes() {
    let mut stage = Stage::new();
    let geometry = stage.assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let red = stage.assets.add_material(Material::new_basic(Vec3::X));
    let green = stage.assets.add_material(Material::new_basic(Vec3::Y));

    // Box faces alternate between the two slots.
    let mut geo = create_box(1.0, 1.0, 1.0);
    geo.clear_groups();
    geo.add_group(0, 18, 0);
    geo.add_group(18, 18, 1);
    let split = stage.assets.add_geometry(geo);

    stage.scene.add_mesh("single", Mesh::new(geometry, red), None);
    let multi = stage.scene.add_mesh("multi", Mesh::with_materials(split, [red, green]), None);
    stage.scene.transform_mut(multi).unwrap().position = Vec3::new(2.0, 0.0, 0.0);
    stage.render();

    let info = stage.renderer.info();
    assert_eq!(info.calls, 3);
    assert_eq!(info.triangles, 24);
}

#[test]
fn instanced_mesh_is_one_call() {
    let mut stage = Stage::new();
    let node = stage.cube(Vec3::ONE);
    let offsets = (0..4).map(|i| Mat4::from_translation(Vec3::new(i as f32 * 1.5 - 2.25, 0.0, 0.0)));
    stage.scene.mesh_mut(node).unwrap().instances = Some(InstanceData::new(offsets.collect()));
    stage.render();

    let info = stage.renderer.info();
    assert_eq!(info.calls, 1);
    assert_eq!(info.triangles, 48);
}

#[test]
fn empty_instance_set_draws_nothing() {
    let mut stage = Stage::new();
    let node = stage.cube(Vec3::ONE);
    let mut mesh = stage.scene.mesh(node).unwrap().clone();
    mesh.instances = Some(InstanceData::new(Vec::new()));
    mesh.frustum_culled = false;
    stage.scene.set_mesh(node, mesh);
    stage.render();
    assert_eq!(stage.renderer.info().calls, 0);
}

#[test]
fn removed_instanced_meshes_release_their_buffers() {
    let mut stage = Stage::new();
    let geometry = stage.assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let material = stage.assets.add_material(Material::new_basic(Vec3::ONE));
    let offsets: Vec<Mat4> = (0..3).map(|i| Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0))).collect();

    let mut settled = None;
    for _ in 0..5 {
        let node = stage.scene.add_mesh("instanced", Mesh::new(geometry, material), None);
        stage.scene.mesh_mut(node).unwrap().instances = Some(InstanceData::new(offsets.clone()));
        stage.render();
        assert_eq!(stage.renderer.info().calls, 1);

        stage.scene.remove(node);
        stage.render();
        let live = stage.renderer.device().live_buffers();
        assert_eq!(*settled.get_or_insert(live), live, "instance buffers accumulate");
    }
}

#[test]
fn clearing_instances_releases_the_buffer() {
    let mut stage = Stage::new();
    let node = stage.cube(Vec3::ONE);
    stage.render();
    let plain = stage.renderer.device().live_buffers();

    stage.scene.mesh_mut(node).unwrap().instances = Some(InstanceData::new(vec![Mat4::IDENTITY; 2]));
    stage.render();
    assert_eq!(stage.renderer.device().live_buffers(), plain + 1);

    stage.scene.mesh_mut(node).unwrap().instances = None;
    stage.render();
    assert_eq!(stage.renderer.device().live_buffers(), plain);
}

// ============================================================================
// Culling
// ============================================================================

#[test]
fn off_screen_meshes_are_culled_unless_opted_out() {
    let mut stage = Stage::new();
    let node = stage.cube(Vec3::ONE);
    stage.scene.transform_mut(node).unwrap().position = Vec3::new(0.0, 0.0, 20.0);
    stage.render();
    assert_eq!(stage.renderer.info().calls, 0);

    stage.scene.mesh_mut(node).unwrap().frustum_culled = false;
    stage.render();
    assert_eq!(stage.renderer.info().calls, 1);
}

#[test]
fn layer_mismatch_skips_mesh() {
    let mut stage = Stage::new();
    let node = stage.cube(Vec3::ONE);
    stage.scene.set_layers(node, Layers::from_mask(0b100));
    stage.render();
    assert_eq!(stage.renderer.info().calls, 0);

    stage.scene.camera_mut(stage.camera).unwrap().layers.enable(2);
    stage.render();
    assert_eq!(stage.renderer.info().calls, 1);
}

#[test]
fn degenerate_geometry_contributes_nothing() {
    let mut stage = Stage::new();
    let mut geo = create_box(1.0, 1.0, 1.0);
    geo.set_draw_range(0, 0);
    let geometry = stage.assets.add_geometry(geo);
    let material = stage.assets.add_material(Material::new_basic(Vec3::ONE));
    let parent = stage.scene.add_mesh("empty", Mesh::new(geometry, material), None);
    let child = stage.cube(Vec3::ONE);
    stage.scene.add_child(parent, child);
    stage.scene.transform_mut(parent).unwrap().position = Vec3::new(0.5, 0.0, 0.0);
    stage.render();

    assert_eq!(stage.renderer.info().calls, 1);
    let p = stage.scene.world_position(child).unwrap();
    assert!((p - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-5, "still traversed for matrices");
}

// ============================================================================
// Buffers
// ============================================================================

#[test]
fn uniform_group_is_uploaded_once_per_version() {
    let mut stage = Stage::new();
    let group = stage
        .assets
        .add_uniform_group(UniformGroup::new("wind").with("strength", 0.5_f32).with("direction", Vec3::X));
    let node = stage.cube(Vec3::ONE);
    let material = stage.scene.mesh(node).unwrap().material().unwrap();
    stage.assets.get_material_mut(material).unwrap().add_uniform_group(group);

    stage.render();
    let bound = stage.renderer.device().bound_uniform_buffer(1);
    assert!(bound.is_some());
    let uploads = stage.renderer.device().stats().buffer_uploads;

    stage.render();
    assert_eq!(stage.renderer.device().stats().buffer_uploads, uploads);

    stage
        .assets
        .get_uniform_group_mut(group)
        .unwrap()
        .set("strength", 0.75_f32)
        .unwrap();
    stage.render();
    assert!(stage.renderer.device().stats().buffer_uploads > uploads);
    assert_eq!(stage.renderer.device().bound_uniform_buffer(1), bound, "buffer is reused");
    assert_eq!(stage.renderer.info().memory.uniform_buffers, 2, "lights block plus the group");
}

#[test]
fn attribute_write_uploads_partially() {
    let mut stage = Stage::new();
    let node = stage.cube(Vec3::ONE);
    stage.render();
    let before = stage.renderer.device().stats();

    let geometry = stage.scene.mesh(node).unwrap().geometry;
    let position = stage
        .assets
        .get_geometry_mut(geometry)
        .unwrap()
        .attribute_mut("position")
        .unwrap();
    assert!(position.write_f32(0, &[-0.6, -0.5, 0.5]));
    stage.render();

    let after = stage.renderer.device().stats();
    assert_eq!(after.buffers_created, before.buffers_created);
    assert_eq!(after.buffer_partial_uploads, before.buffer_partial_uploads + 1);
}
