//! Renderer integration tests
//!
//! Tests for:
//! - Drawing to the display and reading it back
//! - State diffing across frames
//! - Program sharing and reference counting through disposal
//! - Compile failures isolated to one material
//! - Blending, clipping and background
//! - Offscreen targets, multisampling and readback latency
//! - Settings changes and program warm-up

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::executor::block_on;
use futures::task::noop_waker_ref;
use glam::{Vec3, Vec4};
use trellis::assets::Assets;
use trellis::renderer::programs::ProgramOwner;
use trellis::renderer::{
    Diagnostic, HeadlessDevice, OutputColorSpace, Rect, Renderer, RendererSettings, ToneMapping,
};
use trellis::resources::primitives::create_box;
use trellis::resources::{Material, RenderTarget, Texture};
use trellis::resources::texture::Image;
use trellis::scene::{Background, Camera, Mesh, NodeHandle, Scene};
use trellis::renderer::GpuDevice;

// ============================================================================
// Helpers
// ============================================================================

const SIZE: u32 = 64;
const RED: Vec3 = Vec3::new(1.0, 0.0, 0.0);
const BLUE: Vec3 = Vec3::new(0.0, 0.0, 1.0);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn linear_settings() -> RendererSettings {
    RendererSettings {
        output_color_space: OutputColorSpace::Linear,
        ..Default::default()
    }
}

/// Scene with a camera at z = 5 looking down -Z.
fn fixture() -> (Scene, Assets, NodeHandle) {
    init_logger();
    let mut scene = Scene::new();
    let assets = Assets::new();
    let camera = scene.add_camera(Camera::new_perspective(45.0, 1.0, 0.1, 100.0), None);
    scene.transform_mut(camera).unwrap().position = Vec3::new(0.0, 0.0, 5.0);
    (scene, assets, camera)
}

fn add_box(scene: &mut Scene, assets: &mut Assets, size: f32, color: Vec3, position: Vec3) -> NodeHandle {
    let geometry = assets.add_geometry(create_box(size, size, size));
    let material = assets.add_material(Material::new_basic(color));
    let node = scene.add_mesh("box", Mesh::new(geometry, material), None);
    scene.transform_mut(node).unwrap().position = position;
    node
}

fn renderer(settings: RendererSettings) -> Renderer<HeadlessDevice> {
    Renderer::new(HeadlessDevice::new(SIZE, SIZE), settings)
}

fn assert_color(actual: Vec4, expected: Vec3) {
    assert!(
        (actual.truncate() - expected).abs().max_element() < 0.02,
        "expected {expected}, got {actual}"
    );
}

// ============================================================================
// Display output
// ============================================================================

#[test]
fn basic_box_reaches_display() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);

    let mut renderer = renderer(RendererSettings::default());
    renderer.render(&mut scene, camera, &mut assets)?;

    assert_color(renderer.device().display_pixel(SIZE / 2, SIZE / 2), RED);
    assert_color(renderer.device().display_pixel(1, 1), Vec3::ZERO);

    let bytes = block_on(renderer.read_pixels(Rect::new(SIZE / 2, SIZE / 2, 1, 1)))?;
    assert_eq!(bytes, vec![255, 0, 0, 255]);
    Ok(())
}

#[test]
fn missing_camera_is_an_error() {
    let (mut scene, mut assets, _) = fixture();
    let empty = scene.spawn("not a camera", None);
    let mut renderer = renderer(linear_settings());
    assert!(renderer.render(&mut scene, empty, &mut assets).is_err());
}

#[test]
fn background_color_replaces_clear_color() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    scene.background = Background::Color(Vec3::new(0.0, 1.0, 0.0));

    let mut renderer = renderer(linear_settings());
    renderer.render(&mut scene, camera, &mut assets)?;
    assert_color(renderer.device().display_pixel(0, 0), Vec3::new(0.0, 1.0, 0.0));
    Ok(())
}

// ============================================================================
// State diffing & statistics
// ============================================================================

#[test]
fn second_frame_filters_redundant_state() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);
    let mut renderer = renderer(linear_settings());

    renderer.render(&mut scene, camera, &mut assets)?;
    let first = renderer.info();
    renderer.render(&mut scene, camera, &mut assets)?;
    let second = renderer.info();

    assert_eq!(second.frame, 2);
    assert_eq!(second.calls, 1);
    assert_eq!(second.triangles, 12);
    assert!(second.state_changes < first.state_changes);
    assert!(second.state_changes_skipped > 0);
    assert_eq!(second.memory.geometries, 1);
    assert_eq!(first.device.programs_created, second.device.programs_created);
    Ok(())
}

// ============================================================================
// Programs
// ============================================================================

#[test]
fn identical_fingerprints_share_one_program() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let a = assets.add_material(Material::new_basic(RED));
    let b = assets.add_material(Material::new_basic(BLUE));
    scene.add_mesh("a", Mesh::new(geometry, a), None);
    let right = scene.add_mesh("b", Mesh::new(geometry, b), None);
    scene.transform_mut(right).unwrap().position = Vec3::new(1.5, 0.0, 0.0);

    let mut renderer = renderer(linear_settings());
    renderer.render(&mut scene, camera, &mut assets)?;

    let pa = renderer.programs().owner_programs(ProgramOwner::Material(a));
    let pb = renderer.programs().owner_programs(ProgramOwner::Material(b));
    assert_eq!(pa.len(), 1);
    assert_eq!(pa[0].id, pb[0].id);
    assert_eq!(pa[0].ref_count, 2);
    let live = renderer.device().live_programs();

    assets.dispose_material(a);
    renderer.process_disposals();
    let pb = renderer.programs().owner_programs(ProgramOwner::Material(b));
    assert_eq!(pb[0].ref_count, 1);
    assert_eq!(renderer.device().live_programs(), live, "program must survive one disposal");

    assets.dispose_material(b);
    renderer.process_disposals();
    assert!(renderer.programs().owner_programs(ProgramOwner::Material(b)).is_empty());
    assert_eq!(renderer.device().live_programs(), live - 1);
    Ok(())
}

#[test]
fn compile_failure_skips_only_that_material() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);

    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let broken = assets.add_material(
        Material::new_shader("broken", "fn vs_main() -> vec4<f32> { return vec4<f32>(0.0); }").with_name("broken"),
    );
    let node = scene.add_mesh("broken", Mesh::new(geometry, broken), None);
    scene.transform_mut(node).unwrap().position = Vec3::new(0.0, 3.0, 0.0);

    let mut renderer = renderer(linear_settings());
    let diagnostics = renderer.diagnostics();
    renderer.render(&mut scene, camera, &mut assets)?;

    let failures: Vec<Diagnostic> = diagnostics.try_iter().collect();
    assert_eq!(failures.len(), 1);
    match &failures[0] {
        Diagnostic::ProgramCompileFailed { material, program } => {
            assert_eq!(material, "broken");
            assert!(program.log.contains("fs_main"), "log: {}", program.log);
            assert!(!program.source.is_empty());
        }
        other => panic!("unexpected diagnostic {other:?}"),
    }
    assert_color(renderer.device().display_pixel(SIZE / 2, SIZE / 2), RED);

    renderer.render(&mut scene, camera, &mut assets)?;
    assert_eq!(diagnostics.try_iter().count(), 0, "a failed material is not retried");
    assert!(renderer.programs().has_failed(ProgramOwner::Material(broken)));
    Ok(())
}

#[test]
fn settings_change_releases_programs() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);
    let mut renderer = renderer(linear_settings());
    renderer.render(&mut scene, camera, &mut assets)?;
    assert_eq!(renderer.programs().len(), 1);

    let mut settings = renderer.settings().clone();
    settings.sort_objects = false;
    renderer.set_settings(settings.clone());
    assert_eq!(renderer.programs().len(), 1, "sorting does not touch shaders");

    settings.tone_mapping = ToneMapping::Reinhard;
    renderer.set_settings(settings);
    assert_eq!(renderer.programs().len(), 0);
    assert_eq!(renderer.device().live_programs(), 0);

    renderer.render(&mut scene, camera, &mut assets)?;
    // Mesh program plus the output pass.
    assert_eq!(renderer.programs().len(), 2);
    Ok(())
}

#[test]
fn compile_warms_programs_before_first_frame() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);
    let hidden = add_box(&mut scene, &mut assets, 1.0, BLUE, Vec3::new(0.0, 0.0, -50.0));
    scene.set_visible(hidden, false);

    let mut renderer = renderer(linear_settings());
    let compiled = renderer.compile(&mut scene, camera, &mut assets)?;
    assert_eq!(compiled, 1, "both basic materials share a program");
    let created = renderer.device().stats().programs_created;

    renderer.render(&mut scene, camera, &mut assets)?;
    assert_eq!(renderer.device().stats().programs_created, created);
    Ok(())
}

// ============================================================================
// Blending & clipping
// ============================================================================

#[test]
fn transparent_item_blends_over_opaque() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);

    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let glass = assets.add_material(Material::new_basic(BLUE).with_opacity(0.5));
    let node = scene.add_mesh("glass", Mesh::new(geometry, glass), None);
    scene.transform_mut(node).unwrap().position = Vec3::new(0.0, 0.0, 2.5);

    let mut renderer = renderer(linear_settings());
    renderer.render(&mut scene, camera, &mut assets)?;

    assert_color(renderer.device().display_pixel(SIZE / 2, SIZE / 2), Vec3::new(0.5, 0.0, 0.5));
    Ok(())
}

#[test]
fn global_clipping_plane_discards_negative_side() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);

    let mut settings = linear_settings();
    settings.clipping_planes = vec![[1.0, 0.0, 0.0, 0.0]];
    let mut renderer = renderer(settings);
    renderer.render(&mut scene, camera, &mut assets)?;

    let device = renderer.device();
    assert_color(device.display_pixel(SIZE / 2 - 8, SIZE / 2), Vec3::ZERO);
    assert_color(device.display_pixel(SIZE / 2 + 8, SIZE / 2), RED);
    Ok(())
}

// ============================================================================
// Textures
// ============================================================================

#[test]
fn texture_region_update_uploads_only_the_range() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    let node = add_box(&mut scene, &mut assets, 2.0, Vec3::ONE, Vec3::ZERO);
    let texture = assets.add_texture(Texture::new(Image::solid_rgba8(4, 4, [255, 255, 255, 255])));
    let material = scene.mesh(node).unwrap().material().unwrap();
    assets.get_material_mut(material).unwrap().set_map(Some(texture))?;

    let mut renderer = renderer(linear_settings());
    renderer.render(&mut scene, camera, &mut assets)?;
    let before = renderer.device().stats();
    assert_eq!(renderer.info().memory.textures, 1);

    assert!(assets.get_texture_mut(texture).unwrap().update_region(0, &[255, 0, 0, 255]));
    renderer.render(&mut scene, camera, &mut assets)?;
    let after = renderer.device().stats();

    assert_eq!(after.texture_partial_uploads, before.texture_partial_uploads + 1);
    assert_eq!(after.texture_uploads, before.texture_uploads);
    assert_eq!(after.textures_created, before.textures_created);

    renderer.render(&mut scene, camera, &mut assets)?;
    assert_eq!(renderer.device().stats().texture_partial_uploads, after.texture_partial_uploads);
    Ok(())
}

#[test]
fn disposed_assets_release_gpu_objects() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    let node = add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);
    let mut renderer = renderer(linear_settings());
    renderer.render(&mut scene, camera, &mut assets)?;
    assert_eq!(renderer.info().memory.geometries, 1);

    let geometry = scene.mesh(node).unwrap().geometry;
    assets.dispose_geometry(geometry);
    renderer.render(&mut scene, camera, &mut assets)?;

    let info = renderer.info();
    assert_eq!(info.memory.geometries, 0);
    assert_eq!(info.calls, 0);
    Ok(())
}

// ============================================================================
// Render targets & readback
// ============================================================================

#[test]
fn render_target_pixels_read_back() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);
    let target = assets.add_render_target(RenderTarget::new(16, 16));

    let mut renderer = renderer(RendererSettings::default());
    renderer.set_render_target(Some(target));
    renderer.render(&mut scene, camera, &mut assets)?;

    let center = block_on(renderer.read_render_target_pixels(target, Rect::new(8, 8, 1, 1)))?;
    assert_eq!(center, vec![255, 0, 0, 255]);
    let corner = block_on(renderer.read_render_target_pixels(target, Rect::new(0, 0, 1, 1)))?;
    assert_eq!(corner, vec![0, 0, 0, 255]);

    let outside = block_on(renderer.read_render_target_pixels(target, Rect::new(10, 10, 8, 8)));
    assert!(outside.is_err());
    Ok(())
}

#[test]
fn unrendered_target_readback_fails() {
    let (_, mut assets, _) = fixture();
    let target = assets.add_render_target(RenderTarget::new(4, 4));
    let mut renderer = renderer(linear_settings());
    assert!(block_on(renderer.read_render_target_pixels(target, Rect::from_size(4, 4))).is_err());
}

#[test]
fn multisampled_target_resolves_by_blit() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);
    let target = assets.add_render_target(RenderTarget::new(16, 16).with_samples(4));

    let mut renderer = renderer(linear_settings());
    renderer.set_render_target(Some(target));
    renderer.render(&mut scene, camera, &mut assets)?;

    assert!(renderer.device().stats().blits >= 1);
    let center = block_on(renderer.read_render_target_pixels(target, Rect::new(8, 8, 1, 1)))?;
    assert_eq!(center, vec![255, 0, 0, 255]);
    Ok(())
}

#[test]
fn disposing_the_bound_target_falls_back_to_display() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);
    let target = assets.add_render_target(RenderTarget::new(16, 16));

    let mut renderer = renderer(linear_settings());
    renderer.set_render_target(Some(target));
    renderer.render(&mut scene, camera, &mut assets)?;
    assert_eq!(renderer.info().memory.render_targets, 1);

    assets.dispose_render_target(target);
    renderer.render(&mut scene, camera, &mut assets)?;
    assert_eq!(renderer.render_target(), None);
    assert_eq!(renderer.info().memory.render_targets, 0);
    assert_color(renderer.device().display_pixel(SIZE / 2, SIZE / 2), RED);
    Ok(())
}

#[test]
fn readback_reschedules_until_fence_signals() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = fixture();
    add_box(&mut scene, &mut assets, 2.0, RED, Vec3::ZERO);
    let device = HeadlessDevice::new(SIZE, SIZE).with_readback_latency(2);
    let mut renderer = Renderer::new(device, linear_settings());
    renderer.render(&mut scene, camera, &mut assets)?;

    let mut future = renderer.read_pixels(Rect::new(SIZE / 2, SIZE / 2, 1, 1));
    let mut cx = Context::from_waker(noop_waker_ref());
    let mut pending = 0;
    let bytes = loop {
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Pending => pending += 1,
            Poll::Ready(result) => break result?,
        }
    };
    assert_eq!(pending, 2);
    assert_eq!(future.polls(), 3);
    assert_eq!(bytes, vec![255, 0, 0, 255]);
    Ok(())
}
