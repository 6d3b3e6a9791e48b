//! Settings and device capability tests
//!
//! Tests for:
//! - Serde round trips and defaults of renderer settings
//! - Graceful degradation when the device lacks a feature

use glam::Vec3;
use trellis::assets::Assets;
use trellis::renderer::settings::DeviceCapabilities;
use trellis::renderer::{Diagnostic, HeadlessDevice, Rect, Renderer, RendererSettings, ShadowMapKind, ToneMapping};
use trellis::resources::material::Precision;
use trellis::resources::primitives::create_box;
use trellis::resources::{Material, RenderTarget};
use trellis::scene::{Camera, Mesh, NodeHandle, Scene};
use trellis::renderer::GpuDevice;

fn red_box_scene() -> (Scene, Assets, NodeHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut scene = Scene::new();
    let mut assets = Assets::new();
    let camera = scene.add_camera(Camera::new_perspective(45.0, 1.0, 0.1, 100.0), None);
    scene.transform_mut(camera).unwrap().position = Vec3::new(0.0, 0.0, 5.0);
    let geometry = assets.add_geometry(create_box(2.0, 2.0, 2.0));
    let material = assets.add_material(Material::new_basic(Vec3::X));
    scene.add_mesh("box", Mesh::new(geometry, material), None);
    (scene, assets, camera)
}

// ============================================================================
// Serialization
// ============================================================================

#[test]
fn settings_round_trip_through_json() {
    let mut settings = RendererSettings::default();
    settings.tone_mapping = ToneMapping::AcesFilmic;
    settings.tone_mapping_exposure = 1.5;
    settings.shadow_map.enabled = true;
    settings.shadow_map.kind = ShadowMapKind::Basic;
    settings.clipping_planes = vec![[0.0, 1.0, 0.0, -0.5]];

    let json = serde_json::to_string(&settings).unwrap();
    let back: RendererSettings = serde_json::from_str(&json).unwrap();
    assert_eq!(back, settings);
}

#[test]
fn missing_fields_take_defaults() {
    let settings: RendererSettings = serde_json::from_str(r#"{ "sort_objects": false }"#).unwrap();
    assert!(!settings.sort_objects);
    assert_eq!(settings.tone_mapping, ToneMapping::None);
    assert_eq!(settings.max_texture_units, RendererSettings::default().max_texture_units);
    assert!(settings.needs_output_pass(), "sRGB output is the default");
}

// ============================================================================
// Capability fallbacks
// ============================================================================

#[test]
fn precision_downgrade_is_reported_once() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = red_box_scene();
    let caps = DeviceCapabilities {
        max_precision: Precision::Medium,
        ..Default::default()
    };
    let mut renderer = Renderer::new(HeadlessDevice::with_capabilities(16, 16, caps), RendererSettings::default());
    let diagnostics = renderer.diagnostics();

    renderer.render(&mut scene, camera, &mut assets)?;
    renderer.render(&mut scene, camera, &mut assets)?;

    let downgrades: Vec<_> = diagnostics
        .try_iter()
        .filter(|d| matches!(d, Diagnostic::PrecisionDowngraded { .. }))
        .collect();
    assert_eq!(
        downgrades,
        vec![Diagnostic::PrecisionDowngraded {
            requested: Precision::High,
            used: Precision::Medium,
        }]
    );
    Ok(())
}

#[test]
fn missing_msaa_renders_single_sampled() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = red_box_scene();
    let caps = DeviceCapabilities {
        max_samples: 1,
        ..Default::default()
    };
    let target = assets.add_render_target(RenderTarget::new(16, 16).with_samples(4));
    let mut renderer = Renderer::new(HeadlessDevice::with_capabilities(16, 16, caps), RendererSettings::default());
    let diagnostics = renderer.diagnostics();
    renderer.set_render_target(Some(target));
    renderer.render(&mut scene, camera, &mut assets)?;

    assert!(diagnostics.try_iter().any(|d| matches!(
        d,
        Diagnostic::CapabilityFallback {
            feature: "multisampling",
            ..
        }
    )));
    assert_eq!(renderer.device().stats().blits, 0);
    let center = futures::executor::block_on(renderer.read_render_target_pixels(target, Rect::new(8, 8, 1, 1)))?;
    assert_eq!(center, vec![255, 0, 0, 255]);
    Ok(())
}

#[test]
fn missing_float_targets_still_present_output() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = red_box_scene();
    let caps = DeviceCapabilities {
        float_render_targets: false,
        ..Default::default()
    };
    let mut settings = RendererSettings::default();
    settings.tone_mapping = ToneMapping::Linear;
    let mut renderer = Renderer::new(HeadlessDevice::with_capabilities(16, 16, caps), settings);
    let diagnostics = renderer.diagnostics();
    renderer.render(&mut scene, camera, &mut assets)?;

    assert!(diagnostics.try_iter().any(|d| matches!(
        d,
        Diagnostic::CapabilityFallback {
            feature: "float render targets",
            ..
        }
    )));
    let pixel = renderer.device().display_pixel(8, 8);
    assert!((pixel.x - 1.0).abs() < 0.01 && pixel.y < 0.01, "{pixel}");
    Ok(())
}
