//! Asset store tests
//!
//! Tests for:
//! - Dispose notifications and handle invalidation
//! - Material property validation
//! - Texture edits and the uploads they cause

use glam::{Vec3, Vec4};
use trellis::TrellisError;
use trellis::assets::{Assets, DisposeEvent};
use trellis::renderer::{GpuDevice, HeadlessDevice, OutputColorSpace, Renderer, RendererSettings};
use trellis::resources::primitives::create_box;
use trellis::resources::texture::FilterMode;
use trellis::resources::{Image, Material, Texture, UniformValue};
use trellis::scene::{Camera, Mesh, Scene};

// ============================================================================
// Disposal
// ============================================================================

#[test]
fn dispose_notifies_every_subscriber_once() {
    let mut assets = Assets::new();
    let early = assets.subscribe_disposals();
    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let late = assets.subscribe_disposals();
    let texture = assets.add_texture(Texture::new(Image::solid_rgba8(1, 1, [0, 0, 0, 255])));

    assert!(assets.dispose_geometry(geometry).is_some());
    assert!(assets.dispose_texture(texture).is_some());
    assert!(assets.dispose_texture(texture).is_none());

    let expected = vec![DisposeEvent::Geometry(geometry), DisposeEvent::Texture(texture)];
    assert_eq!(early.try_iter().collect::<Vec<_>>(), expected);
    assert_eq!(late.try_iter().collect::<Vec<_>>(), expected);
    assert!(assets.get_geometry(geometry).is_none());
}

#[test]
fn handles_are_not_reused_after_dispose() {
    let mut assets = Assets::new();
    let first = assets.add_material(Material::new_basic(Vec3::ONE));
    assets.dispose_material(first);
    let second = assets.add_material(Material::new_basic(Vec3::ONE));
    assert_ne!(first, second);
    assert!(assets.get_material(first).is_none());
}

// ============================================================================
// Materials
// ============================================================================

#[test]
fn built_in_materials_reject_unknown_properties() {
    let mut material = Material::new_basic(Vec3::ONE).with_name("paint");
    let err = material.set_value("roughness", 0.5_f32).unwrap_err();
    assert!(matches!(err, TrellisError::UnknownMaterialProperty { ref material, .. } if material == "paint"));

    let err = material.set_value("opacity", Vec3::ONE).unwrap_err();
    assert!(matches!(err, TrellisError::UniformTypeMismatch { .. }));

    let version = material.version();
    material.set_value("opacity", 0.25_f32).unwrap();
    assert!(material.version() > version);
    assert_eq!(material.value("opacity"), Some(&UniformValue::Float(0.25)));
}

#[test]
fn standard_material_exposes_pbr_parameters() {
    let mut material = Material::new_standard(Vec3::ONE);
    assert!(material.kind().is_lit());
    material.set_value("roughness", 0.2_f32).unwrap();
    material.set_value("metalness", 1.0_f32).unwrap();
}

#[test]
fn shader_material_declares_its_own_uniforms() {
    let mut material = Material::new_shader("waves", "fn vs_main() {}\nfn fs_main() {}");
    material.set_value("amplitude", 0.5_f32).unwrap();
    material.set_value("tint", Vec4::ONE).unwrap();
    assert!(matches!(
        material.set_value("amplitude", Vec3::ONE),
        Err(TrellisError::UniformTypeMismatch { .. })
    ));
}

// ============================================================================
// Textures
// ============================================================================

#[test]
fn texture_edits_choose_full_or_partial_upload() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut scene = Scene::new();
    let mut assets = Assets::new();
    let camera = scene.add_camera(Camera::new_perspective(45.0, 1.0, 0.1, 100.0), None);
    scene.transform_mut(camera).unwrap().position = Vec3::new(0.0, 0.0, 5.0);

    let texture = assets.add_texture(Texture::new(Image::solid_rgba8(8, 8, [255, 255, 255, 255])));
    let mut material = Material::new_basic(Vec3::ONE);
    material.set_map(Some(texture))?;
    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let material = assets.add_material(material);
    scene.add_mesh("box", Mesh::new(geometry, material), None);

    let settings = RendererSettings {
        output_color_space: OutputColorSpace::Linear,
        ..Default::default()
    };
    let mut renderer = Renderer::new(HeadlessDevice::new(16, 16), settings);
    renderer.render(&mut scene, camera, &mut assets)?;
    let base = renderer.device().stats();
    assert_eq!(base.textures_created, 1);

    // Sampler changes re-specify the texture.
    assets.get_texture_mut(texture).unwrap().sampler_mut().mag_filter = FilterMode::Nearest;
    renderer.render(&mut scene, camera, &mut assets)?;
    let stats = renderer.device().stats();
    assert_eq!(stats.texture_uploads, base.texture_uploads + 1);
    assert_eq!(stats.textures_created, 1);

    // Two region writes between frames are both delivered.
    let tex = assets.get_texture_mut(texture).unwrap();
    assert!(tex.update_region(0, &[0, 0, 0, 255]));
    assert!(tex.update_region(64, &[0, 0, 0, 255]));
    assert!(!tex.update_region(8 * 8 * 4, &[0]), "outside the image");
    renderer.render(&mut scene, camera, &mut assets)?;
    let after = renderer.device().stats();
    assert_eq!(after.texture_partial_uploads, stats.texture_partial_uploads + 2);
    assert_eq!(after.texture_uploads, stats.texture_uploads);

    // Resizing the image recreates storage in place.
    *assets.get_texture_mut(texture).unwrap().image_mut() = Image::solid_rgba8(16, 16, [0, 255, 0, 255]);
    renderer.render(&mut scene, camera, &mut assets)?;
    let resized = renderer.device().stats();
    assert_eq!(resized.textures_created, 1);
    assert_eq!(resized.texture_resizes, after.texture_resizes + 1);
    Ok(())
}

#[test]
fn disposed_texture_is_freed_on_next_frame() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let mut assets = Assets::new();
    let camera = scene.add_camera(Camera::new_perspective(45.0, 1.0, 0.1, 100.0), None);
    scene.transform_mut(camera).unwrap().position = Vec3::new(0.0, 0.0, 5.0);
    let texture = assets.add_texture(Texture::new(Image::solid_rgba8(2, 2, [255, 255, 255, 255])));
    let mut material = Material::new_basic(Vec3::ONE);
    material.set_map(Some(texture))?;
    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let material = assets.add_material(material);
    scene.add_mesh("box", Mesh::new(geometry, material), None);

    let mut renderer = Renderer::new(HeadlessDevice::new(16, 16), RendererSettings::default());
    renderer.render(&mut scene, camera, &mut assets)?;
    let live = renderer.device().live_textures();

    assets.dispose_texture(texture);
    renderer.render(&mut scene, camera, &mut assets)?;
    assert_eq!(renderer.info().memory.textures, 0);
    assert_eq!(renderer.device().live_textures(), live - 1);
    Ok(())
}
