//! Shadow map tests
//!
//! Renders a caster between a light and the ground and checks the stored
//! depths, the visibility queries receivers use and the shaded receiver.

use futures::executor::block_on;
use glam::{Quat, Vec3};
use trellis::assets::Assets;
use trellis::renderer::{HeadlessDevice, OutputColorSpace, Renderer, RendererSettings, ShadowMapKind};
use trellis::resources::Material;
use trellis::resources::primitives::{PlaneOptions, create_box, create_plane};
use trellis::scene::{Camera, Light, Mesh, NodeHandle, Scene};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings(kind: ShadowMapKind) -> RendererSettings {
    let mut settings = RendererSettings {
        output_color_space: OutputColorSpace::Linear,
        ..Default::default()
    };
    settings.shadow_map.enabled = true;
    settings.shadow_map.kind = kind;
    settings
}

/// Ground plane at y = 0 and a 2-unit box floating at y = 2.
fn stage() -> (Scene, Assets, NodeHandle) {
    stage_with(Material::new_lambert(Vec3::ONE))
}

/// [`stage`] with `occluder` as the box material.
fn stage_with(occluder: Material) -> (Scene, Assets, NodeHandle) {
    init_logger();
    let mut scene = Scene::new();
    let mut assets = Assets::new();

    let camera = scene.add_camera(Camera::new_perspective(60.0, 1.0, 0.1, 100.0), None);
    scene.transform_mut(camera).unwrap().position = Vec3::new(0.0, 6.0, 10.0);

    let white = assets.add_material(Material::new_lambert(Vec3::ONE));
    let ground = assets.add_geometry(create_plane(PlaneOptions {
        width: 20.0,
        height: 20.0,
        ..Default::default()
    }));
    let mut floor = Mesh::new(ground, white);
    floor.receive_shadow = true;
    let floor = scene.add_mesh("floor", floor, None);
    scene.transform_mut(floor).unwrap().rotation = Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2);

    let cube = assets.add_geometry(create_box(2.0, 2.0, 2.0));
    let occluder = assets.add_material(occluder);
    let mut occluder = Mesh::new(cube, occluder);
    occluder.cast_shadow = true;
    let occluder = scene.add_mesh("occluder", occluder, None);
    scene.transform_mut(occluder).unwrap().position = Vec3::new(0.0, 2.0, 0.0);

    (scene, assets, camera)
}

fn sun(scene: &mut Scene) -> NodeHandle {
    let mut light = Light::new_directional(Vec3::ONE, 1.0);
    light.cast_shadow = true;
    light.shadow.map_size = 128;
    light.shadow.far = 20.0;
    let node = scene.add_light(light, None);
    scene.transform_mut(node).unwrap().position = Vec3::new(0.0, 10.0, 0.0);
    node
}

// ============================================================================
// Directional
// ============================================================================

#[test]
fn directional_map_records_the_caster() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = stage();
    let light = sun(&mut scene);
    let mut renderer = Renderer::new(HeadlessDevice::new(32, 32), settings(ShadowMapKind::Pcf));
    renderer.render(&mut scene, camera, &mut assets)?;

    let depths = block_on(renderer.shadow_map_depth(light).expect("shadow map rendered"))?;
    assert_eq!(depths.len(), 128 * 128);
    let min = depths.iter().copied().fold(f32::MAX, f32::min);
    let max = depths.iter().copied().fold(f32::MIN, f32::max);
    assert!(min < max, "caster must leave a footprint ({min}..{max})");
    assert!((max - 1.0).abs() < 1e-6, "uncovered texels keep the clear depth");
    Ok(())
}

#[test]
fn directional_visibility_under_and_beside_the_caster() -> anyhow::Result<()> {
    for kind in [ShadowMapKind::Basic, ShadowMapKind::Pcf] {
        let (mut scene, mut assets, camera) = stage();
        let light = sun(&mut scene);
        let mut renderer = Renderer::new(HeadlessDevice::new(32, 32), settings(kind));
        renderer.render(&mut scene, camera, &mut assets)?;

        let under = block_on(renderer.shadow_visibility(light, Vec3::ZERO).expect("map"))?;
        let beside = block_on(renderer.shadow_visibility(light, Vec3::new(4.0, 0.0, 0.0)).expect("map"))?;
        assert!(under < 0.01, "{kind:?}: point under the box is shadowed, got {under}");
        assert!((beside - 1.0).abs() < 1e-6, "{kind:?}: point beside the box is lit, got {beside}");
    }
    Ok(())
}

#[test]
fn transparent_caster_leaves_the_receiver_lit() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = stage_with(Material::new_lambert(Vec3::ONE).with_opacity(0.5));
    let light = sun(&mut scene);
    let mut renderer = Renderer::new(HeadlessDevice::new(32, 32), settings(ShadowMapKind::Basic));
    renderer.render(&mut scene, camera, &mut assets)?;

    let under = block_on(renderer.shadow_visibility(light, Vec3::ZERO).expect("map"))?;
    assert!((under - 1.0).abs() < 1e-6, "got {under}");
    let depths = block_on(renderer.shadow_map_depth(light).expect("map"))?;
    assert!(depths.iter().all(|d| (*d - 1.0).abs() < 1e-6), "nothing is drawn into the map");
    Ok(())
}

#[test]
fn shadowed_receiver_pixels_are_darker() -> anyhow::Result<()> {
    let (mut scene, mut assets, _) = stage();
    let light = sun(&mut scene);
    scene.transform_mut(light).unwrap().position = Vec3::new(5.0, 10.0, 0.0);

    // Straight down, screen x along world x; the box covers columns 12..20.
    let camera = scene.add_camera(Camera::new_perspective(60.0, 1.0, 0.1, 100.0), None);
    {
        let transform = scene.transform_mut(camera).unwrap();
        transform.position = Vec3::new(0.0, 10.0, 0.0);
        transform.rotation = Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2);
    }

    let mut renderer = Renderer::new(HeadlessDevice::new(32, 32), settings(ShadowMapKind::Basic));
    renderer.render(&mut scene, camera, &mut assets)?;

    // Column 10 sees the floor near x = -2, column 6 near x = -3.4.
    let shadowed = renderer.device().display_pixel(10, 16);
    let lit = renderer.device().display_pixel(6, 16);
    assert!(shadowed.x < 0.1, "floor behind the box is dark, got {shadowed}");
    assert!(lit.x > 0.9, "floor outside the shadow keeps its color, got {lit}");

    let expected = block_on(renderer.shadow_visibility(light, Vec3::new(-2.0, 0.0, 0.0)).expect("map"))?;
    assert!(expected < 0.01, "CPU lookup agrees, got {expected}");
    Ok(())
}

#[test]
fn no_map_without_shadows_enabled() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = stage();
    let light = sun(&mut scene);
    let mut renderer = Renderer::new(HeadlessDevice::new(32, 32), RendererSettings::default());
    renderer.render(&mut scene, camera, &mut assets)?;

    assert!(renderer.shadow_visibility(light, Vec3::ZERO).is_none());
    assert!(renderer.shadow_map_depth(light).is_none());
    Ok(())
}

#[test]
fn maps_are_released_when_the_light_stops_casting() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = stage();
    let light = sun(&mut scene);
    let mut renderer = Renderer::new(HeadlessDevice::new(32, 32), settings(ShadowMapKind::Basic));
    renderer.render(&mut scene, camera, &mut assets)?;
    assert!(renderer.shadow_map_depth(light).is_some());

    scene.light_mut(light).unwrap().cast_shadow = false;
    renderer.render(&mut scene, camera, &mut assets)?;
    assert!(renderer.shadow_map_depth(light).is_none());
    Ok(())
}

// ============================================================================
// Point
// ============================================================================

#[test]
fn point_light_shadows_straight_down() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = stage();
    let mut light = Light::new_point(Vec3::ONE, 1.0, 0.0);
    light.cast_shadow = true;
    light.shadow.map_size = 64;
    let light = scene.add_light(light, None);
    scene.transform_mut(light).unwrap().position = Vec3::new(0.0, 5.0, 0.0);

    let mut renderer = Renderer::new(HeadlessDevice::new(32, 32), settings(ShadowMapKind::Basic));
    renderer.render(&mut scene, camera, &mut assets)?;

    let under = block_on(renderer.shadow_visibility(light, Vec3::ZERO).expect("map"))?;
    assert!(under < 0.01, "got {under}");
    let above = block_on(renderer.shadow_visibility(light, Vec3::new(0.0, 8.0, 0.0)).expect("map"))?;
    assert!((above - 1.0).abs() < 1e-6, "got {above}");
    Ok(())
}

// ============================================================================
// Spot
// ============================================================================

#[test]
fn spot_light_shadows_inside_its_cone() -> anyhow::Result<()> {
    let (mut scene, mut assets, camera) = stage();
    let mut light = Light::new_spot(Vec3::ONE, 1.0, 0.0, std::f32::consts::FRAC_PI_6, 0.0);
    light.cast_shadow = true;
    light.shadow.map_size = 128;
    light.shadow.far = 20.0;
    let light = scene.add_light(light, None);
    scene.transform_mut(light).unwrap().position = Vec3::new(0.0, 8.0, 0.0);

    let mut renderer = Renderer::new(HeadlessDevice::new(32, 32), settings(ShadowMapKind::Pcf));
    renderer.render(&mut scene, camera, &mut assets)?;

    let depths = block_on(renderer.shadow_map_depth(light).expect("spot map"))?;
    assert_eq!(depths.len(), 128 * 128);

    let under = block_on(renderer.shadow_visibility(light, Vec3::ZERO).expect("map"))?;
    assert!(under < 0.01, "point under the box is shadowed, got {under}");
    let beside = block_on(renderer.shadow_visibility(light, Vec3::new(3.0, 0.0, 0.0)).expect("map"))?;
    assert!((beside - 1.0).abs() < 1e-6, "point inside the cone but clear of the box is lit, got {beside}");
    let outside = block_on(renderer.shadow_visibility(light, Vec3::new(9.0, 0.0, 0.0)).expect("map"))?;
    assert!((outside - 1.0).abs() < 1e-6, "point outside the cone is lit, got {outside}");
    Ok(())
}
