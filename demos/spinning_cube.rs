//! Spinning Cube
//!
//! Renders a lit, shadowed cube on the headless device for a few frames and
//! prints the last one as ASCII art.
//!
//! ```sh
//! RUST_LOG=trellis=debug cargo run --example spinning_cube
//! ```

use std::f32::consts::TAU;

use futures::executor::block_on;
use trellis::prelude::*;

const WIDTH: u32 = 48;
const HEIGHT: u32 = 24;
const FRAMES: u32 = 30;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut assets = Assets::new();
    let mut scene = Scene::new();
    scene.background = Background::Color(Vec3::new(0.05, 0.05, 0.08));

    let cube_geometry = assets.add_geometry(primitives::create_box(1.5, 1.5, 1.5));
    let cube_material = assets.add_material(Material::new_standard(Vec3::new(0.9, 0.4, 0.1)));
    let mut cube = Mesh::new(cube_geometry, cube_material);
    cube.cast_shadow = true;
    let cube = scene.add_mesh("cube", cube, None);
    scene.transform_mut(cube).unwrap().position = Vec3::new(0.0, 1.0, 0.0);

    let floor_geometry = assets.add_geometry(primitives::create_plane(primitives::PlaneOptions {
        width: 8.0,
        height: 8.0,
        ..Default::default()
    }));
    let floor_material = assets.add_material(Material::new_lambert(Vec3::splat(0.6)));
    let mut floor = Mesh::new(floor_geometry, floor_material);
    floor.receive_shadow = true;
    let floor = scene.add_mesh("floor", floor, None);
    scene.transform_mut(floor).unwrap().rotation = Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2);

    scene.add_light(Light::new_ambient(Vec3::ONE, 0.3), None);
    let mut sun = Light::new_directional(Vec3::ONE, 1.0);
    sun.cast_shadow = true;
    sun.shadow.map_size = 256;
    sun.shadow.far = 30.0;
    let sun = scene.add_light(sun, None);
    scene.transform_mut(sun).unwrap().position = Vec3::new(3.0, 8.0, 2.0);

    let camera = scene.add_camera(
        Camera::new_perspective(50.0, WIDTH as f32 / HEIGHT as f32, 0.1, 100.0),
        None,
    );
    {
        let t = scene.transform_mut(camera).unwrap();
        t.position = Vec3::new(0.0, 3.0, 6.0);
        t.look_at(Vec3::new(0.0, 0.5, 0.0), Vec3::Y);
    }

    let mut settings = RendererSettings::default();
    settings.shadow_map.enabled = true;
    settings.tone_mapping = ToneMapping::AcesFilmic;
    let mut renderer = Renderer::new(HeadlessDevice::new(WIDTH, HEIGHT), settings);
    let diagnostics = renderer.diagnostics();

    let warmed = renderer.compile(&mut scene, camera, &mut assets)?;
    log::info!("Compiled {warmed} programs before the first frame");

    for frame in 0..FRAMES {
        let angle = frame as f32 / FRAMES as f32 * TAU;
        scene.transform_mut(cube).unwrap().set_rotation_euler(angle * 0.5, angle, 0.0);
        renderer.render(&mut scene, camera, &mut assets)?;
    }

    for diagnostic in diagnostics.try_iter() {
        log::warn!("{diagnostic:?}");
    }

    let info = renderer.info();
    log::info!(
        "frame {}: {} calls, {} triangles, {} state changes ({} filtered), {} programs",
        info.frame,
        info.calls,
        info.triangles,
        info.state_changes,
        info.state_changes_skipped,
        info.programs
    );

    let pixels = block_on(renderer.read_pixels(Rect::from_size(WIDTH, HEIGHT)))?;
    print_ascii(&pixels);
    Ok(())
}

fn print_ascii(rgba: &[u8]) {
    const RAMP: &[u8] = b" .:-=+*#%@";
    for row in rgba.chunks_exact(WIDTH as usize * 4) {
        let line: String = row
            .chunks_exact(4)
            .map(|p| {
                let luma = 0.2126 * f32::from(p[0]) + 0.7152 * f32::from(p[1]) + 0.0722 * f32::from(p[2]);
                let i = (luma / 255.0 * (RAMP.len() - 1) as f32).round() as usize;
                RAMP[i.min(RAMP.len() - 1)] as char
            })
            .collect();
        println!("{line}");
    }
}
