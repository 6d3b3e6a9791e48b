#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

//! Trellis
//!
//! A retained-mode scene graph with lazily resolved world matrices and a
//! forward renderer that caches GPU programs, textures, framebuffers and
//! uniform blocks across frames while filtering redundant state changes.
//!
//! ```rust,ignore
//! use trellis::prelude::*;
//!
//! let mut assets = Assets::new();
//! let mut scene = Scene::new();
//! let cube = assets.add_geometry(primitives::create_box(1.0, 1.0, 1.0));
//! let red = assets.add_material(Material::new_basic(Vec3::new(1.0, 0.0, 0.0)));
//! scene.add_mesh("cube", Mesh::new(cube, red), None);
//!
//! let camera = scene.add_camera(Camera::new_perspective(45.0, 1.0, 0.1, 100.0), None);
//! scene.transform_mut(camera).unwrap().position = Vec3::new(0.0, 0.0, 5.0);
//!
//! let mut renderer = Renderer::new(HeadlessDevice::new(256, 256), RendererSettings::default());
//! renderer.render(&mut scene, camera, &mut assets)?;
//! ```

pub mod assets;
pub mod errors;
pub mod math;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod utils;

pub use assets::Assets;
pub use errors::{Result, TrellisError};
pub use renderer::{Renderer, RendererSettings};
pub use resources::{Geometry, Material, Texture};
pub use scene::{Camera, Light, Mesh, Node, NodeHandle, Scene};

/// Commonly used types in one import.
pub mod prelude {
    pub use crate::assets::{
        Assets, DisposeEvent, GeometryHandle, MaterialHandle, RenderTargetHandle, TextureHandle, UniformGroupHandle,
    };
    pub use crate::errors::{Result, TrellisError};
    pub use crate::math::{Affine3A, Box3, Euler, EulerOrder, Frustum, Layers, Mat3, Mat4, Plane, Quat, Sphere, Vec2, Vec3, Vec4};
    pub use crate::renderer::{
        Diagnostic, GpuDevice, HeadlessDevice, OutputColorSpace, ReadbackFuture, Rect, RenderInfo, Renderer,
        RendererSettings, ShadowMapKind, ToneMapping,
    };
    pub use crate::resources::primitives;
    pub use crate::resources::{
        Attribute, Blending, Geometry, Material, RenderTarget, Side, Texture, TextureFormat, UniformGroup, UniformValue,
    };
    pub use crate::scene::{Background, Camera, Fog, InstanceData, Light, Mesh, Node, NodeHandle, Scene, SceneEvent};
}
