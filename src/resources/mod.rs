//! CPU-side resource definitions. Nothing here touches the GPU:
//!
//! - [`Geometry`] / [`Attribute`]: vertex data, index, groups, bounds
//! - [`Material`]: kind, typed uniforms, pipeline settings
//! - [`Texture`] / [`RenderTarget`]: image data and offscreen surfaces
//! - [`UniformGroup`]: shared uniform blocks
//!
//! Every resource carries a version counter that the renderer's caches
//! compare against the version they last uploaded.

pub mod attribute;
pub mod geometry;
pub mod material;
pub mod primitives;
pub mod render_target;
pub mod shader_defines;
pub mod texture;
pub mod uniforms;
pub mod version_tracker;

pub use attribute::{Attribute, AttributeData, AttributeFormat, ComponentType};
pub use geometry::{Geometry, GeometryGroup};
pub use material::{
    BlendComponent, BlendFactor, BlendOperation, BlendState, Blending, CompareFunction, CustomShader, Material,
    MaterialFeatures, MaterialKind, MaterialSettings, Precision, Side,
};
pub use render_target::RenderTarget;
pub use shader_defines::ShaderDefines;
pub use texture::{FilterMode, Image, Texture, TextureFormat, TextureSampler, WrapMode};
pub use uniforms::{UniformGroup, UniformKind, UniformMap, UniformValue};
pub use version_tracker::{ChangeTracker, MutGuard, UpdateRange, UpdateRanges};
