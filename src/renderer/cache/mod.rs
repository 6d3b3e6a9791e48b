//! GPU-side caches for CPU resources.
//!
//! Each cache stores the version it last uploaded and transfers only what
//! changed: whole objects when storage must be respecified, recorded ranges
//! otherwise. Entries are dropped when the owning asset is disposed.

mod geometries;
mod render_targets;
mod textures;
mod uniform_buffers;

pub use geometries::{GeometryCache, GpuAttribute, GpuGeometry, GpuIndex};
pub use render_targets::{GpuRenderTarget, MsaaMode, RenderTargetCache, TargetDesc, TargetKey};
pub use textures::{GpuTexture, TextureCache};
pub use uniform_buffers::{UniformBlockKey, UniformBufferCache};

/// Live GPU objects owned by the caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub geometries: usize,
    pub textures: usize,
    pub render_targets: usize,
    pub uniform_buffers: usize,
}
