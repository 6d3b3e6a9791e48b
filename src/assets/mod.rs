//! CPU-side resource store.
//!
//! [`Assets`] owns geometries, materials, textures, render targets and
//! uniform groups. Scene components refer to them by handle. GPU state for
//! these lives in the renderer's caches; disposing an asset here notifies
//! every subscribed renderer so it can free the matching GPU objects before
//! the handle is forgotten.

pub mod storage;

pub use storage::AssetStorage;

use flume::Receiver;
use slotmap::new_key_type;

use crate::resources::geometry::Geometry;
use crate::resources::material::Material;
use crate::resources::render_target::RenderTarget;
use crate::resources::texture::Texture;
use crate::resources::uniforms::UniformGroup;
use crate::utils::events::EventChannel;

new_key_type! {
    pub struct GeometryHandle;
    pub struct MaterialHandle;
    pub struct TextureHandle;
    pub struct RenderTargetHandle;
    pub struct UniformGroupHandle;
}

/// Sent once per disposed asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeEvent {
    Geometry(GeometryHandle),
    Material(MaterialHandle),
    Texture(TextureHandle),
    RenderTarget(RenderTargetHandle),
    UniformGroup(UniformGroupHandle),
}

#[derive(Debug, Default)]
pub struct Assets {
    pub geometries: AssetStorage<GeometryHandle, Geometry>,
    pub materials: AssetStorage<MaterialHandle, Material>,
    pub textures: AssetStorage<TextureHandle, Texture>,
    pub render_targets: AssetStorage<RenderTargetHandle, RenderTarget>,
    pub uniform_groups: AssetStorage<UniformGroupHandle, UniformGroup>,

    disposals: EventChannel<DisposeEvent>,
}

macro_rules! asset_accessors {
    ($field:ident, $handle:ty, $asset:ty, $variant:ident, $add:ident, $get:ident, $get_mut:ident, $dispose:ident) => {
        pub fn $add(&mut self, asset: impl Into<$asset>) -> $handle {
            self.$field.add(asset)
        }

        #[must_use]
        pub fn $get(&self, handle: $handle) -> Option<&$asset> {
            self.$field.get(handle)
        }

        pub fn $get_mut(&mut self, handle: $handle) -> Option<&mut $asset> {
            self.$field.get_mut(handle)
        }

        /// Removes the asset and notifies subscribers. Disposing an unknown
        /// handle does nothing.
        pub fn $dispose(&mut self, handle: $handle) -> Option<$asset> {
            let removed = self.$field.remove(handle)?;
            self.disposals.emit(DisposeEvent::$variant(handle));
            Some(removed)
        }
    };
}

impl Assets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver of dispose notifications. Each subscriber sees every event
    /// emitted after it subscribed.
    pub fn subscribe_disposals(&mut self) -> Receiver<DisposeEvent> {
        self.disposals.subscribe()
    }

    asset_accessors!(geometries, GeometryHandle, Geometry, Geometry, add_geometry, get_geometry, get_geometry_mut, dispose_geometry);
    asset_accessors!(materials, MaterialHandle, Material, Material, add_material, get_material, get_material_mut, dispose_material);
    asset_accessors!(textures, TextureHandle, Texture, Texture, add_texture, get_texture, get_texture_mut, dispose_texture);
    asset_accessors!(
        render_targets,
        RenderTargetHandle,
        RenderTarget,
        RenderTarget,
        add_render_target,
        get_render_target,
        get_render_target_mut,
        dispose_render_target
    );
    asset_accessors!(
        uniform_groups,
        UniformGroupHandle,
        UniformGroup,
        UniformGroup,
        add_uniform_group,
        get_uniform_group,
        get_uniform_group_mut,
        dispose_uniform_group
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_dispose_notifies_subscribers() {
        let mut assets = Assets::new();
        let a = assets.subscribe_disposals();
        let b = assets.subscribe_disposals();

        let mat = assets.add_material(Material::new_basic(Vec3::ONE));
        assert!(assets.dispose_material(mat).is_some());
        assert!(assets.dispose_material(mat).is_none(), "second dispose is a no-op");

        assert_eq!(a.try_iter().collect::<Vec<_>>(), vec![DisposeEvent::Material(mat)]);
        assert_eq!(b.try_iter().count(), 1);
        assert!(assets.get_material(mat).is_none());
    }
}
