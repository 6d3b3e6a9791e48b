use rustc_hash::{FxHashMap, FxHashSet};

use crate::assets::TextureHandle;
use crate::renderer::device::{GpuDevice, TextureDesc, TextureId};
use crate::renderer::diagnostics::{Diagnostic, DiagnosticSink};
use crate::renderer::state::StateTracker;
use crate::resources::texture::{Image, Texture, TextureFormat};

/// Device copy of a [`Texture`].
#[derive(Debug, Clone, Copy)]
pub struct GpuTexture {
    pub id: TextureId,
    pub version: u64,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mip_levels: u32,
}

#[derive(Default)]
pub struct TextureCache {
    entries: FxHashMap<TextureHandle, GpuTexture>,
    /// Reported once, then left unbound.
    unsupported: FxHashSet<TextureHandle>,
}

impl TextureCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings the device copy up to date and returns it, or `None` when the
    /// device cannot hold this format.
    pub fn prepare<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        diagnostics: &DiagnosticSink,
        handle: TextureHandle,
        texture: &Texture,
    ) -> Option<TextureId> {
        let image = texture.image();
        if !device.capabilities().supports_format(image.format) {
            if self.unsupported.insert(handle) {
                log::warn!("Texture '{}' uses unsupported format {:?}", texture.name, image.format);
                diagnostics.report(Diagnostic::UnsupportedTextureFormat {
                    texture: texture.name.to_string(),
                    format: image.format,
                });
            }
            return None;
        }
        self.unsupported.remove(&handle);

        let mip_levels = texture.mip_level_count();
        let desc = TextureDesc {
            width: image.width,
            height: image.height,
            format: image.format,
            mip_levels,
        };

        let Some(entry) = self.entries.get_mut(&handle) else {
            let id = device.create_texture(&desc);
            upload_full(device, id, texture);
            let entry = GpuTexture {
                id,
                version: texture.version(),
                width: image.width,
                height: image.height,
                format: image.format,
                mip_levels,
            };
            self.entries.insert(handle, entry);
            return Some(id);
        };

        if entry.version == texture.version() {
            return Some(entry.id);
        }

        if entry.format != image.format || entry.mip_levels != mip_levels {
            device.delete_texture(entry.id);
            state.forget_texture(entry.id);
            entry.id = device.create_texture(&desc);
            upload_full(device, entry.id, texture);
        } else if entry.width != image.width || entry.height != image.height {
            device.resize_texture(entry.id, image.width, image.height);
            upload_full(device, entry.id, texture);
        } else {
            match texture.pending_ranges(entry.version) {
                // Flipped textures re-upload whole; ranges index the unflipped image.
                Some(ranges) if !texture.flip_y => {
                    for range in &ranges {
                        let end = (range.offset + range.count).min(image.data.len());
                        device.upload_texture_region(entry.id, range.offset, &image.data[range.offset..end]);
                    }
                    if texture.generate_mipmaps && !ranges.is_empty() {
                        device.generate_mipmaps(entry.id);
                    }
                }
                _ => upload_full(device, entry.id, texture),
            }
        }

        entry.version = texture.version();
        entry.width = image.width;
        entry.height = image.height;
        entry.format = image.format;
        entry.mip_levels = mip_levels;
        Some(entry.id)
    }

    #[must_use]
    pub fn get(&self, handle: TextureHandle) -> Option<&GpuTexture> {
        self.entries.get(&handle)
    }

    pub fn remove<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker, handle: TextureHandle) {
        self.unsupported.remove(&handle);
        if let Some(entry) = self.entries.remove(&handle) {
            device.delete_texture(entry.id);
            state.forget_texture(entry.id);
        }
    }

    pub fn clear<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker) {
        for (_, entry) in self.entries.drain() {
            device.delete_texture(entry.id);
            state.forget_texture(entry.id);
        }
        self.unsupported.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn upload_full<D: GpuDevice + ?Sized>(device: &mut D, id: TextureId, texture: &Texture) {
    let image = texture.image();
    if texture.flip_y {
        device.upload_texture(id, &flipped_rows(image));
    } else {
        device.upload_texture(id, &image.data);
    }
    device.set_texture_sampler(id, texture.sampler());
    if texture.generate_mipmaps {
        device.generate_mipmaps(id);
    }
}

fn flipped_rows(image: &Image) -> Vec<u8> {
    let row = image.width as usize * image.format.bytes_per_pixel();
    if row == 0 {
        return image.data.clone();
    }
    image.data.chunks(row).rev().flatten().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::HeadlessDevice;
    use crate::renderer::settings::DeviceCapabilities;
    use slotmap::KeyData;

    fn handle(n: u64) -> TextureHandle {
        TextureHandle::from(KeyData::from_ffi(n))
    }

    #[test]
    fn test_unchanged_texture_is_not_reuploaded() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let sink = DiagnosticSink::new();
        let mut cache = TextureCache::new();
        let tex = Texture::new(Image::solid_rgba8(2, 2, [255, 255, 255, 255]));

        cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).unwrap();
        cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).unwrap();
        assert_eq!(device.stats().textures_created, 1);
        assert_eq!(device.stats().texture_uploads, 1);
    }

    #[test]
    fn test_region_update_uploads_only_range() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let sink = DiagnosticSink::new();
        let mut cache = TextureCache::new();
        let mut tex = Texture::new(Image::solid_rgba8(4, 4, [0, 0, 0, 255]));

        let id = cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).unwrap();
        assert!(tex.update_region(0, &[255, 0, 0, 255]));
        cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).unwrap();

        let stats = device.stats();
        assert_eq!(stats.texture_uploads, 1);
        assert_eq!(stats.texture_partial_uploads, 1);
        assert_eq!(device.texel(id, 0, 0).unwrap().x, 1.0);
    }

    #[test]
    fn test_resize_keeps_texture_id() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let sink = DiagnosticSink::new();
        let mut cache = TextureCache::new();
        let mut tex = Texture::new(Image::solid_rgba8(2, 2, [0, 0, 0, 255]));

        let before = cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).unwrap();
        *tex.image_mut() = Image::solid_rgba8(8, 8, [0, 0, 0, 255]);
        let after = cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).unwrap();

        assert_eq!(before, after);
        assert_eq!(device.texture_size(after), Some((8, 8)));
        assert_eq!(device.stats().texture_resizes, 1);
    }

    #[test]
    fn test_flip_y_reverses_rows() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let sink = DiagnosticSink::new();
        let mut cache = TextureCache::new();
        let mut image = Image::solid_rgba8(1, 2, [0, 0, 0, 255]);
        image.data[..4].copy_from_slice(&[255, 0, 0, 255]);
        let mut tex = Texture::new(image);
        tex.flip_y = true;

        let id = cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).unwrap();
        assert_eq!(device.texel(id, 0, 0).unwrap().x, 0.0);
        assert_eq!(device.texel(id, 0, 1).unwrap().x, 1.0);
    }

    #[test]
    fn test_unsupported_format_reports_once() {
        let caps = DeviceCapabilities {
            float_textures: false,
            ..Default::default()
        };
        let mut device = HeadlessDevice::with_capabilities(4, 4, caps);
        let mut state = StateTracker::new();
        let sink = DiagnosticSink::new();
        let rx = sink.receiver();
        let mut cache = TextureCache::new();
        let tex = Texture::new(Image::new(2, 2, TextureFormat::Rgba32Float));

        assert!(cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).is_none());
        assert!(cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).is_none());
        assert_eq!(rx.drain().count(), 1);
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn test_mipmaps_generated_on_upload() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let sink = DiagnosticSink::new();
        let mut cache = TextureCache::new();
        let mut tex = Texture::new(Image::solid_rgba8(8, 4, [0, 0, 0, 255]));
        tex.generate_mipmaps = true;

        let id = cache.prepare(&mut device, &mut state, &sink, handle(1), &tex).unwrap();
        assert_eq!(device.texture_mip_levels(id), Some(4));
        assert_eq!(device.stats().mipmap_generations, 1);
    }
}
