use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::resources::version_tracker::{MutGuard, UpdateRange, UpdateRanges};

// ============================================================================
// Formats & sampling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth16Unorm,
    Depth24Plus,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm | TextureFormat::Depth16Unorm => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Depth24Plus
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8 => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    #[must_use]
    pub const fn is_depth(self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16Unorm
                | TextureFormat::Depth24Plus
                | TextureFormat::Depth32Float
                | TextureFormat::Depth24PlusStencil8
        )
    }

    #[must_use]
    pub const fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, TextureFormat::Rgba16Float | TextureFormat::Rgba32Float)
    }

    #[must_use]
    pub const fn is_srgb(self) -> bool {
        matches!(self, TextureFormat::Rgba8UnormSrgb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WrapMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSampler {
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    /// 1 = off.
    pub anisotropy: u16,
}

impl Default for TextureSampler {
    fn default() -> Self {
        Self {
            wrap_s: WrapMode::ClampToEdge,
            wrap_t: WrapMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            anisotropy: 1,
        }
    }
}

// ============================================================================
// Image
// ============================================================================

/// Tightly packed pixel rows, top row first.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
}

impl Image {
    /// Zero-filled image.
    #[must_use]
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
        }
    }

    /// Image filled with one RGBA8 color.
    #[must_use]
    pub fn solid_rgba8(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba.repeat(width as usize * height as usize);
        Self {
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            data,
        }
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

// ============================================================================
// Texture
// ============================================================================

/// CPU-side texture: an image, sampling state and a version.
///
/// Any edit through [`Texture::image_mut`] or [`Texture::needs_update`] asks
/// the renderer for a full re-upload. [`Texture::update_region`] writes bytes
/// in place and records the range so only those bytes are transferred.
#[derive(Debug, Clone)]
pub struct Texture {
    pub name: Cow<'static, str>,
    image: Image,
    sampler: TextureSampler,
    pub generate_mipmaps: bool,
    pub flip_y: bool,
    version: u64,
    ranges: UpdateRanges,
}

impl Texture {
    #[must_use]
    pub fn new(image: Image) -> Self {
        Self {
            name: Cow::Borrowed("Texture"),
            image,
            sampler: TextureSampler::default(),
            generate_mipmaps: false,
            flip_y: false,
            version: 1,
            ranges: UpdateRanges::new(1),
        }
    }

    #[must_use]
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Full edit: the whole image is re-specified on the next upload.
    pub fn image_mut(&mut self) -> MutGuard<'_, Image> {
        self.ranges.reset(self.version.wrapping_add(1));
        MutGuard::new(&mut self.image, &mut self.version)
    }

    #[must_use]
    pub fn sampler(&self) -> &TextureSampler {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> MutGuard<'_, TextureSampler> {
        self.ranges.reset(self.version.wrapping_add(1));
        MutGuard::new(&mut self.sampler, &mut self.version)
    }

    /// Writes `bytes` at `byte_offset` and records a partial update.
    ///
    /// Returns false, changing nothing, when the range falls outside the image.
    pub fn update_region(&mut self, byte_offset: usize, bytes: &[u8]) -> bool {
        let end = byte_offset + bytes.len();
        if end > self.image.data.len() {
            return false;
        }
        self.image.data[byte_offset..end].copy_from_slice(bytes);
        self.version = self.version.wrapping_add(1);
        self.ranges.record(byte_offset, bytes.len(), self.version);
        true
    }

    /// Flags the texture for a full re-upload.
    pub fn needs_update(&mut self) {
        self.version = self.version.wrapping_add(1);
        self.ranges.reset(self.version);
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn update_ranges(&self) -> &[UpdateRange] {
        self.ranges.as_slice()
    }

    /// Ranges still missing on a cache that uploaded at `cached_version`,
    /// or `None` when a full upload is required.
    #[must_use]
    pub fn pending_ranges(&self, cached_version: u64) -> Option<Vec<UpdateRange>> {
        self.ranges.pending_since(cached_version)
    }

    #[must_use]
    pub fn mip_level_count(&self) -> u32 {
        if self.generate_mipmaps {
            let largest = self.image.width.max(self.image.height).max(1);
            32 - largest.leading_zeros()
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_and_partial_updates() {
        let mut tex = Texture::new(Image::solid_rgba8(4, 4, [255, 0, 0, 255]));
        let v1 = tex.version();

        assert!(tex.update_region(0, &[0, 255, 0, 255]));
        assert_eq!(tex.version(), v1 + 1);
        assert_eq!(tex.pending_ranges(v1).map(|r| r.len()), Some(1));

        tex.image_mut().data[4] = 9;
        assert_eq!(tex.version(), v1 + 2);
        assert!(tex.pending_ranges(v1 + 1).is_none(), "full edit invalidates ranges");
        assert_eq!(tex.pending_ranges(v1 + 2).map(|r| r.len()), Some(0));

        assert!(!tex.update_region(63, &[1, 2]), "out of bounds writes are rejected");
    }

    #[test]
    fn test_mip_count() {
        let mut tex = Texture::new(Image::new(256, 64, TextureFormat::Rgba8Unorm));
        assert_eq!(tex.mip_level_count(), 1);
        tex.generate_mipmaps = true;
        assert_eq!(tex.mip_level_count(), 9);
    }
}
