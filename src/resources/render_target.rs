use std::borrow::Cow;

use crate::resources::texture::{TextureFormat, TextureSampler};

/// Offscreen color (+ optional depth/stencil) surface.
///
/// The renderer owns the framebuffer, attachments and any multisample
/// backing store; this object only describes them. Size changes are applied
/// to the existing GPU objects in place.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub name: Cow<'static, str>,
    width: u32,
    height: u32,
    samples: u32,
    format: TextureFormat,
    depth_buffer: bool,
    stencil_buffer: bool,
    depth_texture: bool,
    pub sampler: TextureSampler,
    version: u64,
}

impl RenderTarget {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            name: Cow::Borrowed("RenderTarget"),
            width: width.max(1),
            height: height.max(1),
            samples: 1,
            format: TextureFormat::Rgba8Unorm,
            depth_buffer: true,
            stencil_buffer: false,
            depth_texture: false,
            sampler: TextureSampler::default(),
            version: 1,
        }
    }

    #[must_use]
    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples.max(1);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_depth(mut self, depth_buffer: bool, stencil_buffer: bool) -> Self {
        self.depth_buffer = depth_buffer || stencil_buffer;
        self.stencil_buffer = stencil_buffer;
        self
    }

    /// Exposes depth as a sampleable texture instead of a renderbuffer.
    #[must_use]
    pub fn with_depth_texture(mut self) -> Self {
        self.depth_buffer = true;
        self.depth_texture = true;
        self
    }

    pub fn set_size(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) != (self.width, self.height) {
            self.width = width;
            self.height = height;
            self.version = self.version.wrapping_add(1);
        }
    }

    pub fn set_samples(&mut self, samples: u32) {
        let samples = samples.max(1);
        if samples != self.samples {
            self.samples = samples;
            self.version = self.version.wrapping_add(1);
        }
    }

    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn samples(&self) -> u32 {
        self.samples
    }

    #[must_use]
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    #[must_use]
    pub fn has_depth(&self) -> bool {
        self.depth_buffer
    }

    #[must_use]
    pub fn has_stencil(&self) -> bool {
        self.stencil_buffer
    }

    #[must_use]
    pub fn has_depth_texture(&self) -> bool {
        self.depth_texture
    }

    /// Depth attachment format implied by the depth/stencil flags.
    #[must_use]
    pub fn depth_format(&self) -> Option<TextureFormat> {
        match (self.depth_buffer, self.stencil_buffer) {
            (_, true) => Some(TextureFormat::Depth24PlusStencil8),
            (true, false) => Some(TextureFormat::Depth32Float),
            (false, false) => None,
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}
