use rustc_hash::FxHashMap;

use crate::assets::RenderTargetHandle;
use crate::renderer::device::{Attachment, FramebufferDesc, FramebufferId, GpuDevice, TextureDesc, TextureId};
use crate::renderer::diagnostics::{Diagnostic, DiagnosticSink};
use crate::renderer::state::StateTracker;
use crate::resources::render_target::RenderTarget;
use crate::resources::texture::{TextureFormat, TextureSampler};
use crate::scene::NodeHandle;
use crate::utils::WarnOnce;

/// Identifies a cached framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKey {
    User(RenderTargetHandle),
    Shadow(NodeHandle),
    /// Opaque-pass capture sampled by transmissive materials.
    Transmission,
    /// Scene color before tone mapping and encoding.
    Post,
}

/// Everything that decides a target's GPU layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub depth: Option<TextureFormat>,
    /// Depth is a sampleable texture rather than storage.
    pub depth_texture: bool,
    pub samples: u32,
    pub sampler: TextureSampler,
}

impl TargetDesc {
    #[must_use]
    pub fn from_target(target: &RenderTarget) -> Self {
        let (width, height) = target.size();
        Self {
            width,
            height,
            format: target.format(),
            depth: target.depth_format(),
            depth_texture: target.has_depth_texture(),
            samples: target.samples(),
            sampler: target.sampler,
        }
    }

    fn layout_eq(&self, other: &Self) -> bool {
        self.format == other.format
            && self.depth == other.depth
            && self.depth_texture == other.depth_texture
            && self.samples == other.samples
    }
}

/// How a multisampled target resolves into its color texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsaaMode {
    None,
    /// The device resolves implicitly on write.
    RenderToTexture,
    /// Draws go to a multisampled framebuffer that is blitted on resolve.
    Blit(FramebufferId),
}

#[derive(Debug, Clone, Copy)]
pub struct GpuRenderTarget {
    /// Single-sample framebuffer whose color is `color`.
    pub framebuffer: FramebufferId,
    pub color: TextureId,
    pub depth_texture: Option<TextureId>,
    pub msaa: MsaaMode,
    /// Sample count actually used.
    pub samples: u32,
    pub width: u32,
    pub height: u32,
    desc: TargetDesc,
    version: u64,
}

impl GpuRenderTarget {
    /// The framebuffer draws should go to.
    #[must_use]
    pub fn draw_framebuffer(&self) -> FramebufferId {
        match self.msaa {
            MsaaMode::Blit(fb) => fb,
            _ => self.framebuffer,
        }
    }

    /// Copies multisampled contents into the color texture. A no-op for
    /// single-sample and render-to-texture targets.
    pub fn resolve<D: GpuDevice + ?Sized>(&self, device: &mut D) {
        if let MsaaMode::Blit(fb) = self.msaa {
            device.blit_framebuffer(fb, Some(self.framebuffer), true, self.depth_texture.is_some());
        }
    }
}

#[derive(Default)]
pub struct RenderTargetCache {
    entries: FxHashMap<TargetKey, GpuRenderTarget>,
}

impl RenderTargetCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the GPU objects for `key`, creating or updating them.
    ///
    /// Size changes reuse the existing framebuffers. Format, depth or
    /// sample-count changes rebuild them.
    pub fn prepare<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        warnings: &mut WarnOnce,
        diagnostics: &DiagnosticSink,
        key: TargetKey,
        desc: TargetDesc,
        version: u64,
    ) -> GpuRenderTarget {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.version == version && entry.desc == desc {
                return *entry;
            }
            if entry.desc.layout_eq(&desc) {
                if entry.width != desc.width || entry.height != desc.height {
                    resize(device, entry, desc.width, desc.height);
                }
                if entry.desc.sampler != desc.sampler {
                    device.set_texture_sampler(entry.color, &desc.sampler);
                }
                entry.desc = desc;
                entry.version = version;
                return *entry;
            }
            let old = *entry;
            self.entries.remove(&key);
            destroy(device, state, &old);
        }

        let created = create(device, warnings, diagnostics, desc, version);
        self.entries.insert(key, created);
        created
    }

    #[must_use]
    pub fn get(&self, key: TargetKey) -> Option<&GpuRenderTarget> {
        self.entries.get(&key)
    }

    pub fn remove<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker, key: TargetKey) {
        if let Some(entry) = self.entries.remove(&key) {
            destroy(device, state, &entry);
        }
    }

    /// Drops shadow maps of lights that no longer cast shadows.
    pub fn retain_shadows<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        mut keep: impl FnMut(NodeHandle) -> bool,
    ) {
        let stale: Vec<TargetKey> = self
            .entries
            .keys()
            .filter(|k| matches!(k, TargetKey::Shadow(node) if !keep(*node)))
            .copied()
            .collect();
        for key in stale {
            self.remove(device, state, key);
        }
    }

    pub fn clear<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker) {
        for (_, entry) in self.entries.drain() {
            destroy(device, state, &entry);
        }
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

fn create<D: GpuDevice + ?Sized>(
    device: &mut D,
    warnings: &mut WarnOnce,
    diagnostics: &DiagnosticSink,
    requested: TargetDesc,
    version: u64,
) -> GpuRenderTarget {
    let caps = device.capabilities().clone();
    // Fallbacks change the local copy; the entry keeps what was asked for.
    let mut desc = requested;

    if desc.format.is_float() && !caps.float_render_targets {
        if warnings.warn("float-render-targets", || {
            format!("Float render targets unsupported, using Rgba8Unorm instead of {:?}", desc.format)
        }) {
            diagnostics.report(Diagnostic::CapabilityFallback {
                feature: "float render targets",
                fallback: "rgba8unorm color",
            });
        }
        desc.format = TextureFormat::Rgba8Unorm;
    }
    if desc.depth_texture && !caps.depth_textures {
        if warnings.warn("depth-textures", || "Depth textures unsupported, using depth storage".to_owned()) {
            diagnostics.report(Diagnostic::CapabilityFallback {
                feature: "depth textures",
                fallback: "depth storage",
            });
        }
        desc.depth_texture = false;
    }

    let mut samples = desc.samples.max(1);
    if samples > 1 && caps.max_samples <= 1 {
        if warnings.warn("msaa", || format!("Multisampling unsupported, rendering {samples}x target single-sampled")) {
            diagnostics.report(Diagnostic::CapabilityFallback {
                feature: "multisampling",
                fallback: "single-sampled rendering",
            });
        }
        samples = 1;
    }
    samples = samples.min(caps.max_samples.max(1));

    let color = device.create_texture(&TextureDesc {
        width: desc.width,
        height: desc.height,
        format: desc.format,
        mip_levels: 1,
    });
    device.set_texture_sampler(color, &desc.sampler);

    let depth_texture = match desc.depth {
        Some(format) if desc.depth_texture => Some(device.create_texture(&TextureDesc {
            width: desc.width,
            height: desc.height,
            format,
            mip_levels: 1,
        })),
        _ => None,
    };
    let depth_attachment = match (desc.depth, depth_texture) {
        (_, Some(texture)) => Some(Attachment::Texture(texture)),
        (Some(format), None) => Some(Attachment::Storage(format)),
        (None, None) => None,
    };

    let msaa_mode = if samples <= 1 {
        MsaaMode::None
    } else if caps.multisampled_render_to_texture {
        MsaaMode::RenderToTexture
    } else {
        log::debug!("Resolving {samples}x target by blit");
        let fb = device.create_framebuffer(&FramebufferDesc {
            width: desc.width,
            height: desc.height,
            color: Some(Attachment::Storage(desc.format)),
            depth: desc.depth.map(Attachment::Storage),
            samples,
        });
        MsaaMode::Blit(fb)
    };

    let framebuffer = device.create_framebuffer(&FramebufferDesc {
        width: desc.width,
        height: desc.height,
        color: Some(Attachment::Texture(color)),
        depth: depth_attachment,
        samples: if msaa_mode == MsaaMode::RenderToTexture { samples } else { 1 },
    });

    GpuRenderTarget {
        framebuffer,
        color,
        depth_texture,
        msaa: msaa_mode,
        samples,
        width: desc.width,
        height: desc.height,
        desc: requested,
        version,
    }
}

fn resize<D: GpuDevice + ?Sized>(device: &mut D, entry: &mut GpuRenderTarget, width: u32, height: u32) {
    device.resize_texture(entry.color, width, height);
    if let Some(depth) = entry.depth_texture {
        device.resize_texture(depth, width, height);
    }
    device.resize_framebuffer(entry.framebuffer, width, height);
    if let MsaaMode::Blit(fb) = entry.msaa {
        device.resize_framebuffer(fb, width, height);
    }
    entry.width = width;
    entry.height = height;
}

fn destroy<D: GpuDevice + ?Sized>(device: &mut D, state: &mut StateTracker, entry: &GpuRenderTarget) {
    if let MsaaMode::Blit(fb) = entry.msaa {
        device.delete_framebuffer(fb);
        state.forget_framebuffer(fb);
    }
    device.delete_framebuffer(entry.framebuffer);
    state.forget_framebuffer(entry.framebuffer);
    device.delete_texture(entry.color);
    state.forget_texture(entry.color);
    if let Some(depth) = entry.depth_texture {
        device.delete_texture(depth);
        state.forget_texture(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::HeadlessDevice;
    use crate::renderer::settings::DeviceCapabilities;

    fn prepare(device: &mut HeadlessDevice, cache: &mut RenderTargetCache, target: &RenderTarget) -> GpuRenderTarget {
        let mut state = StateTracker::new();
        let mut warnings = WarnOnce::new();
        let sink = DiagnosticSink::new();
        cache.prepare(
            device,
            &mut state,
            &mut warnings,
            &sink,
            TargetKey::Post,
            TargetDesc::from_target(target),
            target.version(),
        )
    }

    #[test]
    fn test_resize_is_in_place() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut cache = RenderTargetCache::new();
        let mut target = RenderTarget::new(16, 16);

        let first = prepare(&mut device, &mut cache, &target);
        target.set_size(32, 8);
        let second = prepare(&mut device, &mut cache, &target);

        assert_eq!(first.framebuffer, second.framebuffer);
        assert_eq!(first.color, second.color);
        assert_eq!(device.texture_size(second.color), Some((32, 8)));
        assert_eq!(device.stats().framebuffers_created, 1);
        assert_eq!(device.stats().framebuffer_resizes, 1);
    }

    #[test]
    fn test_msaa_uses_blit_resolve_without_render_to_texture() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut cache = RenderTargetCache::new();
        let target = RenderTarget::new(8, 8).with_samples(4);

        let gpu = prepare(&mut device, &mut cache, &target);
        let MsaaMode::Blit(msaa) = gpu.msaa else {
            panic!("expected blit resolve");
        };
        assert_eq!(device.framebuffer_samples(msaa), Some(4));
        assert_eq!(gpu.draw_framebuffer(), msaa);

        gpu.resolve(&mut device);
        assert_eq!(device.stats().blits, 1);
    }

    #[test]
    fn test_msaa_render_to_texture() {
        let caps = DeviceCapabilities {
            multisampled_render_to_texture: true,
            ..Default::default()
        };
        let mut device = HeadlessDevice::with_capabilities(4, 4, caps);
        let mut cache = RenderTargetCache::new();
        let gpu = prepare(&mut device, &mut cache, &RenderTarget::new(8, 8).with_samples(4));

        assert_eq!(gpu.msaa, MsaaMode::RenderToTexture);
        assert_eq!(device.framebuffer_samples(gpu.framebuffer), Some(4));
        assert_eq!(device.framebuffer_color_texture(gpu.framebuffer), Some(gpu.color));
    }

    #[test]
    fn test_msaa_unsupported_falls_back() {
        let caps = DeviceCapabilities {
            max_samples: 1,
            ..Default::default()
        };
        let mut device = HeadlessDevice::with_capabilities(4, 4, caps);
        let mut state = StateTracker::new();
        let mut warnings = WarnOnce::new();
        let sink = DiagnosticSink::new();
        let rx = sink.receiver();
        let mut cache = RenderTargetCache::new();
        let target = RenderTarget::new(8, 8).with_samples(4);

        let gpu = cache.prepare(
            &mut device,
            &mut state,
            &mut warnings,
            &sink,
            TargetKey::Post,
            TargetDesc::from_target(&target),
            target.version(),
        );
        assert_eq!(gpu.samples, 1);
        assert_eq!(gpu.msaa, MsaaMode::None);
        assert!(matches!(
            rx.try_recv(),
            Ok(Diagnostic::CapabilityFallback {
                feature: "multisampling",
                ..
            })
        ));
    }

    #[test]
    fn test_sample_change_rebuilds() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut cache = RenderTargetCache::new();
        let mut target = RenderTarget::new(8, 8);

        prepare(&mut device, &mut cache, &target);
        target.set_samples(4);
        prepare(&mut device, &mut cache, &target);

        // single-sample + multisampled framebuffer
        assert_eq!(device.live_framebuffers(), 2);
        assert_eq!(device.stats().framebuffers_created, 3);
    }
}
