//! Renderer Settings & Device Capabilities
//!
//! [`RendererSettings`] is the runtime configuration of one renderer
//! instance. It is plain data (serde-serializable) and can be swapped at any
//! time through [`Renderer::set_settings`]; changes that alter generated
//! shader code (precision, tone mapping, shadow filtering, output color
//! space) make every material re-resolve its program on the next frame.
//!
//! [`DeviceCapabilities`] describes what the underlying device can do. The
//! renderer never fails on a missing capability: it degrades to a slower but
//! correct path and logs once.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use trellis::renderer::{RendererSettings, ToneMapping, ShadowMapKind};
//!
//! let mut settings = RendererSettings::default();
//! settings.tone_mapping = ToneMapping::AcesFilmic;
//! settings.shadow_map.enabled = true;
//! settings.shadow_map.kind = ShadowMapKind::Pcf;
//! ```
//!
//! [`Renderer::set_settings`]: crate::renderer::Renderer::set_settings

use serde::{Deserialize, Serialize};

use crate::resources::material::Precision;
use crate::resources::texture::TextureFormat;

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Tone-mapping operator applied when presenting to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ToneMapping {
    #[default]
    None,
    Linear,
    Reinhard,
    AcesFilmic,
}

impl ToneMapping {
    #[must_use]
    pub fn define(self) -> &'static str {
        match self {
            ToneMapping::None => "NONE",
            ToneMapping::Linear => "LINEAR",
            ToneMapping::Reinhard => "REINHARD",
            ToneMapping::AcesFilmic => "ACES_FILMIC",
        }
    }

    /// Matches the operator ids used by the fullscreen shader.
    #[must_use]
    pub fn id(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputColorSpace {
    Linear,
    #[default]
    Srgb,
}

// ---------------------------------------------------------------------------
// Shadows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShadowMapKind {
    /// Single depth comparison.
    Basic,
    /// Percentage-closer filtering over the light's `radius` in texels.
    #[default]
    Pcf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowMapSettings {
    pub enabled: bool,
    pub kind: ShadowMapKind,
    /// Re-render every shadow map each frame. When off, only lights with
    /// `shadow.needs_update` set are re-rendered.
    pub auto_update: bool,
}

impl Default for ShadowMapSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: ShadowMapKind::Pcf,
            auto_update: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoClear {
    pub color: bool,
    pub depth: bool,
    pub stencil: bool,
}

impl Default for AutoClear {
    fn default() -> Self {
        Self {
            color: true,
            depth: true,
            stencil: true,
        }
    }
}

// ---------------------------------------------------------------------------
// RendererSettings
// ---------------------------------------------------------------------------

/// Runtime configuration of a [`Renderer`](crate::renderer::Renderer).
///
/// | Field                    | Description                                    | Default    |
/// |--------------------------|------------------------------------------------|------------|
/// | `precision`              | Requested shader precision                     | `High`     |
/// | `sort_objects`           | Sort render lists                              | `true`     |
/// | `auto_clear`             | Buffers cleared at frame start                 | all        |
/// | `clear_color`            | Clear color (linear RGB) and alpha             | black, 1.0 |
/// | `shadow_map`             | Shadow pass configuration                      | disabled   |
/// | `tone_mapping`           | Operator for display output                    | `None`     |
/// | `tone_mapping_exposure`  | Exposure multiplier                            | `1.0`      |
/// | `output_color_space`     | Display encoding                               | `Srgb`     |
/// | `msaa_samples`           | Samples of the internal post-process target    | `1`        |
/// | `local_clipping_enabled` | Honor per-material clipping planes             | `false`    |
/// | `clipping_planes`        | Global world-space planes `(nx, ny, nz, d)`    | none       |
/// | `max_texture_units`      | Units handed out per draw (capped by device)   | `16`       |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    pub precision: Precision,
    pub sort_objects: bool,
    pub auto_clear: AutoClear,
    pub clear_color: [f32; 3],
    pub clear_alpha: f32,
    pub shadow_map: ShadowMapSettings,
    pub tone_mapping: ToneMapping,
    pub tone_mapping_exposure: f32,
    pub output_color_space: OutputColorSpace,
    pub msaa_samples: u32,
    pub local_clipping_enabled: bool,
    pub clipping_planes: Vec<[f32; 4]>,
    pub max_texture_units: u32,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            precision: Precision::High,
            sort_objects: true,
            auto_clear: AutoClear::default(),
            clear_color: [0.0, 0.0, 0.0],
            clear_alpha: 1.0,
            shadow_map: ShadowMapSettings::default(),
            tone_mapping: ToneMapping::None,
            tone_mapping_exposure: 1.0,
            output_color_space: OutputColorSpace::Srgb,
            msaa_samples: 1,
            local_clipping_enabled: false,
            clipping_planes: Vec::new(),
            max_texture_units: 16,
        }
    }
}

impl RendererSettings {
    /// Settings whose change alters generated shader source.
    pub(crate) fn program_affecting_eq(&self, other: &Self) -> bool {
        self.precision == other.precision
            && self.tone_mapping == other.tone_mapping
            && self.output_color_space == other.output_color_space
            && self.shadow_map.kind == other.shadow_map.kind
            && self.shadow_map.enabled == other.shadow_map.enabled
            && self.local_clipping_enabled == other.local_clipping_enabled
            && self.clipping_planes.len() == other.clipping_planes.len()
    }

    /// Presenting to the display needs a final conversion pass.
    #[must_use]
    pub fn needs_output_pass(&self) -> bool {
        self.tone_mapping != ToneMapping::None || self.output_color_space == OutputColorSpace::Srgb
    }
}

// ---------------------------------------------------------------------------
// DeviceCapabilities
// ---------------------------------------------------------------------------

/// What the device behind a [`GpuDevice`](crate::renderer::device::GpuDevice)
/// supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub max_precision: Precision,
    /// 1 means no multisampling at all.
    pub max_samples: u32,
    /// Multisampled rendering straight into a single-sample texture with an
    /// implicit resolve.
    pub multisampled_render_to_texture: bool,
    pub depth_textures: bool,
    pub float_textures: bool,
    pub float_render_targets: bool,
    pub max_texture_size: u32,
    pub max_texture_units: u32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_precision: Precision::High,
            max_samples: 4,
            multisampled_render_to_texture: false,
            depth_textures: true,
            float_textures: true,
            float_render_targets: true,
            max_texture_size: 8192,
            max_texture_units: 16,
        }
    }
}

impl DeviceCapabilities {
    /// Whether textures of `format` can be created and sampled.
    #[must_use]
    pub fn supports_format(&self, format: TextureFormat) -> bool {
        if format.is_depth() {
            self.depth_textures
        } else if format.is_float() {
            self.float_textures
        } else {
            true
        }
    }

    /// Highest precision not above `requested` the device can compile.
    #[must_use]
    pub fn clamp_precision(&self, requested: Precision) -> Precision {
        requested.min(self.max_precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_clamps_to_device() {
        let caps = DeviceCapabilities {
            max_precision: Precision::Medium,
            ..Default::default()
        };
        assert_eq!(caps.clamp_precision(Precision::High), Precision::Medium);
        assert_eq!(caps.clamp_precision(Precision::Low), Precision::Low);
    }

    #[test]
    fn test_program_affecting_settings() {
        let a = RendererSettings::default();
        let mut b = a.clone();
        b.clear_color = [1.0, 0.0, 0.0];
        assert!(a.program_affecting_eq(&b));
        b.tone_mapping = ToneMapping::Reinhard;
        assert!(!a.program_affecting_eq(&b));
    }
}
