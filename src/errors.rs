//! Error Types
//!
//! This module defines the error types used throughout the engine.
//!
//! # Overview
//!
//! The main error type [`TrellisError`] covers the recoverable failure modes:
//! - Shader program assembly and compilation failures
//! - Material property lookups that miss or carry the wrong type
//! - Geometry validation failures
//! - Resource handle and readback failures
//!
//! Device capability shortfalls are not errors: the renderer degrades to a
//! slower path and logs once. Compile failures inside a frame never escape
//! [`Renderer::render`](crate::renderer::Renderer::render); they are reported
//! through the diagnostics channel instead.
//!
//! # Usage
//!
//! ```rust,ignore
//! use trellis::errors::{TrellisError, Result};
//!
//! fn configure(material: &mut Material) -> Result<()> {
//!     material.set_value("roughness", UniformValue::Float(0.4))?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::renderer::diagnostics::ProgramDiagnostic;
use crate::resources::texture::TextureFormat;
use crate::resources::uniforms::UniformKind;

/// The main error type for the Trellis engine.
#[derive(Error, Debug)]
pub enum TrellisError {
    // ========================================================================
    // Shader & Program Errors
    // ========================================================================
    /// The shader template could not be rendered.
    #[error("Shader template error in '{template}': {message}")]
    ShaderTemplate {
        /// Template name
        template: String,
        /// Rendering error reported by the template engine
        message: String,
    },

    /// The device rejected a generated program.
    #[error("Program compilation failed for '{}': {}", .0.label, .0.log)]
    ProgramCompile(Box<ProgramDiagnostic>),

    // ========================================================================
    // Material Errors
    // ========================================================================
    /// The property name is not part of the material kind's parameter set.
    #[error("Material '{material}' has no property '{property}'")]
    UnknownMaterialProperty {
        /// Material name
        material: String,
        /// Requested property name
        property: String,
    },

    /// The property exists but the supplied value has a different type.
    #[error("Property '{property}' expects {expected:?}, got {found:?}")]
    UniformTypeMismatch {
        /// Property name
        property: String,
        /// Declared type
        expected: UniformKind,
        /// Supplied type
        found: UniformKind,
    },

    // ========================================================================
    // Geometry Errors
    // ========================================================================
    /// An index references a vertex past the end of the position attribute.
    #[error("Index {index} at position {position} exceeds vertex count {vertex_count}")]
    IndexOutOfRange {
        /// Offset within the index buffer
        position: usize,
        /// The offending index value
        index: u32,
        /// Number of vertices in the geometry
        vertex_count: usize,
    },

    /// An attribute's element count is not a multiple of its item size.
    #[error("Attribute '{name}' has {len} elements, not a multiple of item size {item_size}")]
    AttributeSize {
        /// Attribute name
        name: String,
        /// Element count
        len: usize,
        /// Declared components per vertex
        item_size: u32,
    },

    /// Attributes disagree on the number of vertices.
    #[error("Attribute '{name}' has {count} vertices, expected {expected}")]
    AttributeCountMismatch {
        /// Attribute name
        name: String,
        /// Vertex count of this attribute
        count: usize,
        /// Vertex count of the position attribute
        expected: usize,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// A handle does not resolve to a live resource.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// The device cannot sample or render the requested texture format.
    #[error("Unsupported texture format: {0:?}")]
    UnsupportedTextureFormat(TextureFormat),

    /// A uniform block member cannot be packed into a buffer.
    #[error("Uniform '{0}' cannot be stored in a uniform block")]
    UnpackableUniform(String),

    // ========================================================================
    // Readback Errors
    // ========================================================================
    /// The readback request could not be serviced.
    #[error("Readback failed: {0}")]
    Readback(String),

    // ========================================================================
    // Device Errors
    // ========================================================================
    /// Failed to request a compatible GPU adapter.
    #[cfg(feature = "wgpu")]
    #[error("Failed to request WGPU adapter: {0}")]
    AdapterRequestFailed(String),

    /// Failed to create the GPU device.
    #[cfg(feature = "wgpu")]
    #[error("Failed to create WGPU device: {0}")]
    DeviceCreateFailed(#[from] wgpu::RequestDeviceError),
}

/// Alias for `Result<T, TrellisError>`.
pub type Result<T> = std::result::Result<T, TrellisError>;
