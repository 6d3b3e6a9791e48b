//! Renderer diagnostics.
//!
//! Recoverable problems found while rendering (a program that fails to
//! compile, a texture format the device cannot sample, a capability the
//! renderer had to work around) are reported as [`Diagnostic`] events
//! instead of errors, so one broken material never aborts a frame.

use flume::{Receiver, Sender};

use crate::resources::material::Precision;
use crate::resources::texture::TextureFormat;

/// Everything needed to debug a program that failed to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDiagnostic {
    pub label: String,
    /// Generated source handed to the device (empty if generation failed).
    pub source: String,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The material is skipped for the rest of the session.
    ProgramCompileFailed {
        material: String,
        program: ProgramDiagnostic,
    },
    PrecisionDowngraded {
        requested: Precision,
        used: Precision,
    },
    /// A device feature was missing and a fallback path is used instead.
    CapabilityFallback {
        feature: &'static str,
        fallback: &'static str,
    },
    /// The texture is left unbound.
    UnsupportedTextureFormat {
        texture: String,
        format: TextureFormat,
    },
    TextureUnitsExhausted {
        requested: u32,
        available: u32,
    },
}

/// Unbounded broadcast point for diagnostics. Receivers share one queue.
#[derive(Debug)]
pub(crate) struct DiagnosticSink {
    tx: Sender<Diagnostic>,
    rx: Receiver<Diagnostic>,
}

impl DiagnosticSink {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        // The sink owns a receiver, so the channel is never disconnected.
        let _ = self.tx.send(diagnostic);
    }

    pub(crate) fn receiver(&self) -> Receiver<Diagnostic> {
        self.rx.clone()
    }
}
