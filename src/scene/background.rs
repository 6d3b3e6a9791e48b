use glam::Vec3;

use crate::assets::TextureHandle;

/// What fills the frame before opaque geometry is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Background {
    /// Use the renderer's clear color.
    #[default]
    None,
    Color(Vec3),
    /// Full-screen texture.
    Texture(TextureHandle),
}

/// Distance fog. The variant is part of the program key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fog {
    Linear { color: Vec3, near: f32, far: f32 },
    Exp2 { color: Vec3, density: f32 },
}

impl Fog {
    #[must_use]
    pub fn color(&self) -> Vec3 {
        match *self {
            Fog::Linear { color, .. } | Fog::Exp2 { color, .. } => color,
        }
    }
}
