use serde::{Deserialize, Serialize};

/// 32-bit visibility mask.
///
/// An object is drawn by a camera only when the two masks share a bit. New
/// masks start with layer 0 enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layers {
    mask: u32,
}

impl Default for Layers {
    fn default() -> Self {
        Self { mask: 1 }
    }
}

impl Layers {
    pub const ALL: Self = Self { mask: u32::MAX };
    pub const NONE: Self = Self { mask: 0 };

    #[must_use]
    pub const fn from_mask(mask: u32) -> Self {
        Self { mask }
    }

    #[must_use]
    pub const fn mask(&self) -> u32 {
        self.mask
    }

    /// Membership in `layer` only.
    pub fn set(&mut self, layer: u32) {
        self.mask = 1 << (layer & 31);
    }

    pub fn enable(&mut self, layer: u32) {
        self.mask |= 1 << (layer & 31);
    }

    pub fn disable(&mut self, layer: u32) {
        self.mask &= !(1 << (layer & 31));
    }

    pub fn toggle(&mut self, layer: u32) {
        self.mask ^= 1 << (layer & 31);
    }

    #[must_use]
    pub const fn test(&self, other: &Layers) -> bool {
        self.mask & other.mask != 0
    }

    #[must_use]
    pub const fn is_enabled(&self, layer: u32) -> bool {
        self.mask & (1 << (layer & 31)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_masks() {
        let mut camera = Layers::default();
        let mut object = Layers::default();
        assert!(camera.test(&object));

        object.set(3);
        assert!(!camera.test(&object));

        camera.enable(3);
        assert!(camera.test(&object));
        assert!(camera.is_enabled(0));

        camera.disable(0);
        camera.toggle(3);
        assert_eq!(camera.mask(), 0);
    }
}
