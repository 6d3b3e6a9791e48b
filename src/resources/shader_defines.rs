//! Shader macro definitions.
//!
//! A sorted list of `NAME = value` pairs handed to the shader templates.
//! Sorting by key makes equal sets hash equally regardless of insertion
//! order, so the list can take part in program cache keys.
//!
//! ```rust,ignore
//! let mut defines = ShaderDefines::new();
//! defines.set("USE_MAP", "1");
//! defines.set("NUM_DIR_LIGHTS", "2");
//! let key = defines.compute_hash();
//! ```

use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash};

/// Ordered set of shader macro definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShaderDefines {
    defines: Vec<(String, String)>,
}

impl ShaderDefines {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { defines: Vec::new() }
    }

    /// Inserts or replaces `key`, keeping the list sorted.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.defines.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            Ok(idx) => self.defines[idx].1 = value,
            Err(idx) => self.defines.insert(idx, (key.to_owned(), value)),
        }
    }

    /// Sets `key` to "1" when `enabled`, removes it otherwise.
    pub fn toggle(&mut self, key: &str, enabled: bool) {
        if enabled {
            self.set(key, "1");
        } else {
            self.remove(key);
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.defines.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            Ok(idx) => {
                self.defines.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.defines
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|idx| self.defines[idx].1.as_str())
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.defines.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defines.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Template context form.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.defines.iter().cloned().collect()
    }

    /// Values from `other` win on conflicts.
    pub fn merge(&mut self, other: &ShaderDefines) {
        for (key, value) in &other.defines {
            self.set(key, value.clone());
        }
    }

    #[must_use]
    pub fn compute_hash(&self) -> u64 {
        rustc_hash::FxBuildHasher.hash_one(self)
    }
}

impl From<&[(&str, &str)]> for ShaderDefines {
    fn from(defines: &[(&str, &str)]) -> Self {
        let mut result = Self::new();
        for (k, v) in defines {
            result.set(k, *v);
        }
        result
    }
}
