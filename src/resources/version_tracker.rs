//! Version counters shared by every CPU-side resource.
//!
//! GPU caches store the version they last uploaded and compare it with the
//! resource's current one. A resource never holds GPU state itself.

/// Version tracker - used to mark resource changes
#[derive(Debug, Clone, Copy)]
pub struct ChangeTracker {
    version: u64,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeTracker {
    /// Starts at 1 so that a fresh cache entry (version 0) is always stale.
    #[must_use]
    pub fn new() -> Self {
        Self { version: 1 }
    }

    pub fn changed(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Mutable guard - bumps the owner's version when dropped
pub struct MutGuard<'a, T> {
    data: &'a mut T,
    version: &'a mut u64,
}

impl<'a, T> MutGuard<'a, T> {
    pub fn new(data: &'a mut T, version: &'a mut u64) -> Self {
        Self { data, version }
    }
}

impl<T> std::ops::Deref for MutGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> std::ops::DerefMut for MutGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<T> Drop for MutGuard<'_, T> {
    fn drop(&mut self) {
        *self.version = self.version.wrapping_add(1);
    }
}

/// A sub-range written at a given version.
///
/// Units are elements for attributes and bytes for textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRange {
    pub offset: usize,
    pub count: usize,
    pub version: u64,
}

/// Sub-range writes recorded since the last full write.
///
/// A cache that uploaded at version `v` may transfer only the ranges newer
/// than `v`, provided `v` is not older than the last full write. Otherwise
/// it must re-upload everything.
#[derive(Debug, Clone, Default)]
pub struct UpdateRanges {
    base_version: u64,
    ranges: Vec<UpdateRange>,
}

impl UpdateRanges {
    /// Past this many pending ranges a full upload is cheaper.
    pub const MAX_RANGES: usize = 32;

    #[must_use]
    pub fn new(base_version: u64) -> Self {
        Self {
            base_version,
            ranges: Vec::new(),
        }
    }

    /// Records a full write at `version`.
    pub fn reset(&mut self, version: u64) {
        self.base_version = version;
        self.ranges.clear();
    }

    pub fn record(&mut self, offset: usize, count: usize, version: u64) {
        if self.ranges.len() >= Self::MAX_RANGES {
            self.reset(version);
            return;
        }
        self.ranges.push(UpdateRange { offset, count, version });
    }

    /// Ranges a cache at `cached_version` still has to transfer, or `None`
    /// when it needs a full upload.
    #[must_use]
    pub fn pending_since(&self, cached_version: u64) -> Option<Vec<UpdateRange>> {
        if cached_version == 0 || cached_version < self.base_version {
            return None;
        }
        Some(
            self.ranges
                .iter()
                .filter(|r| r.version > cached_version)
                .copied()
                .collect(),
        )
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[UpdateRange] {
        &self.ranges
    }
}
