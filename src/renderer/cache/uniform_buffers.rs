use rustc_hash::FxHashMap;

use crate::assets::UniformGroupHandle;
use crate::renderer::device::{BufferId, BufferKind, GpuDevice};
use crate::renderer::state::StateTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformBlockKey {
    Group(UniformGroupHandle),
    Lights,
}

struct UniformBuffer {
    buffer: BufferId,
    version: u64,
    bytes: Vec<u8>,
}

/// Uniform blocks shared across programs.
///
/// A block is re-uploaded only when its bytes change; versions let callers
/// skip packing altogether.
#[derive(Default)]
pub struct UniformBufferCache {
    entries: FxHashMap<UniformBlockKey, UniformBuffer>,
}

impl UniformBufferCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the cached block is already at `version`.
    #[must_use]
    pub fn is_current(&self, key: UniformBlockKey, version: u64) -> bool {
        self.entries.get(&key).is_some_and(|e| e.version == version)
    }

    /// Buffer id when the block exists.
    #[must_use]
    pub fn buffer(&self, key: UniformBlockKey) -> Option<BufferId> {
        self.entries.get(&key).map(|e| e.buffer)
    }

    /// Stores `bytes` for `key`. Returns the buffer and whether the device
    /// was written.
    pub fn upload<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        key: UniformBlockKey,
        version: u64,
        bytes: &[u8],
    ) -> (BufferId, bool) {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.bytes.len() == bytes.len() => {
                entry.version = version;
                if entry.bytes == bytes {
                    return (entry.buffer, false);
                }
                device.update_buffer(entry.buffer, 0, bytes);
                entry.bytes.clear();
                entry.bytes.extend_from_slice(bytes);
                (entry.buffer, true)
            }
            stale => {
                if let Some(old) = stale {
                    device.delete_buffer(old.buffer);
                    state.forget_buffer(old.buffer);
                }
                let buffer = device.create_buffer(BufferKind::Uniform, bytes);
                self.entries.insert(
                    key,
                    UniformBuffer {
                        buffer,
                        version,
                        bytes: bytes.to_vec(),
                    },
                );
                (buffer, true)
            }
        }
    }

    pub fn remove<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker, key: UniformBlockKey) {
        if let Some(entry) = self.entries.remove(&key) {
            device.delete_buffer(entry.buffer);
            state.forget_buffer(entry.buffer);
        }
    }

    pub fn clear<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker) {
        for (_, entry) in self.entries.drain() {
            device.delete_buffer(entry.buffer);
            state.forget_buffer(entry.buffer);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::HeadlessDevice;

    #[test]
    fn test_identical_bytes_skip_upload() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = UniformBufferCache::new();

        let (a, written) = cache.upload(&mut device, &mut state, UniformBlockKey::Lights, 1, &[0; 32]);
        assert!(written);
        let (b, written) = cache.upload(&mut device, &mut state, UniformBlockKey::Lights, 2, &[0; 32]);
        assert!(!written);
        assert_eq!(a, b);
        assert!(cache.is_current(UniformBlockKey::Lights, 2));

        let (_, written) = cache.upload(&mut device, &mut state, UniformBlockKey::Lights, 3, &[1; 32]);
        assert!(written);
        assert_eq!(device.stats().buffers_created, 1);
        assert_eq!(device.stats().buffer_uploads, 2);
    }

    #[test]
    fn test_size_change_recreates() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = UniformBufferCache::new();
        cache.upload(&mut device, &mut state, UniformBlockKey::Lights, 1, &[0; 16]);
        cache.upload(&mut device, &mut state, UniformBlockKey::Lights, 2, &[0; 48]);
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(device.stats().buffers_created, 2);
    }
}
