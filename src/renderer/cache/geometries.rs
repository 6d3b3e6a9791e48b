use rustc_hash::FxHashMap;

use crate::assets::GeometryHandle;
use crate::renderer::device::{BufferId, BufferKind, GpuDevice, IndexBinding, IndexFormat, VertexBinding};
use crate::renderer::state::StateTracker;
use crate::resources::attribute::{Attribute, AttributeData, AttributeFormat, ComponentType};
use crate::resources::geometry::Geometry;
use crate::scene::{InstanceData, NodeHandle};

#[derive(Debug, Clone)]
pub struct GpuAttribute {
    pub buffer: BufferId,
    pub format: AttributeFormat,
    pub byte_len: usize,
    pub version: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuIndex {
    pub buffer: BufferId,
    pub format: IndexFormat,
    pub byte_len: usize,
    pub version: u64,
}

/// Device buffers of one [`Geometry`].
#[derive(Debug, Clone, Default)]
pub struct GpuGeometry {
    pub attributes: FxHashMap<String, GpuAttribute>,
    pub index: Option<GpuIndex>,
    layout_version: u64,
}

impl GpuGeometry {
    /// Vertex bindings in name order.
    #[must_use]
    pub fn vertex_bindings(&self) -> Vec<VertexBinding> {
        let mut bindings: Vec<VertexBinding> = self
            .attributes
            .iter()
            .map(|(name, attr)| VertexBinding {
                name: name.clone(),
                buffer: attr.buffer,
                format: attr.format,
                per_instance: false,
            })
            .collect();
        bindings.sort_by(|a, b| a.name.cmp(&b.name));
        bindings
    }

    #[must_use]
    pub fn index_binding(&self) -> Option<IndexBinding> {
        self.index.map(|i| IndexBinding {
            buffer: i.buffer,
            format: i.format,
        })
    }
}

struct InstanceBuffer {
    buffer: BufferId,
    byte_len: usize,
    version: u64,
}

/// Keeps vertex, index and per-instance buffers in sync.
#[derive(Default)]
pub struct GeometryCache {
    entries: FxHashMap<GeometryHandle, GpuGeometry>,
    instances: FxHashMap<NodeHandle, InstanceBuffer>,
}

impl GeometryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads whatever changed since the last call and returns the buffers.
    pub fn prepare<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        handle: GeometryHandle,
        geometry: &Geometry,
    ) -> &GpuGeometry {
        let entry = self.entries.entry(handle).or_default();

        if entry.layout_version != geometry.layout_version() {
            entry.attributes.retain(|name, attr| {
                let keep = geometry.attribute(name).is_some();
                if !keep {
                    device.delete_buffer(attr.buffer);
                    state.forget_buffer(attr.buffer);
                }
                keep
            });
            entry.layout_version = geometry.layout_version();
        }

        for (name, attribute) in geometry.attributes() {
            match entry.attributes.get_mut(name) {
                Some(gpu) => sync_attribute(device, state, gpu, attribute),
                None => {
                    let buffer = device.create_buffer(BufferKind::Vertex, attribute.as_bytes());
                    entry.attributes.insert(
                        name.to_owned(),
                        GpuAttribute {
                            buffer,
                            format: attribute.format(),
                            byte_len: attribute.as_bytes().len(),
                            version: attribute.version(),
                        },
                    );
                }
            }
        }

        if geometry.index().is_none()
            && let Some(gpu) = entry.index.take()
        {
            device.delete_buffer(gpu.buffer);
            state.forget_buffer(gpu.buffer);
        }
        if let Some(index) = geometry.index() {
            match entry.index.as_mut() {
                Some(gpu) if gpu.format != index_format(index) || gpu.byte_len != index.as_bytes().len() => {
                    device.delete_buffer(gpu.buffer);
                    state.forget_buffer(gpu.buffer);
                    *gpu = create_index(device, index);
                }
                Some(gpu) => {
                    if gpu.version != index.version() {
                        upload_ranges(device, gpu.buffer, index, gpu.version);
                        gpu.version = index.version();
                    }
                }
                None => entry.index = Some(create_index(device, index)),
            }
        }

        entry
    }

    /// Per-instance matrix binding for `node`, uploaded when its version moves.
    pub fn prepare_instances<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        node: NodeHandle,
        instances: &InstanceData,
    ) -> VertexBinding {
        let bytes: &[u8] = bytemuck::cast_slice(instances.matrices());
        let buffer = match self.instances.get_mut(&node) {
            Some(entry) if entry.byte_len == bytes.len() => {
                if entry.version != instances.version() {
                    device.update_buffer(entry.buffer, 0, bytes);
                    entry.version = instances.version();
                }
                entry.buffer
            }
            stale => {
                if let Some(old) = stale {
                    device.delete_buffer(old.buffer);
                    state.forget_buffer(old.buffer);
                }
                let buffer = device.create_buffer(BufferKind::Vertex, bytes);
                self.instances.insert(
                    node,
                    InstanceBuffer {
                        buffer,
                        byte_len: bytes.len(),
                        version: instances.version(),
                    },
                );
                buffer
            }
        };
        VertexBinding {
            name: "instanceMatrix".to_owned(),
            buffer,
            format: AttributeFormat {
                component: ComponentType::F32,
                item_size: 16,
                normalized: false,
            },
            per_instance: true,
        }
    }

    #[must_use]
    pub fn get(&self, handle: GeometryHandle) -> Option<&GpuGeometry> {
        self.entries.get(&handle)
    }

    pub fn remove<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker, handle: GeometryHandle) {
        if let Some(entry) = self.entries.remove(&handle) {
            release(device, state, entry);
        }
    }

    /// Frees instance buffers of nodes for which `keep` is false.
    pub fn retain_instances<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        state: &mut StateTracker,
        mut keep: impl FnMut(NodeHandle) -> bool,
    ) {
        self.instances.retain(|node, entry| {
            let keep = keep(*node);
            if !keep {
                device.delete_buffer(entry.buffer);
                state.forget_buffer(entry.buffer);
            }
            keep
        });
    }

    pub fn clear<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &mut StateTracker) {
        for (_, entry) in self.entries.drain() {
            release(device, state, entry);
        }
        for (_, entry) in self.instances.drain() {
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

fn sync_attribute<D: GpuDevice + ?Sized>(device: &mut D, state: &mut StateTracker, gpu: &mut GpuAttribute, attribute: &Attribute) {
    if gpu.version == attribute.version() {
        return;
    }
    let bytes = attribute.as_bytes();
    if gpu.byte_len != bytes.len() || gpu.format != attribute.format() {
        device.delete_buffer(gpu.buffer);
        state.forget_buffer(gpu.buffer);
        gpu.buffer = device.create_buffer(BufferKind::Vertex, bytes);
        gpu.byte_len = bytes.len();
        gpu.format = attribute.format();
    } else {
        upload_ranges(device, gpu.buffer, attribute, gpu.version);
    }
    gpu.version = attribute.version();
}

/// Writes the component ranges recorded since `cached_version`, or the whole
/// buffer when the ranges do not cover the gap.
fn upload_ranges<D: GpuDevice + ?Sized>(device: &mut D, buffer: BufferId, attribute: &Attribute, cached_version: u64) {
    let bytes = attribute.as_bytes();
    let Some(ranges) = attribute.pending_ranges(cached_version) else {
        device.update_buffer(buffer, 0, bytes);
        return;
    };
    let size = attribute.data().component_type().size();
    for range in ranges {
        let start = range.offset * size;
        let end = ((range.offset + range.count) * size).min(bytes.len());
        if start < end {
            device.update_buffer(buffer, start, &bytes[start..end]);
        }
    }
}

fn index_format(index: &Attribute) -> IndexFormat {
    match index.data() {
        AttributeData::U16(_) => IndexFormat::U16,
        _ => IndexFormat::U32,
    }
}

fn create_index<D: GpuDevice + ?Sized>(device: &mut D, index: &Attribute) -> GpuIndex {
    // Indices are validated as u16/u32 when set; anything else is widened.
    let format = index_format(index);
    let buffer = match (format, index.data()) {
        (IndexFormat::U32, data) if !matches!(data, AttributeData::U32(_)) => {
            let widened: Vec<u32> = (0..data.len()).filter_map(|i| data.get_u32(i)).collect();
            device.create_buffer(BufferKind::Index, bytemuck::cast_slice(&widened))
        }
        _ => device.create_buffer(BufferKind::Index, index.as_bytes()),
    };
    GpuIndex {
        buffer,
        format,
        byte_len: index.as_bytes().len(),
        version: index.version(),
    }
}

fn release<D: GpuDevice + ?Sized>(device: &mut D, state: &mut StateTracker, entry: GpuGeometry) {
    for attr in entry.attributes.into_values() {
        device.delete_buffer(attr.buffer);
        state.forget_buffer(attr.buffer);
    }
    if let Some(index) = entry.index {
        device.delete_buffer(index.buffer);
        state.forget_buffer(index.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::HeadlessDevice;
    use glam::Vec3;
    use slotmap::KeyData;

    fn handle() -> GeometryHandle {
        GeometryHandle::from(KeyData::from_ffi(1))
    }

    fn triangle() -> Geometry {
        let mut geometry = Geometry::new();
        geometry.set_attribute(Geometry::POSITION, Attribute::from_vec3(&[Vec3::ZERO, Vec3::X, Vec3::Y]));
        geometry.set_index(vec![0, 1, 2]);
        geometry
    }

    #[test]
    fn test_partial_attribute_write_uploads_range() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = GeometryCache::new();
        let mut geometry = triangle();

        cache.prepare(&mut device, &mut state, handle(), &geometry);
        assert_eq!(device.stats().buffers_created, 2);

        let position = geometry.attribute_mut(Geometry::POSITION).unwrap();
        assert!(position.write_f32(3, &[2.0, 0.0, 0.0]));
        cache.prepare(&mut device, &mut state, handle(), &geometry);

        let stats = device.stats();
        assert_eq!(stats.buffers_created, 2);
        assert_eq!(stats.buffer_partial_uploads, 1);
    }

    #[test]
    fn test_index_uses_compact_format() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = GeometryCache::new();
        let gpu = cache.prepare(&mut device, &mut state, handle(), &triangle());
        assert_eq!(gpu.index.unwrap().format, IndexFormat::U16);
        assert_eq!(gpu.vertex_bindings().len(), 1);
    }

    #[test]
    fn test_removed_attribute_frees_buffer() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut state = StateTracker::new();
        let mut cache = GeometryCache::new();
        let mut geometry = triangle();
        geometry.set_attribute("uv", Attribute::f32(vec![0.0; 6], 2));

        cache.prepare(&mut device, &mut state, handle(), &geometry);
        assert_eq!(device.live_buffers(), 3);
        geometry.remove_attribute("uv");
        cache.prepare(&mut device, &mut state, handle(), &geometry);
        assert_eq!(device.live_buffers(), 2);

        cache.remove(&mut device, &mut state, handle());
        assert_eq!(device.live_buffers(), 0);
    }
}
