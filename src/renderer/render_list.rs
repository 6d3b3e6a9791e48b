//! Render lists
//!
//! One pre-order walk over the visible scene produces three buckets:
//!
//! - **opaque**: sorted front to back, grouping equal materials
//! - **transmissive**: drawn after opaque against a capture of the frame
//! - **transparent**: sorted back to front for correct blending
//!
//! Shadow casters are gathered during the same walk, without camera
//! culling, so the shadow pass can cull them against each light instead.
//!
//! Every key ends in the traversal sequence, which makes the sorts stable
//! and the ordering identical between two builds of an unchanged scene.

use std::cmp::Ordering;
use std::ops::Range;

use glam::Mat4;
use slotmap::Key;
use smallvec::SmallVec;

use crate::assets::{Assets, GeometryHandle, MaterialHandle};
use crate::math::Sphere;
use crate::renderer::settings::RendererSettings;
use crate::scene::{Camera, NodeHandle, Scene};

/// One draw of one material over a range of one geometry.
#[derive(Debug, Clone)]
pub struct RenderItem {
    pub node: NodeHandle,
    pub geometry: GeometryHandle,
    pub material: MaterialHandle,
    /// `render_order` of the nearest enclosing render group.
    pub group_order: i32,
    pub render_order: i32,
    /// Distance from the camera to the world bounding-sphere centre.
    pub depth: f32,
    /// Elements to draw (indices, or vertices for non-indexed geometry).
    pub range: Range<u32>,
    pub world: Mat4,
    /// World-space bounds, including instances.
    pub sphere: Sphere,
    pub(crate) sequence: u32,
}

impl RenderItem {
    fn material_key(&self) -> u64 {
        self.material.data().as_ffi()
    }
}

fn opaque_order(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.group_order
        .cmp(&b.group_order)
        .then(a.render_order.cmp(&b.render_order))
        .then(a.material_key().cmp(&b.material_key()))
        .then(a.depth.total_cmp(&b.depth))
        .then(a.sequence.cmp(&b.sequence))
}

fn back_to_front(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.group_order
        .cmp(&b.group_order)
        .then(a.render_order.cmp(&b.render_order))
        .then(b.depth.total_cmp(&a.depth))
        .then(a.sequence.cmp(&b.sequence))
}

#[derive(Debug, Clone, Default)]
pub struct RenderList {
    pub opaque: Vec<RenderItem>,
    pub transmissive: Vec<RenderItem>,
    pub transparent: Vec<RenderItem>,
    /// Opaque meshes with `cast_shadow`, in traversal order. Frustum
    /// culling against the view camera does not apply.
    pub shadow_casters: Vec<RenderItem>,
}

impl RenderList {
    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transmissive.clear();
        self.transparent.clear();
        self.shadow_casters.clear();
    }

    /// Items across the three color buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.opaque.len() + self.transmissive.len() + self.transparent.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sort(&mut self) {
        self.opaque.sort_unstable_by(opaque_order);
        self.transmissive.sort_unstable_by(back_to_front);
        self.transparent.sort_unstable_by(back_to_front);
    }
}

/// Builds [`RenderList`]s, reusing their allocations between frames.
#[derive(Debug, Default)]
pub struct RenderListBuilder {
    list: RenderList,
    stack: Vec<(NodeHandle, i32)>,
}

impl RenderListBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn list(&self) -> &RenderList {
        &self.list
    }

    /// Collects and sorts the items `camera` sees. World matrices and the
    /// camera's view must already be current.
    ///
    /// Hidden nodes hide their subtree. A node failing the layer test is
    /// skipped but its children are still visited.
    pub fn build(&mut self, scene: &Scene, camera: &Camera, assets: &Assets, settings: &RendererSettings) -> &RenderList {
        self.list.clear();
        self.stack.clear();
        self.stack.extend(scene.roots.iter().rev().map(|&root| (root, 0)));

        let eye = camera.position();
        let frustum = camera.frustum();
        let mut sequence = 0_u32;

        while let Some((handle, inherited_group)) = self.stack.pop() {
            let Some(node) = scene.nodes.get(handle) else {
                continue;
            };
            if !node.visible {
                continue;
            }
            let group_order = if node.is_group { node.render_order } else { inherited_group };
            self.stack.extend(node.children.iter().rev().map(|&c| (c, group_order)));

            let Some(mesh) = scene.meshes.get(handle) else {
                continue;
            };
            if !node.layers.test(&camera.layers) {
                continue;
            }
            let Some(geometry) = assets.get_geometry(mesh.geometry) else {
                log::trace!("Mesh '{}' references a missing geometry", node.name);
                continue;
            };
            if geometry.is_degenerate() {
                continue;
            }

            let world = node.world_matrix();
            let mut local = geometry.bounding_sphere();
            if let Some(instances) = &mesh.instances {
                local = instances.bounding_sphere(&local);
            }
            let sphere = local.transform(world);
            let world = Mat4::from(*world);

            let in_view = !mesh.frustum_culled || frustum.intersects_sphere(&sphere);
            let depth = eye.distance(sphere.center);

            // Geometry groups only split the draw for multi-material meshes.
            let mut draws: SmallVec<[(MaterialHandle, Range<u32>); 1]> = SmallVec::new();
            if mesh.is_multi_material() && !geometry.groups().is_empty() {
                for group in geometry.groups() {
                    if let Some(&material) = mesh.materials.get(group.material_index) {
                        draws.push((material, geometry.group_range(group)));
                    }
                }
            } else if let Some(material) = mesh.material() {
                draws.push((material, geometry.draw_range()));
            }

            for (material, range) in draws {
                if range.is_empty() {
                    continue;
                }
                let material = scene.override_material.unwrap_or(material);
                let Some(resolved) = assets.get_material(material) else {
                    continue;
                };
                if !resolved.settings().visible {
                    continue;
                }

                let item = RenderItem {
                    node: handle,
                    geometry: mesh.geometry,
                    material,
                    group_order,
                    render_order: node.render_order,
                    depth,
                    range,
                    world,
                    sphere,
                    sequence,
                };
                sequence += 1;

                let opaque = !resolved.is_transmissive() && !resolved.is_transparent();
                if mesh.cast_shadow && opaque {
                    self.list.shadow_casters.push(item.clone());
                }
                if !in_view {
                    continue;
                }
                if resolved.is_transmissive() {
                    self.list.transmissive.push(item);
                } else if resolved.is_transparent() {
                    self.list.transparent.push(item);
                } else {
                    self.list.opaque.push(item);
                }
            }
        }

        if settings.sort_objects {
            self.list.sort();
        }
        &self.list
    }
}
