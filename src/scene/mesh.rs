use glam::{Affine3A, Mat4};
use smallvec::{SmallVec, smallvec};

use crate::assets::{GeometryHandle, MaterialHandle};
use crate::math::Sphere;

/// Per-instance world offsets for instanced drawing.
///
/// Each matrix is applied after the node's own world matrix.
#[derive(Debug, Clone, Default)]
pub struct InstanceData {
    matrices: Vec<Mat4>,
    version: u64,
}

impl InstanceData {
    #[must_use]
    pub fn new(matrices: Vec<Mat4>) -> Self {
        Self { matrices, version: 1 }
    }

    #[must_use]
    pub fn matrices(&self) -> &[Mat4] {
        &self.matrices
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.matrices.len() as u32
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_matrix(&mut self, index: usize, matrix: Mat4) {
        if let Some(slot) = self.matrices.get_mut(index) {
            *slot = matrix;
            self.version = self.version.wrapping_add(1);
        }
    }

    pub fn set_matrices(&mut self, matrices: Vec<Mat4>) {
        self.matrices = matrices;
        self.version = self.version.wrapping_add(1);
    }

    /// Encloses `local` placed by every instance.
    #[must_use]
    pub fn bounding_sphere(&self, local: &Sphere) -> Sphere {
        let mut spheres = self
            .matrices
            .iter()
            .map(|m| local.transform(&Affine3A::from_mat4(*m)));
        let Some(first) = spheres.next() else {
            return Sphere::EMPTY;
        };
        spheres.fold(first, |acc, s| {
            let d = acc.center.distance(s.center);
            if d + s.radius <= acc.radius {
                acc
            } else if d + acc.radius <= s.radius {
                s
            } else {
                let radius = (d + acc.radius + s.radius) * 0.5;
                let dir = (s.center - acc.center) / d;
                Sphere::new(acc.center + dir * (radius - acc.radius), radius)
            }
        })
    }
}

/// Drawable component: geometry plus one material, or one material per
/// geometry group.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub geometry: GeometryHandle,
    /// With several materials, each geometry group picks its slot by
    /// `material_index`.
    pub materials: SmallVec<[MaterialHandle; 1]>,
    pub cast_shadow: bool,
    pub receive_shadow: bool,
    pub frustum_culled: bool,
    pub instances: Option<InstanceData>,
}

impl Mesh {
    #[must_use]
    pub fn new(geometry: GeometryHandle, material: MaterialHandle) -> Self {
        Self {
            geometry,
            materials: smallvec![material],
            cast_shadow: false,
            receive_shadow: false,
            frustum_culled: true,
            instances: None,
        }
    }

    #[must_use]
    pub fn with_materials(geometry: GeometryHandle, materials: impl IntoIterator<Item = MaterialHandle>) -> Self {
        Self {
            materials: materials.into_iter().collect(),
            ..Self::new(geometry, MaterialHandle::default())
        }
    }

    #[must_use]
    pub fn material(&self) -> Option<MaterialHandle> {
        self.materials.first().copied()
    }

    #[must_use]
    pub fn is_multi_material(&self) -> bool {
        self.materials.len() > 1
    }

    #[must_use]
    pub fn instance_count(&self) -> u32 {
        self.instances.as_ref().map_or(1, InstanceData::count)
    }
}
