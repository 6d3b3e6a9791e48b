//! Scene lights gathered into the shared `lights` uniform block.
//!
//! Lights are grouped by kind with shadow casters first, matching the order
//! of shadow samplers in generated programs. Positions and directions are in
//! world space.

use glam::{Mat4, Vec3, Vec4};

use crate::renderer::shader_generator::LightCounts;
use crate::scene::{LightKind, NodeHandle, Scene};

/// Shadow parameters as laid out in the `LightShadow` struct.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowUniform {
    /// World to shadow-map space: xy in `[0, 1]` texture coordinates, z depth.
    pub matrix: Mat4,
    /// `(bias, normal_bias, radius, map_size)`.
    pub params: Vec4,
    /// `(near, far, 0, 0)`.
    pub range: Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalEntry {
    pub node: NodeHandle,
    /// Unit vector from the surface toward the light.
    pub direction: Vec3,
    pub color: Vec3,
    pub shadowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointEntry {
    pub node: NodeHandle,
    pub position: Vec3,
    pub color: Vec3,
    pub distance: f32,
    pub decay: f32,
    pub shadowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotEntry {
    pub node: NodeHandle,
    pub position: Vec3,
    pub direction: Vec3,
    pub color: Vec3,
    pub distance: f32,
    pub decay: f32,
    pub cone_cos: f32,
    pub penumbra_cos: f32,
    pub shadowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HemisphereEntry {
    pub direction: Vec3,
    pub sky: Vec3,
    pub ground: Vec3,
}

/// Lights visible this frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightsState {
    pub ambient: Vec3,
    pub hemisphere: Vec<HemisphereEntry>,
    pub directional: Vec<DirectionalEntry>,
    pub point: Vec<PointEntry>,
    pub spot: Vec<SpotEntry>,
}

impl LightsState {
    /// Collects lights on visible nodes. World matrices must be current.
    #[must_use]
    pub fn collect(scene: &Scene, shadows_enabled: bool) -> Self {
        let mut state = Self::default();

        for (node, light, world) in scene.iter_active_lights() {
            let position = Vec3::from(world.translation);
            let color = light.color * light.intensity;
            let shadowed = shadows_enabled && light.casts_shadow_map();
            let toward = |target: Vec3| (position - target).try_normalize().unwrap_or(Vec3::Y);

            match &light.kind {
                LightKind::Ambient => state.ambient += color,
                LightKind::Hemisphere(h) => state.hemisphere.push(HemisphereEntry {
                    direction: position.try_normalize().unwrap_or(Vec3::Y),
                    sky: color,
                    ground: h.ground_color * light.intensity,
                }),
                LightKind::Directional(d) => state.directional.push(DirectionalEntry {
                    node,
                    direction: toward(d.target),
                    color,
                    shadowed,
                }),
                LightKind::Point(p) => state.point.push(PointEntry {
                    node,
                    position,
                    color,
                    distance: p.distance,
                    decay: p.decay,
                    shadowed,
                }),
                LightKind::Spot(s) => state.spot.push(SpotEntry {
                    node,
                    position,
                    direction: toward(s.target),
                    color,
                    distance: s.distance,
                    decay: s.decay,
                    cone_cos: s.angle.cos(),
                    penumbra_cos: (s.angle * (1.0 - s.penumbra)).cos(),
                    shadowed,
                }),
            }
        }

        // Stable: shadowed lights first, otherwise arena order.
        state.directional.sort_by_key(|l| !l.shadowed);
        state.point.sort_by_key(|l| !l.shadowed);
        state.spot.sort_by_key(|l| !l.shadowed);
        state
    }

    #[must_use]
    pub fn counts(&self) -> LightCounts {
        LightCounts {
            hemisphere: self.hemisphere.len() as u32,
            directional: self.directional.len() as u32,
            point: self.point.len() as u32,
            spot: self.spot.len() as u32,
            directional_shadows: self.directional.iter().filter(|l| l.shadowed).count() as u32,
            point_shadows: self.point.iter().filter(|l| l.shadowed).count() as u32,
            spot_shadows: self.spot.iter().filter(|l| l.shadowed).count() as u32,
        }
    }

    /// Shadow-casting lights in sampler order: directional, point, spot.
    pub fn shadow_casters(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        let directional = self.directional.iter().filter(|l| l.shadowed).map(|l| l.node);
        let point = self.point.iter().filter(|l| l.shadowed).map(|l| l.node);
        let spot = self.spot.iter().filter(|l| l.shadowed).map(|l| l.node);
        directional.chain(point).chain(spot)
    }

    /// Packs the `Lights` uniform block. `shadow` supplies the per-light
    /// shadow parameters; a caster without a map packs an identity entry.
    pub fn pack(&self, shadow: impl Fn(NodeHandle) -> Option<ShadowUniform>) -> Vec<u8> {
        let counts = self.counts();
        let mut out: Vec<f32> = Vec::with_capacity(64);
        let push3 = |out: &mut Vec<f32>, v: Vec3, w: f32| out.extend_from_slice(&v.extend(w).to_array());

        push3(&mut out, self.ambient, 0.0);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(bytemuck::cast_slice(&out));
        for count in [counts.hemisphere, counts.directional, counts.point, counts.spot] {
            bytes.extend_from_slice(&count.to_le_bytes());
        }
        out.clear();

        for h in &self.hemisphere {
            push3(&mut out, h.direction, 0.0);
            push3(&mut out, h.sky, 0.0);
            push3(&mut out, h.ground, 0.0);
        }
        for d in &self.directional {
            push3(&mut out, d.direction, 0.0);
            push3(&mut out, d.color, 0.0);
        }
        for p in &self.point {
            push3(&mut out, p.position, p.distance);
            push3(&mut out, p.color, p.decay);
        }
        for s in &self.spot {
            push3(&mut out, s.position, s.distance);
            push3(&mut out, s.direction, 0.0);
            push3(&mut out, s.color, s.decay);
            out.extend_from_slice(&[s.cone_cos, s.penumbra_cos, 0.0, 0.0]);
        }

        let identity = ShadowUniform {
            matrix: Mat4::IDENTITY,
            params: Vec4::new(0.0, 0.0, 1.0, 1.0),
            range: Vec4::new(0.0, 1.0, 0.0, 0.0),
        };
        let push_shadows = |out: &mut Vec<f32>, nodes: &mut dyn Iterator<Item = NodeHandle>| {
            for node in nodes {
                let s = shadow(node).unwrap_or(identity);
                out.extend_from_slice(&s.matrix.to_cols_array());
                out.extend_from_slice(&s.params.to_array());
                out.extend_from_slice(&s.range.to_array());
            }
        };
        // Block member order: directional, spot, point.
        push_shadows(&mut out, &mut self.directional.iter().filter(|l| l.shadowed).map(|l| l.node));
        push_shadows(&mut out, &mut self.spot.iter().filter(|l| l.shadowed).map(|l| l.node));
        push_shadows(&mut out, &mut self.point.iter().filter(|l| l.shadowed).map(|l| l.node));

        bytes.extend_from_slice(bytemuck::cast_slice(&out));
        bytes
    }
}
