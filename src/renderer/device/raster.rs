//! Scanline-free triangle rasterizer used by the headless device.
//!
//! Triangles arrive in clip space, are clipped against the near plane,
//! mapped to the viewport (top-left origin) and filled with a top-left rule
//! so that edges shared by two triangles are covered exactly once.

use glam::{Vec2, Vec3, Vec4};

use super::{CullMode, FrontFace, Rect};
use crate::resources::material::{BlendComponent, BlendFactor, BlendOperation, BlendState, CompareFunction};

/// Smallest depth step of a 24-bit depth buffer, used by polygon offset.
const DEPTH_UNIT: f32 = 1.0 / 16_777_216.0;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RasterState {
    pub depth_test: bool,
    pub depth_func: CompareFunction,
    pub depth_write: bool,
    pub blend: Option<BlendState>,
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub polygon_offset: Option<(f32, f32)>,
    pub color_write: bool,
    pub viewport: Rect,
    pub scissor: Option<Rect>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_func: CompareFunction::LessEqual,
            depth_write: true,
            blend: None,
            cull: CullMode::None,
            front_face: FrontFace::Ccw,
            polygon_offset: None,
            color_write: true,
            viewport: Rect::default(),
            scissor: None,
        }
    }
}

/// A vertex after the vertex stage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClipVertex {
    pub clip: Vec4,
    pub world: Vec3,
    pub uv: Vec2,
    pub color: Vec4,
}

impl ClipVertex {
    fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            clip: self.clip.lerp(other.clip, t),
            world: self.world.lerp(other.world, t),
            uv: self.uv.lerp(other.uv, t),
            color: self.color.lerp(other.color, t),
        }
    }
}

/// Interpolated inputs of the fragment stage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fragment {
    pub x: u32,
    pub y: u32,
    pub depth: f32,
    pub world: Vec3,
    pub uv: Vec2,
    pub color: Vec4,
}

/// Color and depth planes being drawn into. Depth is stored in `.x`.
pub(crate) struct RasterTarget<'a> {
    pub width: u32,
    pub height: u32,
    pub color: Option<&'a mut [Vec4]>,
    pub depth: Option<&'a mut [Vec4]>,
}

/// Rasterizes one triangle. `shade` returns `None` to discard the fragment.
///
/// Returns whether the triangle survived clipping and culling.
pub(crate) fn draw_triangle(
    target: &mut RasterTarget<'_>,
    state: &RasterState,
    vertices: [ClipVertex; 3],
    shade: &mut dyn FnMut(&Fragment) -> Option<Vec4>,
) -> bool {
    let polygon = clip_near(&vertices);
    if polygon.len() < 3 {
        return false;
    }

    let mut drawn = false;
    for i in 1..polygon.len() - 1 {
        drawn |= fill(target, state, [polygon[0], polygon[i], polygon[i + 1]], shade);
    }
    drawn
}

/// Sutherland-Hodgman against `z >= 0`, the near plane of a `[0, 1]` depth range.
fn clip_near(vertices: &[ClipVertex; 3]) -> Vec<ClipVertex> {
    let mut out = Vec::with_capacity(4);
    for i in 0..3 {
        let a = &vertices[i];
        let b = &vertices[(i + 1) % 3];
        let a_in = a.clip.z >= 0.0;
        let b_in = b.clip.z >= 0.0;
        if a_in {
            out.push(*a);
        }
        if a_in != b_in {
            let t = a.clip.z / (a.clip.z - b.clip.z);
            out.push(a.lerp(b, t));
        }
    }
    out.retain(|v| v.clip.w > f32::EPSILON);
    out
}

struct ScreenVertex {
    pos: Vec2,
    depth: f32,
    inv_w: f32,
}

fn to_screen(v: &ClipVertex, viewport: &Rect) -> ScreenVertex {
    let inv_w = 1.0 / v.clip.w;
    let ndc = v.clip.truncate() * inv_w;
    ScreenVertex {
        pos: Vec2::new(
            viewport.x as f32 + (ndc.x * 0.5 + 0.5) * viewport.width as f32,
            viewport.y as f32 + (1.0 - (ndc.y * 0.5 + 0.5)) * viewport.height as f32,
        ),
        depth: ndc.z,
        inv_w,
    }
}

/// Edge function with a canonical endpoint order so that the two triangles
/// sharing an edge see exactly opposite values.
fn edge(a: Vec2, b: Vec2, p: Vec2) -> (f32, bool) {
    let (first, second, flipped) = if (a.x, a.y) <= (b.x, b.y) { (a, b, false) } else { (b, a, true) };
    let e = (second.x - first.x) * (p.y - first.y) - (second.y - first.y) * (p.x - first.x);
    let e = if flipped { -e } else { e };
    let d = b - a;
    let owns_boundary = d.y > 0.0 || (d.y == 0.0 && d.x > 0.0);
    (e, owns_boundary)
}

fn fill(
    target: &mut RasterTarget<'_>,
    state: &RasterState,
    vertices: [ClipVertex; 3],
    shade: &mut dyn FnMut(&Fragment) -> Option<Vec4>,
) -> bool {
    let s = vertices.each_ref().map(|v| to_screen(v, &state.viewport));

    let area = (s[1].pos.x - s[0].pos.x) * (s[2].pos.y - s[0].pos.y)
        - (s[1].pos.y - s[0].pos.y) * (s[2].pos.x - s[0].pos.x);
    if area.abs() <= f32::EPSILON {
        return false;
    }

    // Screen space is y-down, so a counter-clockwise triangle has negative area.
    let ccw = area < 0.0;
    let front = match state.front_face {
        FrontFace::Ccw => ccw,
        FrontFace::Cw => !ccw,
    };
    match state.cull {
        CullMode::Back if !front => return false,
        CullMode::Front if front => return false,
        _ => {}
    }

    // Orient so interior points have positive edge values.
    let order = if area > 0.0 { [0, 1, 2] } else { [0, 2, 1] };
    let [i0, i1, i2] = order;
    let (p0, p1, p2) = (s[i0].pos, s[i1].pos, s[i2].pos);
    let total = area.abs();

    let offset = state.polygon_offset.map_or(0.0, |(factor, units)| {
        let dzdx = ((s[1].depth - s[0].depth) * (s[2].pos.y - s[0].pos.y)
            - (s[2].depth - s[0].depth) * (s[1].pos.y - s[0].pos.y))
            / area;
        let dzdy = ((s[2].depth - s[0].depth) * (s[1].pos.x - s[0].pos.x)
            - (s[1].depth - s[0].depth) * (s[2].pos.x - s[0].pos.x))
            / area;
        factor * dzdx.abs().max(dzdy.abs()) + units * DEPTH_UNIT
    });

    let mut bounds = Rect::new(0, 0, target.width, target.height);
    bounds = intersect(&bounds, &state.viewport);
    if let Some(scissor) = &state.scissor {
        bounds = intersect(&bounds, scissor);
    }
    if bounds.width == 0 || bounds.height == 0 {
        return true;
    }

    let min = p0.min(p1).min(p2).floor().max(Vec2::ZERO);
    let max = p0.max(p1).max(p2).ceil();
    let x0 = (min.x as u32).max(bounds.x);
    let y0 = (min.y as u32).max(bounds.y);
    let x1 = (max.x.max(0.0) as u32).min(bounds.x + bounds.width);
    let y1 = (max.y.max(0.0) as u32).min(bounds.y + bounds.height);

    for y in y0..y1 {
        for x in x0..x1 {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let (e0, t0) = edge(p1, p2, p);
            let (e1, t1) = edge(p2, p0, p);
            let (e2, t2) = edge(p0, p1, p);
            let inside = |e: f32, owns: bool| e > 0.0 || (e == 0.0 && owns);
            if !(inside(e0, t0) && inside(e1, t1) && inside(e2, t2)) {
                continue;
            }

            let mut bary = [0.0_f32; 3];
            bary[i0] = e0 / total;
            bary[i1] = e1 / total;
            bary[i2] = e2 / total;

            let depth = bary[0] * s[0].depth + bary[1] * s[1].depth + bary[2] * s[2].depth + offset;
            if !(0.0..=1.0).contains(&depth) {
                continue;
            }

            let index = (y * target.width + x) as usize;
            if state.depth_test
                && let Some(depth_plane) = target.depth.as_deref()
                && !state.depth_func.test(depth, depth_plane[index].x)
            {
                continue;
            }

            // Perspective-correct weights.
            let pw = [bary[0] * s[0].inv_w, bary[1] * s[1].inv_w, bary[2] * s[2].inv_w];
            let sum = pw[0] + pw[1] + pw[2];
            let w = pw.map(|v| v / sum);

            let fragment = Fragment {
                x,
                y,
                depth,
                world: vertices[0].world * w[0] + vertices[1].world * w[1] + vertices[2].world * w[2],
                uv: vertices[0].uv * w[0] + vertices[1].uv * w[1] + vertices[2].uv * w[2],
                color: vertices[0].color * w[0] + vertices[1].color * w[1] + vertices[2].color * w[2],
            };

            let Some(src) = shade(&fragment) else {
                continue;
            };

            if state.depth_write
                && let Some(depth_plane) = target.depth.as_deref_mut()
            {
                depth_plane[index].x = depth;
            }
            if state.color_write
                && let Some(color_plane) = target.color.as_deref_mut()
            {
                let dst = color_plane[index];
                color_plane[index] = match &state.blend {
                    Some(blend) => apply_blend(blend, src, dst),
                    None => src,
                };
            }
        }
    }
    true
}

fn intersect(a: &Rect, b: &Rect) -> Rect {
    let x0 = a.x.max(b.x);
    let y0 = a.y.max(b.y);
    let x1 = (a.x + a.width).min(b.x + b.width);
    let y1 = (a.y + a.height).min(b.y + b.height);
    Rect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
}

pub(crate) fn apply_blend(blend: &BlendState, src: Vec4, dst: Vec4) -> Vec4 {
    let rgb = combine(&blend.color, src, dst).truncate();
    let a = combine(&blend.alpha, src, dst).w;
    rgb.extend(a)
}

fn combine(component: &BlendComponent, src: Vec4, dst: Vec4) -> Vec4 {
    let s = src * factor(component.src, src, dst);
    let d = dst * factor(component.dst, src, dst);
    match component.operation {
        BlendOperation::Add => s + d,
        BlendOperation::Subtract => s - d,
        BlendOperation::ReverseSubtract => d - s,
        BlendOperation::Min => src.min(dst),
        BlendOperation::Max => src.max(dst),
    }
}

fn factor(f: BlendFactor, src: Vec4, dst: Vec4) -> Vec4 {
    match f {
        BlendFactor::Zero => Vec4::ZERO,
        BlendFactor::One => Vec4::ONE,
        BlendFactor::Src => src,
        BlendFactor::OneMinusSrc => Vec4::ONE - src,
        BlendFactor::SrcAlpha => Vec4::splat(src.w),
        BlendFactor::OneMinusSrcAlpha => Vec4::splat(1.0 - src.w),
        BlendFactor::Dst => dst,
        BlendFactor::OneMinusDst => Vec4::ONE - dst,
        BlendFactor::DstAlpha => Vec4::splat(dst.w),
        BlendFactor::OneMinusDstAlpha => Vec4::splat(1.0 - dst.w),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, y: f32, z: f32) -> ClipVertex {
        ClipVertex {
            clip: Vec4::new(x, y, z, 1.0),
            world: Vec3::ZERO,
            uv: Vec2::ZERO,
            color: Vec4::ONE,
        }
    }

    fn quad() -> [[ClipVertex; 3]; 2] {
        let (a, b, c, d) = (
            vertex(-1.0, -1.0, 0.5),
            vertex(1.0, -1.0, 0.5),
            vertex(1.0, 1.0, 0.5),
            vertex(-1.0, 1.0, 0.5),
        );
        [[a, b, c], [a, c, d]]
    }

    #[test]
    fn test_shared_edge_is_covered_once() {
        let mut color = vec![Vec4::ZERO; 16];
        let mut target = RasterTarget {
            width: 4,
            height: 4,
            color: Some(&mut color),
            depth: None,
        };
        let state = RasterState {
            viewport: Rect::from_size(4, 4),
            blend: Some(BlendState {
                color: BlendComponent::new(BlendFactor::One, BlendFactor::One, BlendOperation::Add),
                alpha: BlendComponent::new(BlendFactor::One, BlendFactor::One, BlendOperation::Add),
            }),
            ..Default::default()
        };
        for tri in quad() {
            draw_triangle(&mut target, &state, tri, &mut |_| Some(Vec4::splat(0.25)));
        }
        assert!(color.iter().all(|c| (c.x - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_back_faces_are_culled() {
        let mut color = vec![Vec4::ZERO; 16];
        let mut target = RasterTarget {
            width: 4,
            height: 4,
            color: Some(&mut color),
            depth: None,
        };
        let state = RasterState {
            viewport: Rect::from_size(4, 4),
            cull: CullMode::Back,
            ..Default::default()
        };
        let [a, b, c] = quad()[0];
        assert!(!draw_triangle(&mut target, &state, [a, c, b], &mut |_| Some(Vec4::ONE)));
        assert!(draw_triangle(&mut target, &state, [a, b, c], &mut |_| Some(Vec4::ONE)));
    }

    #[test]
    fn test_depth_test_keeps_nearest() {
        let mut depth = vec![Vec4::ONE; 16];
        let mut color = vec![Vec4::ZERO; 16];
        let mut target = RasterTarget {
            width: 4,
            height: 4,
            color: Some(&mut color),
            depth: Some(&mut depth),
        };
        let state = RasterState {
            viewport: Rect::from_size(4, 4),
            depth_test: true,
            ..Default::default()
        };
        let near = quad().map(|t| t.map(|mut v| {
            v.clip.z = 0.2;
            v
        }));
        for tri in near {
            draw_triangle(&mut target, &state, tri, &mut |_| Some(Vec4::X));
        }
        for tri in quad() {
            draw_triangle(&mut target, &state, tri, &mut |_| Some(Vec4::Y));
        }
        assert_eq!(color[5], Vec4::X);
        assert!((depth[5].x - 0.2).abs() < 1e-6);
    }
}
