//! GPU state shadowing.
//!
//! [`StateTracker`] mirrors every piece of device state the renderer touches.
//! A request reaches the device only when it differs from the mirrored value,
//! which keeps sorted render lists from re-issuing identical state between
//! consecutive draws. Unknown state (after [`StateTracker::reset`]) is always
//! forwarded.

use rustc_hash::FxHashMap;

use crate::renderer::device::{BufferId, CullMode, FramebufferId, FrontFace, GpuDevice, ProgramId, Rect, TextureId};
use crate::resources::material::{BlendState, CompareFunction, Side};

/// Fixed-function state requested by one draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderState {
    pub depth_test: bool,
    pub depth_func: CompareFunction,
    pub depth_write: bool,
    pub blend: Option<BlendState>,
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub polygon_offset: Option<(f32, f32)>,
    pub color_write: bool,
    pub stencil_test: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_func: CompareFunction::LessEqual,
            depth_write: true,
            blend: None,
            cull: CullMode::Back,
            front_face: FrontFace::Ccw,
            polygon_offset: None,
            color_write: true,
            stencil_test: false,
        }
    }
}

impl RenderState {
    /// Culling for a material side. A negative-determinant model matrix
    /// flips the winding.
    #[must_use]
    pub fn culling(side: Side, flip_winding: bool) -> (CullMode, FrontFace) {
        let cull = match side {
            Side::Front => CullMode::Back,
            Side::Back => CullMode::Front,
            Side::Double => CullMode::None,
        };
        let face = if flip_winding { FrontFace::Cw } else { FrontFace::Ccw };
        (cull, face)
    }
}

/// Shadow copy of device state. `None` means unknown.
#[derive(Debug, Default)]
pub struct StateTracker {
    depth_test: Option<bool>,
    depth_func: Option<CompareFunction>,
    depth_write: Option<bool>,
    blend: Option<Option<BlendState>>,
    cull: Option<CullMode>,
    front_face: Option<FrontFace>,
    polygon_offset: Option<Option<(f32, f32)>>,
    color_write: Option<bool>,
    stencil_test: Option<bool>,
    viewport: Option<Rect>,
    scissor: Option<Option<Rect>>,
    clip_planes: Option<u32>,
    program: Option<ProgramId>,
    framebuffer: Option<Option<FramebufferId>>,
    texture_units: FxHashMap<u32, Option<TextureId>>,
    uniform_buffers: FxHashMap<u32, Option<BufferId>>,

    issued: u64,
    skipped: u64,
}

/// Forwards `$value` through `$call` when the shadow slot differs.
macro_rules! diff_set {
    ($self:ident, $slot:ident, $value:expr, $call:expr) => {{
        let value = $value;
        if $self.$slot == Some(value) {
            $self.skipped += 1;
            false
        } else {
            $self.$slot = Some(value);
            $self.issued += 1;
            $call(value);
            true
        }
    }};
}

impl StateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything; the next request of each kind reaches the device.
    pub fn reset(&mut self) {
        *self = Self {
            issued: self.issued,
            skipped: self.skipped,
            ..Self::default()
        };
    }

    /// State changes forwarded to the device.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Redundant requests that were filtered out.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn apply<D: GpuDevice + ?Sized>(&mut self, device: &mut D, state: &RenderState) {
        diff_set!(self, depth_test, state.depth_test, |v| device.set_depth_test(v));
        diff_set!(self, depth_func, state.depth_func, |v| device.set_depth_func(v));
        diff_set!(self, depth_write, state.depth_write, |v| device.set_depth_write(v));
        diff_set!(self, blend, state.blend, |v| device.set_blend(v));
        diff_set!(self, cull, state.cull, |v| device.set_cull_mode(v));
        diff_set!(self, front_face, state.front_face, |v| device.set_front_face(v));
        diff_set!(self, polygon_offset, state.polygon_offset, |v| device.set_polygon_offset(v));
        diff_set!(self, color_write, state.color_write, |v| device.set_color_mask(v));
        diff_set!(self, stencil_test, state.stencil_test, |v| device.set_stencil_test(v));
    }

    pub fn set_depth_write<D: GpuDevice + ?Sized>(&mut self, device: &mut D, enabled: bool) {
        diff_set!(self, depth_write, enabled, |v| device.set_depth_write(v));
    }

    pub fn set_color_write<D: GpuDevice + ?Sized>(&mut self, device: &mut D, enabled: bool) {
        diff_set!(self, color_write, enabled, |v| device.set_color_mask(v));
    }

    pub fn set_viewport<D: GpuDevice + ?Sized>(&mut self, device: &mut D, rect: Rect) {
        diff_set!(self, viewport, rect, |v| device.set_viewport(v));
    }

    pub fn set_scissor<D: GpuDevice + ?Sized>(&mut self, device: &mut D, rect: Option<Rect>) {
        diff_set!(self, scissor, rect, |v| device.set_scissor(v));
    }

    pub fn set_clip_planes<D: GpuDevice + ?Sized>(&mut self, device: &mut D, count: u32) {
        diff_set!(self, clip_planes, count, |v| device.set_clip_planes(v));
    }

    /// Returns `true` when the program actually changed.
    pub fn use_program<D: GpuDevice + ?Sized>(&mut self, device: &mut D, program: ProgramId) -> bool {
        diff_set!(self, program, program, |v| device.use_program(v))
    }

    pub fn bind_framebuffer<D: GpuDevice + ?Sized>(&mut self, device: &mut D, framebuffer: Option<FramebufferId>) {
        diff_set!(self, framebuffer, framebuffer, |v| device.bind_framebuffer(v));
    }

    #[must_use]
    pub fn bound_framebuffer(&self) -> Option<Option<FramebufferId>> {
        self.framebuffer
    }

    pub fn bind_texture<D: GpuDevice + ?Sized>(&mut self, device: &mut D, unit: u32, texture: Option<TextureId>) {
        if self.texture_units.get(&unit) == Some(&texture) {
            self.skipped += 1;
            return;
        }
        self.texture_units.insert(unit, texture);
        self.issued += 1;
        device.bind_texture(unit, texture);
    }

    pub fn bind_uniform_buffer<D: GpuDevice + ?Sized>(&mut self, device: &mut D, slot: u32, buffer: Option<BufferId>) {
        if self.uniform_buffers.get(&slot) == Some(&buffer) {
            self.skipped += 1;
            return;
        }
        self.uniform_buffers.insert(slot, buffer);
        self.issued += 1;
        device.bind_uniform_buffer(slot, buffer);
    }

    /// Drops shadow entries that reference a deleted program.
    pub fn forget_program(&mut self, program: ProgramId) {
        if self.program == Some(program) {
            self.program = None;
        }
    }

    pub fn forget_texture(&mut self, texture: TextureId) {
        self.texture_units.retain(|_, t| *t != Some(texture));
    }

    pub fn forget_framebuffer(&mut self, framebuffer: FramebufferId) {
        if self.framebuffer == Some(Some(framebuffer)) {
            self.framebuffer = None;
        }
    }

    pub fn forget_buffer(&mut self, buffer: BufferId) {
        self.uniform_buffers.retain(|_, b| *b != Some(buffer));
    }
}

/// Hands out texture units for one draw.
///
/// Owned per renderer. Exhausting the device limit yields `None` and the
/// sampler is left unbound.
#[derive(Debug, Clone)]
pub struct TextureUnitAllocator {
    next: u32,
    limit: u32,
}

impl TextureUnitAllocator {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self { next: 0, limit }
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Called before each draw.
    pub fn reset(&mut self) {
        self.next = 0;
    }

    pub fn allocate(&mut self) -> Option<u32> {
        if self.next >= self.limit {
            return None;
        }
        let unit = self.next;
        self.next += 1;
        Some(unit)
    }

    /// Units handed out since the last reset.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::HeadlessDevice;

    #[test]
    fn test_identical_state_is_not_reissued() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut tracker = StateTracker::new();
        let state = RenderState::default();

        tracker.apply(&mut device, &state);
        let after_first = device.stats().state_changes;
        tracker.apply(&mut device, &state);
        assert_eq!(device.stats().state_changes, after_first);

        let blended = RenderState {
            depth_write: false,
            ..state
        };
        tracker.apply(&mut device, &blended);
        assert_eq!(device.stats().state_changes, after_first + 1);
    }

    #[test]
    fn test_reset_forwards_everything_again() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut tracker = StateTracker::new();
        tracker.set_viewport(&mut device, Rect::from_size(4, 4));
        tracker.set_viewport(&mut device, Rect::from_size(4, 4));
        assert_eq!(tracker.skipped(), 1);

        tracker.reset();
        tracker.set_viewport(&mut device, Rect::from_size(4, 4));
        assert_eq!(tracker.issued(), 2);
    }

    #[test]
    fn test_unit_allocator_limit() {
        let mut units = TextureUnitAllocator::new(2);
        assert_eq!(units.allocate(), Some(0));
        assert_eq!(units.allocate(), Some(1));
        assert_eq!(units.allocate(), None);
        units.reset();
        assert_eq!(units.allocate(), Some(0));
    }
}
