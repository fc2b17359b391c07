use crate::cache::ResourceCache;
use crate::gpu::GpuContext;

/// Decode tasks admitted per frame before Draco-style loaders defer to the
/// next `update` call.
pub const DEFAULT_DECODE_SLOTS: usize = 4;

/// Per-frame borrows handed to every `update` call on the driving thread.
pub struct FrameContext<'a> {
    pub cache: &'a mut ResourceCache,
    pub gpu: &'a mut dyn GpuContext,
    pub frame_number: u64,
    decode_slots: usize,
}

impl<'a> FrameContext<'a> {
    pub fn new(cache: &'a mut ResourceCache, gpu: &'a mut dyn GpuContext, frame_number: u64) -> Self {
        Self {
            cache,
            gpu,
            frame_number,
            decode_slots: DEFAULT_DECODE_SLOTS,
        }
    }

    /// Cap how many decode tasks may be scheduled this frame. Zero models a
    /// saturated worker pool.
    pub fn with_decode_slots(mut self, slots: usize) -> Self {
        self.decode_slots = slots;
        self
    }

    /// Claim a decode slot; callers that get `false` must retry next frame.
    pub fn take_decode_slot(&mut self) -> bool {
        if self.decode_slots == 0 {
            return false;
        }
        self.decode_slots -= 1;
        true
    }
}
