use std::fmt::Debug;

pub type FrameId = u32;

/// Eviction policy over buffer pool frames. The pool serialises calls
/// through its own mutex; implementations hold no locks of their own.
pub trait Replacer: Send + Sync + Debug {
    /// Removes and returns the next frame to evict, or None if no frame
    /// is eligible.
    fn victim(&mut self) -> Option<FrameId>;

    /// Marks a frame ineligible for eviction. Idempotent.
    fn pin(&mut self, frame_id: FrameId);

    /// Marks a frame eligible for eviction, as the most recently used.
    /// Idempotent when the frame is already eligible.
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of eligible frames.
    fn size(&self) -> usize;
}
