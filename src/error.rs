use thiserror::Error;

use crate::area::AreaId;

/// Everything that can go wrong when asking an
/// [`OffscreenAllocator`](../offscreen/struct.OffscreenAllocator.html) for
/// memory, or handing memory back.
///
/// None of these are fatal: a failed `alloc` leaves no area behind, and the
/// caller decides whether to retry, shrink the request, or give up on
/// offscreen memory entirely.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A zero-byte request. Nothing was done.
    #[error("empty allocation request")]
    EmptyRequest,

    /// The request can't fit even in an empty pool. No scan was performed.
    #[error("request of {size:#x} bytes exceeds offscreen capacity of {capacity:#x} bytes")]
    OverCapacity { size: usize, capacity: usize },

    /// No free area fits, and no span of evictable areas is large enough.
    #[error("no space for {size:#x} bytes aligned to {align}")]
    OutOfSpace { size: usize, align: usize },

    /// A record for a new area couldn't be reserved.
    #[error("failed to reserve an area record")]
    AllocationFailure,

    /// The handle doesn't name a live, in-use area. It was freed, evicted,
    /// swapped out, or never belonged to this allocator.
    #[error("stale or unknown area {0:?}")]
    InvalidArea(AreaId),

    /// The pool is swapped out; call `swap_in` first.
    #[error("offscreen memory is swapped out")]
    SwappedOut,

    /// The pool descriptor leaves no offscreen memory.
    #[error("offscreen base {offscreen_base:#x} leaves no room in {memory_size:#x} bytes")]
    InvalidPool {
        memory_size: usize,
        offscreen_base: usize,
    },
}
