//! The offscreen memory manager.
//!
//! ## [`OffscreenAllocator`](struct.OffscreenAllocator.html)
//!
//! An `OffscreenAllocator` hands out ranges of the device memory that lies
//! beyond the visible framebuffer. It keeps a list of areas covering that
//! memory, free and in use. Allocations are placed at the end of the first
//! free area they fit in. When none fits, the contiguous run of areas that is
//! cheapest to kick out is evicted and merged to make room.
//!
//! It is single-threaded and does no locking of its own; see
//! [`SharedOffscreen`](../shared/struct.SharedOffscreen.html) for a locked
//! wrapper.
//!
//! ## [`PoolDescriptor`](struct.PoolDescriptor.html)
//!
//! Where the offscreen memory is: the total size of the device memory, and
//! the offset at which offscreen memory begins.

use log::{debug, trace, warn};

use crate::area::{Area, AreaId, AreaState, SaveArea, SaveBox};
use crate::arealist::{AreaIter, AreaList, Stats, Validity};
use crate::error::AllocError;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> usize {
    match value % increment {
        0 => value,
        rem => value + (increment - rem),
    }
}

// Round down value to the nearest multiple of increment
fn round_down(value: usize, increment: usize) -> usize {
    value - value % increment
}

/// The number of bytes taken up by placing `size` bytes, aligned to `align`,
/// flush against the end of `[start, end)`. This includes the alignment loss.
///
/// Returns None if it doesn't fit.
fn placed_size(start: usize, end: usize, size: usize, align: usize) -> Option<usize> {
    let placed = round_down(end.checked_sub(size)?, align);
    if placed < start {
        return None;
    }
    Some(end - placed)
}

/// The device memory an allocator manages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolDescriptor {
    /// Total size of the device memory, in bytes.
    pub memory_size: usize,
    /// Where offscreen memory starts, i.e. the end of the framebuffer.
    pub offscreen_base: usize,
}

impl PoolDescriptor {
    pub const fn new(memory_size: usize, offscreen_base: usize) -> Self {
        PoolDescriptor {
            memory_size,
            offscreen_base,
        }
    }

    /// The number of offscreen bytes.
    pub fn capacity(&self) -> usize {
        self.memory_size.saturating_sub(self.offscreen_base)
    }
}

/// An offscreen memory allocator for a single pool.
///
/// `T` is whatever the owners of areas want to keep with them; it is handed
/// back through [`Area::owner_data`](../area/struct.Area.html#method.owner_data),
/// including to save callbacks.
///
/// Dropping the allocator drops every area without calling any save
/// callbacks.
pub struct OffscreenAllocator<T = ()> {
    pool: PoolDescriptor,
    areas: AreaList<T>,
    // Stamp for the next allocation. Starts at 1, so every in-use area has an
    // age of at least 1.
    counter: u32,
    // Running count of free areas in the list.
    available: usize,
    swapped_out: bool,
}

impl<T> OffscreenAllocator<T> {
    /// Set up the allocator with one free area spanning all of offscreen
    /// memory.
    pub fn init(pool: PoolDescriptor) -> Result<Self, AllocError> {
        if pool.offscreen_base >= pool.memory_size {
            return Err(AllocError::InvalidPool {
                memory_size: pool.memory_size,
                offscreen_base: pool.offscreen_base,
            });
        }

        let mut allocator = OffscreenAllocator {
            pool,
            areas: AreaList::default(),
            counter: 1,
            available: 0,
            swapped_out: false,
        };
        allocator.reset();
        debug!(
            "Offscreen init {:#x} -> {:#x}",
            pool.offscreen_base, pool.memory_size
        );
        Ok(allocator)
    }

    fn reset(&mut self) {
        self.areas.clear();
        self.areas.push_back(Area::available(
            self.pool.offscreen_base,
            self.pool.capacity(),
        ));
        self.counter = 1;
        self.available = 1;
        self.swapped_out = false;
        self.validate();
    }

    pub fn pool(&self) -> PoolDescriptor {
        self.pool
    }

    /// The stamp the next allocation will get.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Number of free areas.
    pub fn available_count(&self) -> usize {
        self.available
    }

    pub fn is_swapped_out(&self) -> bool {
        self.swapped_out
    }

    /// Look up an area. Returns None once the handle is stale.
    pub fn area(&self, id: AreaId) -> Option<&Area<T>> {
        let index = self.areas.resolve(id)?;
        Some(self.areas.get(index))
    }

    pub fn owner_data_mut(&mut self, id: AreaId) -> Option<&mut T> {
        let index = self.areas.resolve(id)?;
        self.areas.get_mut(index).owner_data.as_mut()
    }

    /// Iterate over all areas, free and in use, in offset order.
    pub fn iter(&self) -> AreaIter<'_, T> {
        self.areas.iter()
    }

    pub fn areas(&self) -> &AreaList<T> {
        &self.areas
    }

    /// Get statistics on this allocator, and verify validity of the area
    /// list against the pool.
    pub fn stats(&self) -> (Validity, Stats) {
        let (mut validity, stats) = self.areas.stats();

        if !self.swapped_out {
            match (self.areas.head(), self.areas.tail()) {
                (Some(head), Some(tail)) => {
                    if self.areas.get(head).base_offset != self.pool.offscreen_base {
                        validity.bad_bounds += 1;
                    }
                    if self.areas.get(tail).end() != self.pool.memory_size {
                        validity.bad_bounds += 1;
                    }
                }
                _ => validity.bad_bounds += 2,
            }
        }

        validity.available_mismatch = stats.available != self.available;
        (validity, stats)
    }

    #[cfg(feature = "validate")]
    fn validate(&self) {
        let (validity, _stats) = self.stats();
        assert!(
            validity.is_valid(),
            "Corrupt offscreen areas: {:?}\n{}",
            validity,
            self.areas
        );
    }

    #[cfg(not(feature = "validate"))]
    fn validate(&self) {}

    /// Allocate `size` bytes of offscreen memory, with its offset aligned to
    /// `align` bytes.
    ///
    /// A locked area is never kicked out to make room for other allocations;
    /// only `free` or `swap_out` get rid of it. An area that isn't locked may
    /// be evicted by a later `alloc`, in which case `save` is called first.
    ///
    /// Alignment 0 is treated as 1. The returned handle stays good until the
    /// area is freed or evicted.
    pub fn alloc(
        &mut self,
        size: usize,
        align: usize,
        locked: bool,
        save: Option<SaveBox<T>>,
        owner_data: T,
    ) -> Result<AreaId, AllocError> {
        if self.swapped_out {
            return Err(AllocError::SwappedOut);
        }
        let align = align.max(1);

        if size == 0 {
            debug!("Alloc {:#x} -> EMPTY", size);
            return Err(AllocError::EmptyRequest);
        }

        // Throw out requests that cannot fit
        let capacity = self.pool.capacity();
        if size > capacity {
            debug!("Alloc {:#x} vs ({:#x}) -> TOO BIG", size, capacity);
            return Err(AllocError::OverCapacity { size, capacity });
        }

        // Splitting below needs a fresh record. Get it now, before anything is
        // evicted.
        self.areas.reserve()?;

        let index = match self.find_free_area(size, align) {
            Some(index) => index,
            None => {
                let start = match self.find_area_to_evict(size, align) {
                    Some(start) => start,
                    None => {
                        debug!("Alloc {:#x} -> NO SPACE", size);
                        return Err(AllocError::OutOfSpace { size, align });
                    }
                };
                self.evict_span(start, size, align)?
            }
        };

        let (base_offset, area_size) = {
            let area = self.areas.get(index);
            (area.base_offset, area.size)
        };
        let real_size = placed_size(base_offset, base_offset + area_size, size, align)
            .ok_or(AllocError::OutOfSpace { size, align })?;

        // Save extra space in a new free area below this one
        if real_size < area_size {
            let leftover = Area::available(base_offset, area_size - real_size);
            let area = self.areas.get_mut(index);
            area.base_offset = base_offset + leftover.size;
            area.size = real_size;
            self.areas.insert_before(index, leftover);
        } else {
            self.available -= 1;
        }

        let last_use = self.counter;
        self.counter = self.counter.wrapping_add(1);
        self.areas.retire(index);
        let area = self.areas.get_mut(index);
        area.occupy(locked, save, owner_data, last_use, align);

        debug!(
            "Alloc ({}) {:#x} -> {:#x} ({:#x})",
            last_use, size, area.base_offset, area.offset
        );
        self.validate();
        Ok(self.areas.id(index))
    }

    /// Free an area handed out by `alloc`.
    ///
    /// The area's save callback is *not* called. The freed space is merged
    /// with any free neighbours; the returned handle names the merged free
    /// area and is only good for looking it up.
    pub fn free(&mut self, id: AreaId) -> Result<AreaId, AllocError> {
        let index = match self.areas.resolve(id) {
            Some(index) if self.areas.get(index).state.in_use() => index,
            _ => return Err(AllocError::InvalidArea(id)),
        };

        let survivor = self.release(index);
        self.validate();
        Ok(self.areas.id(survivor))
    }

    /// Kick out every area, locked or not, calling save callbacks along the
    /// way, and then tear down the area list.
    ///
    /// Used when the device memory is about to go away, e.g. on a VT switch.
    /// All outstanding handles go stale. `swap_in` brings the pool back.
    pub fn swap_out(&mut self) {
        if self.swapped_out {
            return;
        }
        self.validate();

        let mut evicted = 0;
        while let Some(index) = self.first_in_use() {
            self.kick_out(index);
            evicted += 1;
            self.validate();
        }

        debug!("Swap out: evicted {} areas", evicted);
        self.areas.clear();
        self.available = 0;
        self.swapped_out = true;
    }

    /// Bring the pool back to a single free area, as after `init`.
    ///
    /// Any areas still in the list are dropped without their save callbacks.
    pub fn swap_in(&mut self) {
        if !self.swapped_out {
            let live = self.iter().filter(|a| a.state.in_use()).count();
            if live > 0 {
                warn!("Swap in over {} live offscreen areas", live);
            }
        }

        self.reset();
        debug!("Swap in");
    }

    fn first_in_use(&self) -> Option<usize> {
        let mut cursor = self.areas.head();
        while let Some(index) = cursor {
            if self.areas.get(index).state.in_use() {
                return Some(index);
            }
            cursor = self.areas.next(index);
        }
        None
    }

    /// Find the first free area the request fits in.
    fn find_free_area(&self, size: usize, align: usize) -> Option<usize> {
        let mut largest_available = 0;

        let mut cursor = self.areas.head();
        while let Some(index) = cursor {
            let area = self.areas.get(index);
            if area.state.is_available() {
                if placed_size(area.base_offset, area.end(), size, align).is_some() {
                    return Some(index);
                }
                largest_available = largest_available.max(area.size);
            }
            cursor = self.areas.next(index);
        }

        trace!(
            "No free area for {:#x}, largest is {:#x}",
            size,
            largest_available
        );
        None
    }

    /// Find the run of areas, not crossing any locked area, that can hold the
    /// request at the lowest total eviction cost. Returns the first area of
    /// the run.
    ///
    /// This slides a window `[begin, end)` along the list: grow `end` until
    /// the window fits, compare, then drop `begin` and repeat. On equal cost
    /// the earlier run wins.
    fn find_area_to_evict(&mut self, size: usize, align: usize) -> Option<usize> {
        let counter = self.counter;
        let mut best = None;
        let mut best_cost = usize::MAX;

        let mut begin = self.areas.head();
        let mut end = begin;
        let mut avail = 0;
        let mut cost = 0;

        'scan: while end.is_some() {
            // Skip past locked areas, with an empty window
            while let Some(b) = begin {
                if self.areas.get(b).state != AreaState::Locked {
                    break;
                }
                begin = self.areas.next(b);
                end = begin;
            }
            let b = match begin {
                Some(b) => b,
                None => break,
            };
            let start = self.areas.get(b).base_offset;

            while placed_size(start, start + avail, size, align).is_none() {
                let e = match end {
                    Some(e) => e,
                    None => break,
                };
                let area = self.areas.get_mut(e);
                if area.state == AreaState::Locked {
                    // No more room here, restart after this locked area
                    avail = 0;
                    cost = 0;
                    begin = end;
                    continue 'scan;
                }
                area.update_eviction_cost(counter);
                avail += area.size;
                cost += area.eviction_cost;
                end = self.areas.next(e);
            }

            if placed_size(start, start + avail, size, align).is_some() && cost < best_cost {
                trace!("Eviction candidate {:#x}: cost {}", start, cost);
                best = Some(b);
                best_cost = cost;
            }

            let area = self.areas.get(b);
            avail -= area.size;
            cost -= area.eviction_cost;
            begin = self.areas.next(b);
        }

        best
    }

    /// Kick out the run starting at `start` until the request fits in the
    /// merged free area. Returns that area.
    ///
    /// Areas evicted here are not brought back if this fails.
    fn evict_span(&mut self, start: usize, size: usize, align: usize) -> Result<usize, AllocError> {
        let mut index = start;
        if self.areas.get(index).state.in_use() {
            index = self.kick_out(index);
        }

        loop {
            let area = self.areas.get(index);
            if placed_size(area.base_offset, area.end(), size, align).is_some() {
                return Ok(index);
            }

            // Freeing merges free neighbours, so the next area is in use.
            let next = match self.areas.next(index) {
                Some(next) if self.areas.get(next).state == AreaState::Removable => next,
                _ => {
                    debug_assert!(false, "Eviction ran into a locked area or the end");
                    return Err(AllocError::OutOfSpace { size, align });
                }
            };
            index = self.kick_out(next);
        }
    }

    /// Tell an area's owner it is being evicted, then free it. Returns the
    /// merged free area.
    fn kick_out(&mut self, index: usize) -> usize {
        if let Some(mut save) = self.areas.get_mut(index).save.take() {
            save.save(self.areas.get(index));
        }
        self.release(index)
    }

    /// Mark an area free, and merge it with free neighbours. Returns the
    /// merged area.
    fn release(&mut self, index: usize) -> usize {
        let area = self.areas.get_mut(index);
        debug!(
            "Freed ({}) {:#x} -> {:#x} ({:#x})",
            area.last_use, area.size, area.base_offset, area.offset
        );
        area.make_available();
        self.areas.retire(index);
        self.available += 1;

        // Link with next area if free
        if let Some(next) = self.areas.next(index) {
            if self.areas.get(next).state.is_available() {
                self.areas.merge_next(index);
                self.available -= 1;
            }
        }

        // Link with prev area if free
        if let Some(prev) = self.areas.prev(index) {
            if self.areas.get(prev).state.is_available() {
                self.areas.merge_next(prev);
                self.available -= 1;
                return prev;
            }
        }

        index
    }
}
