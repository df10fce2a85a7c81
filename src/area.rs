//! Offscreen areas, the records an allocator's area list is made of.
//!
//! An [`Area`](struct.Area.html) is a contiguous range of the offscreen pool.
//! It is either `Available`, or in use by some owner, in which case it may be
//! kicked out to make room for a new allocation: first its owner is told via
//! its [`SaveArea`](trait.SaveArea.html) callback, and then it is freed.

use core::fmt;

use static_assertions::const_assert;

/// Ages beyond this are clamped, so that `size / age` never divides by zero,
/// no matter how far the counter runs.
pub const AGE_CEILING: u32 = u32::MAX / 2;
const_assert!(AGE_CEILING > 0);

/// The state of an area.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AreaState {
    /// Free for reuse.
    Available,
    /// In use, but may be kicked out to make room for another allocation.
    Removable,
    /// In use, and only ever kicked out when the whole pool is swapped out.
    Locked,
}

impl AreaState {
    pub fn is_available(self) -> bool {
        self == AreaState::Available
    }

    pub fn in_use(self) -> bool {
        !self.is_available()
    }
}

/// A handle to an area in an allocator's list.
///
/// Handles are cheap to copy. Each one is good for a single stretch of use of
/// an area: once the area is freed, evicted, or swapped out, the handle goes
/// stale and the allocator will refuse it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AreaId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

/// Called right before an in-use area is kicked out, so its owner can copy
/// the contents somewhere else, or forget about them.
///
/// The callback runs inline, in the middle of an `alloc` or `swap_out`. It
/// must not call back into the allocator that owns the area.
pub trait SaveArea<T> {
    fn save(&mut self, area: &Area<T>);
}

impl<T, F> SaveArea<T> for F
where
    F: FnMut(&Area<T>),
{
    fn save(&mut self, area: &Area<T>) {
        self(area)
    }
}

/// How save callbacks are stored.
pub type SaveBox<T> = Box<dyn SaveArea<T> + Send>;

/// A contiguous range of offscreen memory, free or in use.
pub struct Area<T> {
    pub(crate) base_offset: usize,
    pub(crate) size: usize,
    pub(crate) offset: usize,
    pub(crate) align: usize,
    pub(crate) state: AreaState,
    pub(crate) last_use: u32,
    pub(crate) eviction_cost: usize,
    pub(crate) save: Option<SaveBox<T>>,
    pub(crate) owner_data: Option<T>,
}

impl<T> Area<T> {
    /// A new free area covering `size` bytes from `base_offset`.
    pub(crate) fn available(base_offset: usize, size: usize) -> Self {
        Area {
            base_offset,
            size,
            offset: base_offset,
            align: 0,
            state: AreaState::Available,
            last_use: 0,
            eviction_cost: 0,
            save: None,
            owner_data: None,
        }
    }

    /// Start of the area within the pool.
    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Total size of the area, including any alignment loss.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte of the area.
    pub fn end(&self) -> usize {
        self.base_offset + self.size
    }

    /// The aligned offset handed out to the owner. Equal to `base_offset` for
    /// free areas.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The alignment `offset` was computed with, or 0 for free areas.
    pub fn align(&self) -> usize {
        self.align
    }

    pub fn state(&self) -> AreaState {
        self.state
    }

    /// The allocation counter value when this area was handed out.
    pub fn last_use(&self) -> u32 {
        self.last_use
    }

    /// The eviction cost as of the last eviction scan that looked at this
    /// area. Lower is cheaper to kick out.
    pub fn eviction_cost(&self) -> usize {
        self.eviction_cost
    }

    pub fn owner_data(&self) -> Option<&T> {
        self.owner_data.as_ref()
    }

    /// Recompute `eviction_cost` against the allocator's current counter.
    ///
    /// Large areas that haven't been handed out in a long time are the
    /// cheapest. Free areas cost nothing and are left alone.
    pub(crate) fn update_eviction_cost(&mut self, counter: u32) {
        if self.state.is_available() {
            return;
        }

        let mut age = counter.wrapping_sub(self.last_use);
        // An age of 0 means the counter went all the way around.
        if age == 0 || age > AGE_CEILING {
            age = AGE_CEILING;
            self.last_use = counter.wrapping_sub(age);
        }

        self.eviction_cost = self.size / age as usize;
    }

    /// Hand this area out.
    pub(crate) fn occupy(
        &mut self,
        locked: bool,
        save: Option<SaveBox<T>>,
        owner_data: T,
        last_use: u32,
        align: usize,
    ) {
        self.state = if locked {
            AreaState::Locked
        } else {
            AreaState::Removable
        };
        self.save = save;
        self.owner_data = Some(owner_data);
        self.last_use = last_use;
        self.offset = crate::offscreen::round_up(self.base_offset, align);
        self.align = align;
    }

    /// Mark this area free, dropping everything its owner left behind.
    pub(crate) fn make_available(&mut self) {
        self.state = AreaState::Available;
        self.save = None;
        self.owner_data = None;
        self.last_use = 0;
        self.eviction_cost = 0;
        self.offset = self.base_offset;
        self.align = 0;
    }
}

impl<T> fmt::Debug for Area<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Area")
            .field("base_offset", &self.base_offset)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("align", &self.align)
            .field("state", &self.state)
            .field("last_use", &self.last_use)
            .field("eviction_cost", &self.eviction_cost)
            .field("save", &self.save.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn in_use(size: usize, last_use: u32) -> Area<()> {
        let mut area = Area::available(0, size);
        area.occupy(false, None, (), last_use, 1);
        area
    }

    #[test]
    fn test_cost_prefers_large_and_old() {
        let mut fresh_small = in_use(64, 9);
        let mut stale_large = in_use(4096, 1);

        fresh_small.update_eviction_cost(10);
        stale_large.update_eviction_cost(10);

        assert_eq!(fresh_small.eviction_cost(), 64);
        assert_eq!(stale_large.eviction_cost(), 4096 / 9);

        let mut stale_small = in_use(64, 1);
        stale_small.update_eviction_cost(10);
        assert!(stale_small.eviction_cost() < fresh_small.eviction_cost());
    }

    #[test]
    fn test_cost_clamps_age() {
        let mut area = in_use(1 << 20, 5);
        let counter = 5u32.wrapping_add(AGE_CEILING).wrapping_add(100);
        area.update_eviction_cost(counter);

        assert_eq!(area.last_use(), counter.wrapping_sub(AGE_CEILING));
        assert_eq!(area.eviction_cost(), (1 << 20) / AGE_CEILING as usize);

        // Recomputing against the same counter is stable.
        area.update_eviction_cost(counter);
        assert_eq!(area.last_use(), counter.wrapping_sub(AGE_CEILING));
    }

    #[test]
    fn test_free_areas_cost_nothing() {
        let mut area: Area<()> = Area::available(128, 256);
        area.update_eviction_cost(1000);
        assert_eq!(area.eviction_cost(), 0);
        assert_eq!(area.offset(), 128);
        assert_eq!(area.align(), 0);
    }

    #[test]
    fn test_occupy_and_release() {
        let mut area: Area<&'static str> = Area::available(10, 100);
        area.occupy(true, None, "pixmap", 3, 16);
        assert_eq!(area.state(), AreaState::Locked);
        assert_eq!(area.offset(), 16);
        assert_eq!(area.align(), 16);
        assert_eq!(area.owner_data(), Some(&"pixmap"));

        area.make_available();
        assert_eq!(area.state(), AreaState::Available);
        assert_eq!(area.offset(), 10);
        assert_eq!(area.last_use(), 0);
        assert!(area.owner_data().is_none());
    }

    #[test]
    fn test_closures_are_save_callbacks() {
        let mut saved = Vec::new();
        {
            let mut cb = |area: &Area<u32>| saved.push(*area.owner_data().unwrap());
            let mut area = Area::available(0, 8);
            area.occupy(false, None, 7u32, 1, 1);
            SaveArea::save(&mut cb, &area);
        }
        assert_eq!(saved, vec![7]);
    }
}
