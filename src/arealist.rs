use core::fmt;

use crate::area::{Area, AreaId};
use crate::error::AllocError;

/// An area, plus its links in the list.
struct Node<T> {
    area: Area<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Entry<T> {
    Occupied(Node<T>),
    // Vacant slots form their own singly linked chain, for reuse.
    Vacant { next_vacant: Option<usize> },
}

struct Slot<T> {
    // Bumped whenever the area in this slot changes hands, so old handles go
    // stale.
    generation: u32,
    entry: Entry<T>,
}

/// An enum for easy comparison of areas and their order
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

fn relation<T>(this: &Area<T>, other: &Area<T>) -> Relation {
    if this.end() < other.base_offset {
        Relation::Before
    } else if this.end() == other.base_offset {
        Relation::AdjacentBefore
    } else if this.base_offset < other.end() {
        Relation::Overlapping
    } else if this.base_offset == other.end() {
        Relation::AdjacentAfter
    } else {
        Relation::After
    }
}

/// An `AreaList` is a doubly linked list of areas, ordered by offset.
///
/// The nodes live in a slot arena; links are slot indices. Slots freed by
/// merging are chained together and reused by later splits.
///
/// The list itself only knows about links. Keeping the areas contiguous, and
/// keeping free areas merged, is up to the allocator; `stats` reports on
/// both.
pub struct AreaList<T> {
    slots: Vec<Slot<T>>,
    vacant: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

pub struct AreaIter<'list, T> {
    list: &'list AreaList<T>,
    next: Option<usize>,
}

impl<'list, T> Iterator for AreaIter<'list, T> {
    type Item = &'list Area<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next.take()?;
        let list = self.list;
        let node = list.node(index);
        self.next = node.next;

        Some(&node.area)
    }
}

impl<T> Default for AreaList<T> {
    fn default() -> Self {
        AreaList {
            slots: Vec::new(),
            vacant: None,
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<'list, T> IntoIterator for &'list AreaList<T> {
    type Item = &'list Area<T>;
    type IntoIter = AreaIter<'list, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> fmt::Display for AreaList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AreaList(")?;
        let mut start = true;
        for area in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(
                f,
                "Area({:#x}, {:#x}, {:?})",
                area.base_offset, area.size, area.state
            )?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in an
/// area list.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of areas overlapping the area before them.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of holes between consecutive areas.
    pub gaps: usize,
    /// Number of areas that do not start after their previous.
    pub out_of_orders: usize,
    /// Number of free areas directly after another free area. These should
    /// have been merged.
    pub adjacent_available: usize,
    /// Number of in-use areas whose offset breaks their alignment, or falls
    /// outside the area.
    pub misaligned: usize,
    /// Number of `prev` links that don't point back to the previous area.
    pub broken_links: usize,
    /// Number of list ends that don't line up with the pool.
    pub bad_bounds: usize,
    /// Whether the allocator's running count of free areas disagrees with
    /// the list.
    pub available_mismatch: bool,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.gaps == 0
            && self.out_of_orders == 0
            && self.adjacent_available == 0
            && self.misaligned == 0
            && self.broken_links == 0
            && self.bad_bounds == 0
            && !self.available_mismatch
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of areas in the list.
    pub length: usize,
    /// Number of free areas.
    pub available: usize,
    /// Bytes in free areas.
    pub available_size: usize,
    /// Bytes in in-use areas.
    pub used_size: usize,
    /// The largest single free area.
    pub largest_available: usize,
}

impl<T> AreaList<T> {
    pub fn iter(&self) -> AreaIter<'_, T> {
        AreaIter {
            list: self,
            next: self.head,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn head(&self) -> Option<usize> {
        self.head
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub(crate) fn next(&self, index: usize) -> Option<usize> {
        self.node(index).next
    }

    pub(crate) fn prev(&self, index: usize) -> Option<usize> {
        self.node(index).prev
    }

    fn node(&self, index: usize) -> &Node<T> {
        match &self.slots[index].entry {
            Entry::Occupied(node) => node,
            Entry::Vacant { .. } => panic!("Area slot {} is vacant", index),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        match &mut self.slots[index].entry {
            Entry::Occupied(node) => node,
            Entry::Vacant { .. } => panic!("Area slot {} is vacant", index),
        }
    }

    pub(crate) fn get(&self, index: usize) -> &Area<T> {
        &self.node(index).area
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Area<T> {
        &mut self.node_mut(index).area
    }

    /// The current handle for the area at `index`.
    pub(crate) fn id(&self, index: usize) -> AreaId {
        AreaId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Find the slot an area handle refers to, if the handle is still good.
    pub(crate) fn resolve(&self, id: AreaId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        match slot.entry {
            Entry::Occupied(_) if slot.generation == id.generation => Some(id.index),
            _ => None,
        }
    }

    /// Invalidate every handle to the area at `index`.
    pub(crate) fn retire(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
    }

    /// Make sure the next insertion can't fail.
    pub(crate) fn reserve(&mut self) -> Result<(), AllocError> {
        if self.vacant.is_some() {
            return Ok(());
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| AllocError::AllocationFailure)
    }

    fn claim(&mut self, node: Node<T>) -> usize {
        self.len += 1;
        match self.vacant {
            Some(index) => {
                let slot = &mut self.slots[index];
                self.vacant = match slot.entry {
                    Entry::Vacant { next_vacant } => next_vacant,
                    Entry::Occupied(_) => panic!("Occupied slot {} on the vacant chain", index),
                };
                slot.entry = Entry::Occupied(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Entry::Occupied(node),
                });
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize) -> Area<T> {
        self.retire(index);
        let slot = &mut self.slots[index];
        let entry = core::mem::replace(
            &mut slot.entry,
            Entry::Vacant {
                next_vacant: self.vacant,
            },
        );
        self.vacant = Some(index);
        self.len -= 1;

        match entry {
            Entry::Occupied(node) => node.area,
            Entry::Vacant { .. } => panic!("Area slot {} released twice", index),
        }
    }

    /// Append an area to the end of the list.
    pub(crate) fn push_back(&mut self, area: Area<T>) -> usize {
        let prev = self.tail;
        let index = self.claim(Node {
            area,
            prev,
            next: None,
        });

        match prev {
            Some(p) => self.node_mut(p).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        index
    }

    /// Link a new area in directly before the one at `index`.
    pub(crate) fn insert_before(&mut self, index: usize, area: Area<T>) -> usize {
        let prev = self.node(index).prev;
        let new_index = self.claim(Node {
            area,
            prev,
            next: Some(index),
        });

        match prev {
            Some(p) => self.node_mut(p).next = Some(new_index),
            None => self.head = Some(new_index),
        }
        self.node_mut(index).prev = Some(new_index);
        new_index
    }

    /// Merge the area after `index` into it, and return what's left of the
    /// absorbed area.
    ///
    /// Panics if there is no next area. The two must be adjacent.
    pub(crate) fn merge_next(&mut self, index: usize) -> Area<T> {
        let next = self.node(index).next.expect("No area to merge with");
        let (next_size, next_next) = {
            let node = self.node(next);
            debug_assert_eq!(self.get(index).end(), node.area.base_offset);
            (node.area.size, node.next)
        };

        let node = self.node_mut(index);
        node.area.size += next_size;
        node.next = next_next;
        match next_next {
            Some(n) => self.node_mut(n).prev = Some(index),
            None => self.tail = Some(index),
        }

        self.release(next)
    }

    /// Drop every area, invalidating all handles. Slots are kept for reuse.
    pub(crate) fn clear(&mut self) {
        let mut vacant = None;
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if let Entry::Occupied(_) = slot.entry {
                slot.generation = slot.generation.wrapping_add(1);
            }
            slot.entry = Entry::Vacant {
                next_vacant: vacant,
            };
            vacant = Some(index);
        }
        self.vacant = vacant;
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Check the current shape of the list, and whether its valid.
    ///
    /// This only covers what can be checked from the list alone; the
    /// allocator adds the pool bounds and its own bookkeeping.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<(usize, &Area<T>)> = None;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let node = self.node(index);
            let area = &node.area;

            if node.prev != previous.map(|(i, _)| i) {
                validity.broken_links += 1;
            }

            match previous.map(|(_, p)| relation(p, area)) {
                Some(Relation::Before) => {
                    // Right order, but something is missing in between.
                    validity.gaps += 1;
                }
                Some(Relation::AdjacentBefore) => {
                    // This is valid, do nothing.
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) | Some(Relation::After) => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
                None => {
                    // This is the first in the list. Valid, do nothing.
                }
            }

            if area.state.is_available() {
                if let Some((_, p)) = previous {
                    if p.state.is_available() {
                        validity.adjacent_available += 1;
                    }
                }
                stats.available += 1;
                stats.available_size += area.size;
                stats.largest_available = stats.largest_available.max(area.size);
            } else {
                let misaligned = area.align == 0
                    || area.offset % area.align != 0
                    || area.offset < area.base_offset
                    || area.offset >= area.end();
                if misaligned {
                    validity.misaligned += 1;
                }
                stats.used_size += area.size;
            }

            stats.length += 1;
            previous = Some((index, area));
            cursor = node.next;
        }

        if self.tail != previous.map(|(i, _)| i) {
            validity.broken_links += 1;
        }

        (validity, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::area::AreaState;

    fn used(base: usize, size: usize) -> Area<()> {
        let mut area = Area::available(base, size);
        area.occupy(false, None, (), 1, 1);
        area
    }

    #[test]
    fn test_push_and_insert() {
        let mut list = AreaList::default();
        let high = list.push_back(used(64, 64));
        let low = list.insert_before(high, Area::available(0, 64));
        let top = list.push_back(used(128, 32));

        assert_eq!(list.len(), 3);
        assert_eq!(list.head(), Some(low));
        assert_eq!(list.tail(), Some(top));
        assert_eq!(list.next(low), Some(high));
        assert_eq!(list.prev(high), Some(low));

        let offsets: Vec<usize> = list.iter().map(|a| a.base_offset()).collect();
        assert_eq!(offsets, vec![0, 64, 128]);

        let (validity, stats) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.length, 3);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.available_size, 64);
        assert_eq!(stats.used_size, 96);
        log::info!("{}", list);
    }

    #[test]
    fn test_merge_reuses_slots() {
        let mut list = AreaList::default();
        let first = list.push_back(Area::<()>::available(0, 16));
        let second = list.push_back(Area::available(16, 48));
        let stale = list.id(second);

        let absorbed = list.merge_next(first);
        assert_eq!(absorbed.size(), 48);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(first).size(), 64);
        assert_eq!(list.tail(), Some(first));
        assert!(list.resolve(stale).is_none());

        // The absorbed slot is handed out again.
        list.reserve().unwrap();
        let reused = list.insert_before(first, Area::available(0, 0));
        assert_eq!(reused, second);
        assert_ne!(list.id(reused), stale);
    }

    #[test]
    fn test_stats_finds_corruption() {
        let mut list = AreaList::default();
        list.push_back(Area::<()>::available(0, 16));
        list.push_back(Area::available(16, 16));
        list.push_back(used(40, 16));
        let overlapping = list.push_back(used(50, 16));
        list.get_mut(overlapping).offset = 51;
        list.get_mut(overlapping).align = 2;

        let (validity, _stats) = list.stats();
        assert_eq!(validity.adjacent_available, 1);
        assert_eq!(validity.gaps, 1);
        assert_eq!(validity.overlaps, 1);
        assert_eq!(validity.misaligned, 1);
        assert!(!validity.is_valid());
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let mut list = AreaList::default();
        let index = list.push_back(used(0, 128));
        let id = list.id(index);
        assert_eq!(list.resolve(id), Some(index));
        assert_eq!(list.get(index).state(), AreaState::Removable);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert!(list.resolve(id).is_none());

        let again = list.push_back(Area::available(0, 128));
        assert_eq!(again, index);
        assert_ne!(list.id(again), id);
    }
}
