use spin::{Mutex, MutexGuard};

use crate::area::{AreaId, SaveBox};
use crate::arealist::{Stats, Validity};
use crate::error::AllocError;
use crate::offscreen::{OffscreenAllocator, PoolDescriptor};

/// An `OffscreenAllocator` behind a spin lock, for when more than one thread
/// needs to get at the same pool.
///
/// Each call takes the lock for its whole duration, save callbacks included.
/// A save callback that touches the same `SharedOffscreen` will spin forever.
pub struct SharedOffscreen<T = ()> {
    inner: Mutex<OffscreenAllocator<T>>,
}

impl<T> From<OffscreenAllocator<T>> for SharedOffscreen<T> {
    fn from(allocator: OffscreenAllocator<T>) -> Self {
        SharedOffscreen {
            inner: Mutex::new(allocator),
        }
    }
}

impl<T> SharedOffscreen<T> {
    pub fn new(pool: PoolDescriptor) -> Result<Self, AllocError> {
        Ok(OffscreenAllocator::init(pool)?.into())
    }

    /// Get a reference to the underlying allocator.
    ///
    /// Every other caller blocks while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, OffscreenAllocator<T>> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> OffscreenAllocator<T> {
        self.inner.into_inner()
    }

    pub fn alloc(
        &self,
        size: usize,
        align: usize,
        locked: bool,
        save: Option<SaveBox<T>>,
        owner_data: T,
    ) -> Result<AreaId, AllocError> {
        self.lock().alloc(size, align, locked, save, owner_data)
    }

    pub fn free(&self, id: AreaId) -> Result<AreaId, AllocError> {
        self.lock().free(id)
    }

    pub fn swap_out(&self) {
        self.lock().swap_out()
    }

    pub fn swap_in(&self) {
        self.lock().swap_in()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.lock().stats()
    }
}
