use crate::PAGE_SIZE;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// A half-open range of page indices `[first, outer)` inside a region.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRange {
    /// First page of the range.
    pub first: u64,
    /// One past the last page of the range.
    pub outer: u64,
}

impl PageRange {
    /// Number of pages in the range.
    pub fn len(&self) -> u64 {
        self.outer - self.first
    }

    /// Whether the range has no page.
    pub fn is_empty(&self) -> bool {
        self.outer <= self.first
    }
}

/// A virtual memory region owning pages that devices access through DMA.
///
/// The region lock serializes every chunk and reverse index mutation touching its pages.
pub trait VaRegion: Send + Sync {
    /// First virtual address of the region.
    fn start(&self) -> u64;

    /// Size of the region in bytes.
    fn size(&self) -> u64;

    /// Whether the region lock is currently held.
    fn is_locked(&self) -> bool;

    /// Whether the region was destroyed.
    fn is_dead(&self) -> bool;

    /// Whether `address` falls inside the region.
    fn contains(&self, address: u64) -> bool {
        address >= self.start() && address - self.start() < self.size()
    }

    /// Index of the page holding `address`.
    fn page_index_of(&self, address: u64) -> u64 {
        assert!(
            self.contains(address),
            "Address {address:#x} outside of region {:#x}+{:#x}",
            self.start(),
            self.size()
        );
        (address - self.start()) / PAGE_SIZE
    }
}

/// A [VaRegion] whose lock is a plain mutex.
#[derive(Debug)]
pub struct ManagedRegion {
    start: u64,
    size: u64,
    lock: Mutex<()>,
    locked: AtomicBool,
    dead: AtomicBool,
}

/// Scoped acquisition of a [ManagedRegion] lock.
pub struct RegionGuard<'a> {
    region: &'a ManagedRegion,
    _guard: MutexGuard<'a, ()>,
}

impl ManagedRegion {
    /// Create a region of `size` bytes at `start`, both page aligned.
    pub fn new(start: u64, size: u64) -> Self {
        assert!(
            start % PAGE_SIZE == 0 && size % PAGE_SIZE == 0 && size > 0,
            "Region {start:#x}+{size:#x} isn't page aligned"
        );
        Self {
            start,
            size,
            lock: Mutex::new(()),
            locked: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        }
    }

    /// Acquire the region lock until the guard is dropped.
    pub fn lock(&self) -> RegionGuard<'_> {
        let guard = self.lock.lock().unwrap_or_else(|poison| poison.into_inner());
        self.locked.store(true, Ordering::Release);

        RegionGuard {
            region: self,
            _guard: guard,
        }
    }

    /// Mark the region destroyed.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.locked.store(false, Ordering::Release);
    }
}

impl VaRegion for ManagedRegion {
    fn start(&self) -> u64 {
        self.start
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let region = ManagedRegion::new(0x20_0000, 16 * PAGE_SIZE);

        {
            let _guard = region.lock();
            assert!(region.is_locked());
        }

        assert!(!region.is_locked());
    }

    #[test]
    fn page_index_is_relative_to_start() {
        let region = ManagedRegion::new(0x20_0000, 16 * PAGE_SIZE);

        assert!(region.contains(0x20_0000 + 15 * PAGE_SIZE));
        assert!(!region.contains(0x20_0000 + 16 * PAGE_SIZE));
        assert_eq!(region.page_index_of(0x20_3000), 3);
    }
}
