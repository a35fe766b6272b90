//! A simulated host storage backed by heap allocations.
//!
//! Pages are real, naturally aligned heap memory. DMA mappings are simulated with a per-device
//! IOVA window handing out bus addresses. It is only intended for testing.
use super::{AllocFlags, DmaStorage, HostPage, HostStorage, PageId};
use crate::error::SysmemError;
use alloc::alloc::{Layout, alloc, alloc_zeroed, dealloc};
use alloc::format;
use hashbrown::HashMap;
use std::sync::{Mutex, MutexGuard};
use sysmem_common::device::DeviceId;

const IOVA_BASE: u64 = 0x10_0000_0000;

struct BytesPage {
    ptr: *mut u8,
    layout: Layout,
    dirty: bool,
}

struct IovaWindow {
    next: u64,
    limit: u64,
    // Bus address to the page it maps.
    mappings: HashMap<u64, PageId>,
}

impl IovaWindow {
    fn new(limit: u64) -> Self {
        Self {
            next: IOVA_BASE,
            limit,
            mappings: HashMap::new(),
        }
    }

    fn map(&mut self, page: &HostPage) -> Option<u64> {
        let dma_addr = self.next.next_multiple_of(page.size);
        let end = dma_addr.checked_add(page.size)?;

        if end > IOVA_BASE + self.limit {
            return None;
        }

        self.next = end;
        self.mappings.insert(dma_addr, page.id);
        Some(dma_addr)
    }
}

#[derive(Default)]
struct BytesState {
    pages: HashMap<PageId, BytesPage>,
    windows: HashMap<DeviceId, IovaWindow>,
    fail_next_alloc: bool,
    fail_next_dma_map: bool,
}

/// Heap backed [DmaStorage].
pub struct BytesHostStorage {
    state: Mutex<BytesState>,
    numa_nodes: u32,
    max_page_size: Option<u64>,
    iova_window: u64,
}

// Page pointers are only dereferenced by the owner of the page.
unsafe impl Send for BytesHostStorage {}
unsafe impl Sync for BytesHostStorage {}

impl Default for BytesHostStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BytesHostStorage {
    /// A storage with one NUMA node and a 1 TiB IOVA window per device.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BytesState::default()),
            numa_nodes: 1,
            max_page_size: None,
            iova_window: 1 << 40,
        }
    }

    /// Simulate a host with `numa_nodes` nodes.
    pub fn with_numa_nodes(mut self, numa_nodes: u32) -> Self {
        self.numa_nodes = numa_nodes;
        self
    }

    /// Simulate fragmentation: allocations larger than `size` always fail.
    pub fn with_max_page_size(mut self, size: u64) -> Self {
        self.max_page_size = Some(size);
        self
    }

    /// Limit the IOVA window of every device to `size` bytes.
    pub fn with_iova_window(mut self, size: u64) -> Self {
        self.iova_window = size;
        self
    }

    /// Make the next page allocation fail.
    pub fn fail_next_alloc(&self) {
        self.state().fail_next_alloc = true;
    }

    /// Make the next DMA map fail.
    pub fn fail_next_dma_map(&self) {
        self.state().fail_next_dma_map = true;
    }

    /// Number of allocations not yet freed.
    pub fn live_pages(&self) -> usize {
        self.state().pages.len()
    }

    /// Number of live DMA mappings on `device`.
    pub fn live_dma_mappings(&self, device: DeviceId) -> usize {
        self.state()
            .windows
            .get(&device)
            .map(|window| window.mappings.len())
            .unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, BytesState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for BytesHostStorage {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poison| poison.into_inner());

        if !state.pages.is_empty() {
            log::warn!("Host storage dropped with {} live allocations", state.pages.len());
        }

        for (_, bytes) in state.pages.drain() {
            // SAFETY: the pointer was returned by `alloc` with the same layout and the storage
            // is gone, so no page can be used anymore.
            unsafe { dealloc(bytes.ptr, bytes.layout) };
        }
    }
}

impl HostStorage for BytesHostStorage {
    fn alloc_pages(&self, size: u64, flags: AllocFlags) -> Result<HostPage, SysmemError> {
        let mut state = self.state();

        if core::mem::take(&mut state.fail_next_alloc) {
            return Err(SysmemError::out_of_memory(format!(
                "Injected failure allocating {size} bytes"
            )));
        }

        if let Some(node) = flags.numa_node
            && node >= self.numa_nodes
            && flags.strict_node
        {
            return Err(SysmemError::out_of_memory(format!(
                "NUMA node {node} has no memory"
            )));
        }

        if self.max_page_size.is_some_and(|max| size > max) {
            return Err(SysmemError::out_of_memory(format!(
                "No contiguous run of {size} bytes available"
            )));
        }

        let layout = Layout::from_size_align(size as usize, size as usize)
            .map_err(|_| SysmemError::invalid_argument(format!("Invalid page size {size}")))?;

        // SAFETY: layout has a non-zero size, every page size is at least one page.
        let ptr = unsafe {
            match flags.zeroed {
                true => alloc_zeroed(layout),
                false => alloc(layout),
            }
        };

        if ptr.is_null() {
            return Err(SysmemError::out_of_memory(format!(
                "Heap allocation of {size} bytes failed"
            )));
        }

        let page = HostPage::new(PageId::new(), ptr as u64, size);
        state.pages.insert(
            page.id,
            BytesPage {
                ptr,
                layout,
                dirty: false,
            },
        );

        Ok(page)
    }

    fn free_pages(&self, page: HostPage) {
        let mut state = self.state();

        for window in state.windows.values() {
            assert!(
                !window.mappings.values().any(|id| *id == page.id),
                "Freeing {:?} while it is still DMA mapped",
                page.id
            );
        }

        if let Some(bytes) = state.pages.remove(&page.id) {
            // SAFETY: the pointer was returned by `alloc` with the same layout.
            unsafe { dealloc(bytes.ptr, bytes.layout) };
        }
    }

    fn set_page_dirty(&self, page: &HostPage) {
        if let Some(bytes) = self.state().pages.get_mut(&page.id) {
            bytes.dirty = true;
        }
    }

    fn clear_page_dirty(&self, page: &HostPage) {
        if let Some(bytes) = self.state().pages.get_mut(&page.id) {
            bytes.dirty = false;
        }
    }

    fn test_and_clear_page_dirty(&self, page: &HostPage) -> bool {
        self.state()
            .pages
            .get_mut(&page.id)
            .map(|bytes| core::mem::take(&mut bytes.dirty))
            .unwrap_or(false)
    }

    fn is_page_dirty(&self, page: &HostPage) -> bool {
        self.state()
            .pages
            .get(&page.id)
            .map(|bytes| bytes.dirty)
            .unwrap_or(false)
    }
}

impl DmaStorage for BytesHostStorage {
    fn dma_map(&self, device: DeviceId, page: &HostPage) -> Result<u64, SysmemError> {
        let mut state = self.state();

        if core::mem::take(&mut state.fail_next_dma_map) {
            return Err(SysmemError::operating_system(format!(
                "Injected DMA map failure on {device}"
            )));
        }

        let limit = self.iova_window;
        state
            .windows
            .entry(device)
            .or_insert_with(|| IovaWindow::new(limit))
            .map(page)
            .ok_or_else(|| {
                SysmemError::operating_system(format!(
                    "{} bytes at {:#x} fall outside the DMA window of {device}",
                    page.size, page.address
                ))
            })
    }

    fn dma_unmap(&self, device: DeviceId, page: &HostPage, dma_addr: u64) {
        let mut state = self.state();
        let removed = state
            .windows
            .get_mut(&device)
            .and_then(|window| window.mappings.remove(&dma_addr));

        assert_eq!(
            removed,
            Some(page.id),
            "DMA address {dma_addr:#x} isn't a mapping of {:?} on {device}",
            page.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_naturally_aligned() {
        let storage = BytesHostStorage::new();
        let page = storage
            .alloc_pages(64 * 1024, AllocFlags::default().zeroed())
            .unwrap();

        assert_eq!(page.address % (64 * 1024), 0);
        assert_eq!(storage.live_pages(), 1);

        storage.free_pages(page);
        assert_eq!(storage.live_pages(), 0);
    }

    #[test]
    fn strict_node_fails_instead_of_falling_back() {
        let storage = BytesHostStorage::new().with_numa_nodes(2);

        let err = storage
            .alloc_pages(4096, AllocFlags::default().on_node(3, true))
            .unwrap_err();
        assert!(err.is_out_of_memory());

        let page = storage
            .alloc_pages(4096, AllocFlags::default().on_node(3, false))
            .unwrap();
        storage.free_pages(page);
    }

    #[test]
    fn dma_window_limit_is_an_os_error() {
        let storage = BytesHostStorage::new().with_iova_window(8192);
        let device = DeviceId::new(0);
        let first = storage.alloc_pages(4096, AllocFlags::default()).unwrap();
        let second = storage.alloc_pages(8192, AllocFlags::default()).unwrap();

        let dma_addr = storage.dma_map(device, &first).unwrap();
        let err = storage.dma_map(device, &second).unwrap_err();
        assert!(matches!(err, SysmemError::OperatingSystem { .. }));

        storage.dma_unmap(device, &first, dma_addr);
        assert_eq!(storage.live_dma_mappings(device), 0);
        storage.free_pages(first);
        storage.free_pages(second);
    }

    #[test]
    fn dropping_the_storage_releases_leftover_pages() {
        let storage = BytesHostStorage::new();
        storage.alloc_pages(4096, AllocFlags::default()).unwrap();
        storage.alloc_pages(64 * 1024, AllocFlags::default()).unwrap();
        assert_eq!(storage.live_pages(), 2);

        drop(storage);
    }

    #[test]
    fn dirty_flag_is_test_and_clear() {
        let storage = BytesHostStorage::new();
        let page = storage.alloc_pages(4096, AllocFlags::default()).unwrap();

        storage.set_page_dirty(&page);
        assert!(storage.is_page_dirty(&page));
        assert!(storage.test_and_clear_page_dirty(&page));
        assert!(!storage.test_and_clear_page_dirty(&page));

        storage.free_pages(page);
    }
}
