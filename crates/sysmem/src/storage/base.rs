use crate::error::SysmemError;
use sysmem_common::device::DeviceId;

crate::unique_id_type!(PageId);

/// A naturally aligned run of host pages handed out by a [host storage](HostStorage).
///
/// Large allocations behave like compound pages: the dirty flag covers the whole run.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPage {
    /// Storage id of the allocation.
    pub id: PageId,
    /// Host address of the first byte.
    pub address: u64,
    /// Size of the allocation in bytes.
    pub size: u64,
}

/// Flags accepted by [HostStorage::alloc_pages].
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocFlags {
    /// Zero-fill the pages.
    pub zeroed: bool,
    /// Preferred NUMA node.
    pub numa_node: Option<u32>,
    /// Fail rather than fall back when the preferred node has no memory.
    pub strict_node: bool,
    /// Allow the allocator to hand out movable pages.
    pub movable: bool,
    /// Don't compact memory to satisfy a large request.
    pub no_retry: bool,
}

impl AllocFlags {
    /// Request zero-filled pages.
    pub fn zeroed(mut self) -> Self {
        self.zeroed = true;
        self
    }

    /// Request pages on the given NUMA node, failing if `strict` and the node can't satisfy it.
    pub fn on_node(mut self, node: u32, strict: bool) -> Self {
        self.numa_node = Some(node);
        self.strict_node = strict;
        self
    }

    /// Allow movable pages.
    pub fn movable(mut self) -> Self {
        self.movable = true;
        self
    }
}

/// The host page allocator.
///
/// Implementations must be usable from any thread, every method takes `&self`.
pub trait HostStorage: Send + Sync {
    /// Allocate `size` bytes of naturally aligned pages.
    fn alloc_pages(&self, size: u64, flags: AllocFlags) -> Result<HostPage, SysmemError>;

    /// Return pages to the allocator.
    fn free_pages(&self, page: HostPage);

    /// Set the page dirty flag.
    fn set_page_dirty(&self, page: &HostPage);

    /// Clear the page dirty flag.
    fn clear_page_dirty(&self, page: &HostPage);

    /// Clear the page dirty flag, returning whether it was set.
    fn test_and_clear_page_dirty(&self, page: &HostPage) -> bool;

    /// Whether the page dirty flag is set.
    fn is_page_dirty(&self, page: &HostPage) -> bool;
}

/// A host storage whose pages can be made visible to devices.
pub trait DmaStorage: HostStorage {
    /// Map the whole allocation into the DMA address space of `device`, returning the bus address.
    ///
    /// Fails with [SysmemError::OperatingSystem] when the platform rejects the mapping.
    fn dma_map(&self, device: DeviceId, page: &HostPage) -> Result<u64, SysmemError>;

    /// Tear down a mapping created by [DmaStorage::dma_map].
    fn dma_unmap(&self, device: DeviceId, page: &HostPage, dma_addr: u64);
}
