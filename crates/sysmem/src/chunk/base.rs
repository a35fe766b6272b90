use super::{dirty::DirtyBitmap, mapping::MappingTable};
use crate::{
    PAGE_SIZE,
    error::SysmemError,
    storage::{AllocFlags, DmaStorage, HostPage},
};
use alloc::{format, sync::Arc, vec::Vec};
use smallvec::SmallVec;
use std::sync::{Mutex, MutexGuard};
use sysmem_common::device::{DeviceId, SubContextMask};

crate::unique_id_type!(ChunkId);

/// How a chunk relates to its backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Backed by pages allocated from the host storage.
    Physical,
    /// A sub-range of a split chunk.
    Logical,
    /// Backed by pages someone else allocated and frees.
    ExternallyOwned,
}

/// A handle to a chunk of host memory.
///
/// Cloning the handle retains the chunk, dropping it releases it. A logical chunk retains its
/// parent, so a physical chunk's pages outlive every chunk split from it.
#[derive(Clone)]
pub struct CpuChunk {
    pub(crate) inner: Arc<ChunkInner>,
}

pub(crate) struct ChunkInner {
    pub(crate) id: ChunkId,
    pub(crate) size: u64,
    pub(crate) node: ChunkNode,
    pub(crate) split: Mutex<Option<SplitRecord>>,
}

pub(crate) enum ChunkNode {
    Physical(PhysicalChunk),
    Logical(LogicalChunk),
}

pub(crate) struct PhysicalChunk {
    pub(crate) page: HostPage,
    pub(crate) owned: bool,
    pub(crate) storage: Arc<dyn DmaStorage>,
    state: Mutex<PhysicalState>,
}

/// State shared by a physical chunk and all of its logical descendants.
pub(crate) struct PhysicalState {
    pub(crate) mappings: MappingTable,
    /// Per page dirty bits, absent for single page chunks.
    pub(crate) dirty: Option<DirtyBitmap>,
}

pub(crate) struct LogicalChunk {
    pub(crate) parent: CpuChunk,
    pub(crate) index: u32,
    /// Offset in pages from the start of the physical chunk.
    pub(crate) page_offset: u64,
    /// Devices this chunk holds a mapping reference for, sorted.
    pub(crate) mapped: spin::Mutex<SmallVec<[DeviceId; 2]>>,
}

/// Records how a chunk was split.
#[derive(Debug, Clone)]
pub(crate) struct SplitRecord {
    pub(crate) child_size: u64,
    /// Children not yet destroyed, the record is cleared when the last one goes.
    pub(crate) live_children: u32,
    /// Sub-contexts that held the physical chunk before it was split.
    pub(crate) sub_contexts: SmallVec<[(DeviceId, SubContextMask); 1]>,
}

impl core::fmt::Debug for CpuChunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuChunk")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("size", &self.inner.size)
            .field("page_offset", &self.page_offset())
            .finish()
    }
}

impl CpuChunk {
    /// Allocate a physical chunk of `size` bytes.
    ///
    /// Zeroed pages start dirty.
    pub(crate) fn alloc(
        storage: Arc<dyn DmaStorage>,
        size: u64,
        flags: AllocFlags,
    ) -> Result<Self, SysmemError> {
        let page = storage.alloc_pages(size, flags)?;

        if flags.zeroed {
            storage.set_page_dirty(&page);
        }

        Ok(Self::physical_from(storage, page, true))
    }

    /// Wrap pages allocated outside of the host storage.
    pub(crate) fn external(storage: Arc<dyn DmaStorage>, page: HostPage) -> Self {
        Self::physical_from(storage, page, false)
    }

    fn physical_from(storage: Arc<dyn DmaStorage>, page: HostPage, owned: bool) -> Self {
        let num_pages = page.size / PAGE_SIZE;
        let dirty = (num_pages > 1).then(|| DirtyBitmap::new(num_pages as usize));

        Self::from_node(
            page.size,
            ChunkNode::Physical(PhysicalChunk {
                page,
                owned,
                storage,
                state: Mutex::new(PhysicalState {
                    mappings: MappingTable::default(),
                    dirty,
                }),
            }),
        )
    }

    /// Create the `index`-th child of `parent` of `size` bytes.
    pub(crate) fn logical(parent: &CpuChunk, index: u32, size: u64) -> Self {
        let page_offset = parent.page_offset() + index as u64 * size / PAGE_SIZE;

        Self::from_node(
            size,
            ChunkNode::Logical(LogicalChunk {
                parent: parent.clone(),
                index,
                page_offset,
                mapped: spin::Mutex::new(SmallVec::new()),
            }),
        )
    }

    fn from_node(size: u64, node: ChunkNode) -> Self {
        Self {
            inner: Arc::new(ChunkInner {
                id: ChunkId::new(),
                size,
                node,
                split: Mutex::new(None),
            }),
        }
    }

    /// Unique id of the chunk.
    pub fn id(&self) -> ChunkId {
        self.inner.id
    }

    /// Size of the chunk in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Number of pages in the chunk.
    pub fn num_pages(&self) -> u64 {
        self.inner.size / PAGE_SIZE
    }

    /// How the chunk is backed.
    pub fn kind(&self) -> ChunkKind {
        match &self.inner.node {
            ChunkNode::Physical(physical) if physical.owned => ChunkKind::Physical,
            ChunkNode::Physical(_) => ChunkKind::ExternallyOwned,
            ChunkNode::Logical(_) => ChunkKind::Logical,
        }
    }

    /// The chunk this chunk was split from.
    pub fn parent(&self) -> Option<&CpuChunk> {
        match &self.inner.node {
            ChunkNode::Logical(logical) => Some(&logical.parent),
            ChunkNode::Physical(_) => None,
        }
    }

    /// Position of the chunk among its siblings.
    pub fn child_index(&self) -> Option<u32> {
        match &self.inner.node {
            ChunkNode::Logical(logical) => Some(logical.index),
            ChunkNode::Physical(_) => None,
        }
    }

    /// Offset in pages from the start of the physical chunk.
    pub fn page_offset(&self) -> u64 {
        match &self.inner.node {
            ChunkNode::Logical(logical) => logical.page_offset,
            ChunkNode::Physical(_) => 0,
        }
    }

    /// The backing pages of the physical chunk.
    pub fn host_page(&self) -> HostPage {
        self.physical().page
    }

    /// Host address of page `page_index` of the chunk.
    pub fn host_address(&self, page_index: u64) -> u64 {
        self.assert_page_index(page_index);
        self.physical().page.address + (self.page_offset() + page_index) * PAGE_SIZE
    }

    /// Whether the chunk currently has live children.
    pub fn is_split(&self) -> bool {
        self.split_record().is_some()
    }

    /// Size of the children while the chunk is split.
    pub fn split_size(&self) -> Option<u64> {
        self.split_record().map(|record| record.child_size)
    }

    /// Devices a logical chunk holds mapping references for.
    pub fn mapped_devices(&self) -> Vec<DeviceId> {
        match &self.inner.node {
            ChunkNode::Logical(logical) => logical.mapped.lock().to_vec(),
            ChunkNode::Physical(_) => Vec::new(),
        }
    }

    /// Number of handles retaining the chunk, children included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles refer to the same chunk.
    pub fn ptr_eq(&self, other: &CpuChunk) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The physical chunk at the root of the split hierarchy.
    pub(crate) fn physical(&self) -> &PhysicalChunk {
        let mut chunk = self;
        loop {
            match &chunk.inner.node {
                ChunkNode::Physical(physical) => return physical,
                ChunkNode::Logical(logical) => chunk = &logical.parent,
            }
        }
    }

    pub(crate) fn split_record(&self) -> Option<SplitRecord> {
        self.inner
            .split
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub(crate) fn set_split_record(&self, record: Option<SplitRecord>) {
        *self
            .inner
            .split
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = record;
    }

    // A child of this chunk was destroyed without being merged.
    fn release_child(&self) {
        let mut split = self
            .inner
            .split
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());

        let Some(record) = split.as_mut() else {
            return;
        };

        assert!(record.live_children > 0, "Chunk {} has no live child", self.id());
        record.live_children -= 1;

        if record.live_children == 0 {
            log::debug!("Every child of chunk {} was released, it is no longer split", self.id());
            *split = None;
        }
    }

    pub(crate) fn assert_not_split(&self, operation: &str) -> Result<(), SysmemError> {
        match self.is_split() {
            true => Err(SysmemError::invalid_argument(format!(
                "Can't {operation} chunk {} while it is split",
                self.id()
            ))),
            false => Ok(()),
        }
    }

    pub(crate) fn assert_page_index(&self, page_index: u64) {
        assert!(
            page_index < self.num_pages(),
            "Page {page_index} out of range for a chunk of {} pages",
            self.num_pages()
        );
    }
}

impl PhysicalChunk {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PhysicalState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for ChunkInner {
    fn drop(&mut self) {
        match &mut self.node {
            ChunkNode::Logical(logical) => {
                let devices = core::mem::take(logical.mapped.get_mut());

                if !devices.is_empty() {
                    let root = logical.parent.physical();
                    let mut state = root.lock_state();

                    for device in devices {
                        root.release_holder(&mut state, device);
                    }
                }

                logical.parent.release_child();
            }
            ChunkNode::Physical(physical) => {
                let state = physical
                    .state
                    .get_mut()
                    .unwrap_or_else(|poison| poison.into_inner());

                if !state.mappings.is_empty() {
                    log::warn!(
                        "Chunk {} released with {} live DMA mappings",
                        self.id,
                        state.mappings.len()
                    );
                    for mapping in state.mappings.drain() {
                        physical
                            .storage
                            .dma_unmap(mapping.device, &physical.page, mapping.dma_addr);
                    }
                }

                if state.dirty.as_ref().is_some_and(|dirty| dirty.any()) {
                    physical.storage.set_page_dirty(&physical.page);
                }

                if physical.owned {
                    physical.storage.free_pages(physical.page);
                }

                log::trace!("Released chunk {} of {} bytes", self.id, self.size);
            }
        }
    }
}
