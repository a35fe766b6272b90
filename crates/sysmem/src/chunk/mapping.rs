use super::base::{ChunkNode, CpuChunk, PhysicalChunk, PhysicalState};
use crate::{PAGE_SIZE, error::SysmemError};
use alloc::format;
use smallvec::SmallVec;
use sysmem_common::device::{DeviceContext, DeviceId, SubContextMask};

/// The DMA mapping of a physical chunk for one device.
#[derive(Debug, Clone)]
pub(crate) struct DmaMapping {
    pub(crate) device: DeviceId,
    /// Bus address of the first page of the physical chunk.
    pub(crate) dma_addr: u64,
    /// Logical holders plus the sub-contexts in `sub_contexts`.
    pub(crate) use_count: u32,
    /// Sub-contexts using the physical chunk directly.
    pub(crate) sub_contexts: SubContextMask,
}

/// Per physical chunk DMA mappings, sorted by device.
///
/// The common case is a single device, which lives inline.
#[derive(Debug, Default)]
pub(crate) struct MappingTable {
    entries: SmallVec<[DmaMapping; 1]>,
}

impl MappingTable {
    pub(crate) fn get(&self, device: DeviceId) -> Option<&DmaMapping> {
        self.position(device).ok().map(|index| &self.entries[index])
    }

    pub(crate) fn get_mut(&mut self, device: DeviceId) -> Option<&mut DmaMapping> {
        self.position(device)
            .ok()
            .map(|index| &mut self.entries[index])
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut DmaMapping> {
        self.entries.iter_mut()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = DmaMapping> + '_ {
        self.entries.drain(..)
    }

    /// Insert the mapping of a device that has none yet.
    ///
    /// Growth is fallible: the table doubles its capacity once the inline slot is taken.
    fn insert(&mut self, mapping: DmaMapping) -> Result<(), SysmemError> {
        let index = match self.position(mapping.device) {
            Ok(_) => panic!("{} already has a DMA mapping", mapping.device),
            Err(index) => index,
        };

        self.entries.try_reserve(1).map_err(|err| {
            SysmemError::out_of_memory(format!("Growing the DMA mapping table failed: {err:?}"))
        })?;
        self.entries.insert(index, mapping);

        Ok(())
    }

    fn remove(&mut self, device: DeviceId) -> Option<DmaMapping> {
        self.position(device)
            .ok()
            .map(|index| self.entries.remove(index))
    }

    fn position(&self, device: DeviceId) -> Result<usize, usize> {
        self.entries
            .binary_search_by_key(&device, |mapping| mapping.device)
    }
}

/// Outcome of a mapping reference change.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MappingUpdate {
    /// Bus address of the chunk, already offset to its first page.
    pub(crate) dma_addr: u64,
    /// Use count of the device mapping after the change.
    pub(crate) use_count: u32,
    /// Whether the platform DMA mapping was created or torn down.
    pub(crate) platform_call: bool,
}

impl PhysicalChunk {
    /// Take one reference on the mapping of `device`, creating it on first use.
    ///
    /// A sub-context only counts once, repeated calls from the same sub-context are no-ops.
    /// `None` stands for a logical descendant holding the mapping.
    pub(crate) fn acquire_mapping(
        &self,
        state: &mut PhysicalState,
        device: DeviceId,
        sub_context: Option<u8>,
    ) -> Result<MappingUpdate, SysmemError> {
        if state.mappings.get(device).is_some() {
            return Ok(self.retain_mapping(state, device, sub_context));
        }

        let dma_addr = self.storage.dma_map(device, &self.page)?;
        let mut sub_contexts = SubContextMask::empty();
        if let Some(sub) = sub_context {
            sub_contexts.test_and_set(sub);
        }

        let mapping = DmaMapping {
            device,
            dma_addr,
            use_count: 1,
            sub_contexts,
        };

        if let Err(err) = state.mappings.insert(mapping) {
            self.storage.dma_unmap(device, &self.page, dma_addr);
            return Err(err);
        }

        Ok(MappingUpdate {
            dma_addr,
            use_count: 1,
            platform_call: true,
        })
    }

    /// Take one more reference on an existing mapping.
    pub(crate) fn retain_mapping(
        &self,
        state: &mut PhysicalState,
        device: DeviceId,
        sub_context: Option<u8>,
    ) -> MappingUpdate {
        let mapping = state
            .mappings
            .get_mut(device)
            .unwrap_or_else(|| panic!("{device} holds no DMA mapping to retain"));

        let newly_held = match sub_context {
            Some(sub) => !mapping.sub_contexts.test_and_set(sub),
            None => true,
        };
        if newly_held {
            mapping.use_count += 1;
        }

        MappingUpdate {
            dma_addr: mapping.dma_addr,
            use_count: mapping.use_count,
            platform_call: false,
        }
    }

    /// Drop the reference a logical descendant holds on the mapping of `device`.
    pub(crate) fn release_holder(&self, state: &mut PhysicalState, device: DeviceId) {
        if let Err(err) = self.release_mapping(state, device, None) {
            panic!("Releasing a logical holder of {device} failed: {err}");
        }
    }

    /// Drop one reference on the mapping of `device`, tearing it down at zero.
    ///
    /// Releasing a sub-context that doesn't hold the mapping is rejected without any change.
    pub(crate) fn release_mapping(
        &self,
        state: &mut PhysicalState,
        device: DeviceId,
        sub_context: Option<u8>,
    ) -> Result<MappingUpdate, SysmemError> {
        let Some(mapping) = state.mappings.get_mut(device) else {
            assert!(
                sub_context.is_some(),
                "A logical chunk holds a mapping of {device} missing from its physical chunk"
            );
            return Err(SysmemError::invalid_argument(format!(
                "{device} has no DMA mapping of this chunk"
            )));
        };

        if let Some(sub) = sub_context
            && !mapping.sub_contexts.test_and_clear(sub)
        {
            return Err(SysmemError::invalid_argument(format!(
                "Sub-context {sub} of {device} doesn't hold a DMA mapping of this chunk"
            )));
        }

        assert!(mapping.use_count > 0, "Mapping of {device} has no user");
        mapping.use_count -= 1;

        let dma_addr = mapping.dma_addr;
        let use_count = mapping.use_count;

        if use_count == 0 {
            state.mappings.remove(device);
            self.storage.dma_unmap(device, &self.page, dma_addr);
        }

        Ok(MappingUpdate {
            dma_addr,
            use_count,
            platform_call: use_count == 0,
        })
    }
}

impl CpuChunk {
    /// Make the chunk visible to `ctx`, returning the bus address of its first page.
    pub(crate) fn ensure_mapped(&self, ctx: DeviceContext) -> Result<MappingUpdate, SysmemError> {
        self.assert_not_split("map")?;

        let root = self.physical();
        let offset = self.page_offset() * PAGE_SIZE;
        let mut state = root.lock_state();

        let update = match &self.inner.node {
            ChunkNode::Physical(_) => {
                root.acquire_mapping(&mut state, ctx.device, Some(ctx.sub_context))?
            }
            ChunkNode::Logical(logical) => {
                let mut mapped = logical.mapped.lock();

                match mapped.binary_search(&ctx.device) {
                    Ok(_) => {
                        let mapping = state.mappings.get(ctx.device).unwrap_or_else(|| {
                            panic!("Logical chunk maps {} without a physical mapping", ctx.device)
                        });
                        MappingUpdate {
                            dma_addr: mapping.dma_addr,
                            use_count: mapping.use_count,
                            platform_call: false,
                        }
                    }
                    Err(index) => {
                        let update = root.acquire_mapping(&mut state, ctx.device, None)?;

                        if let Err(err) = mapped.try_reserve(1) {
                            root.release_holder(&mut state, ctx.device);
                            return Err(SysmemError::out_of_memory(format!(
                                "Growing the mapped device set failed: {err:?}"
                            )));
                        }
                        mapped.insert(index, ctx.device);
                        update
                    }
                }
            }
        };

        Ok(MappingUpdate {
            dma_addr: update.dma_addr + offset,
            ..update
        })
    }

    /// Release the mapping reference `ctx` holds through this chunk.
    pub(crate) fn unmap(&self, ctx: DeviceContext) -> Result<MappingUpdate, SysmemError> {
        let root = self.physical();
        let offset = self.page_offset() * PAGE_SIZE;
        let mut state = root.lock_state();

        let update = match &self.inner.node {
            ChunkNode::Physical(_) => {
                root.release_mapping(&mut state, ctx.device, Some(ctx.sub_context))?
            }
            ChunkNode::Logical(logical) => {
                let mut mapped = logical.mapped.lock();
                let Ok(index) = mapped.binary_search(&ctx.device) else {
                    return Err(SysmemError::invalid_argument(format!(
                        "Chunk {} isn't mapped on {}",
                        self.id(),
                        ctx.device
                    )));
                };

                mapped.remove(index);
                root.release_mapping(&mut state, ctx.device, None)?
            }
        };

        Ok(MappingUpdate {
            dma_addr: update.dma_addr + offset,
            ..update
        })
    }

    /// Bus address of the chunk for `ctx`, if `ctx` holds a mapping through it.
    pub fn dma_address(&self, ctx: DeviceContext) -> Option<u64> {
        let root = self.physical();
        let state = root.lock_state();
        let mapping = state.mappings.get(ctx.device)?;

        let held = match &self.inner.node {
            ChunkNode::Physical(_) => mapping.sub_contexts.contains(ctx.sub_context),
            ChunkNode::Logical(logical) => logical.mapped.lock().binary_search(&ctx.device).is_ok(),
        };

        held.then(|| mapping.dma_addr + self.page_offset() * PAGE_SIZE)
    }

    /// Use count of the physical chunk's mapping for `device`, zero when unmapped.
    pub fn mapping_use_count(&self, device: DeviceId) -> u32 {
        let root = self.physical();
        let state = root.lock_state();

        state
            .mappings
            .get(device)
            .map(|mapping| mapping.use_count)
            .unwrap_or(0)
    }

    /// Sub-contexts using the physical chunk's mapping for `device` directly.
    pub fn mapping_sub_contexts(&self, device: DeviceId) -> SubContextMask {
        let root = self.physical();
        let state = root.lock_state();

        state
            .mappings
            .get(device)
            .map(|mapping| mapping.sub_contexts)
            .unwrap_or_default()
    }

    /// Number of devices with a mapping of the physical chunk.
    pub fn mapped_device_count(&self) -> usize {
        self.physical().lock_state().mappings.len()
    }
}

#[cfg(all(test, feature = "storage-bytes"))]
mod tests {
    use super::*;
    use crate::storage::{AllocFlags, BytesHostStorage};
    use alloc::sync::Arc;

    fn setup(size: u64) -> (Arc<BytesHostStorage>, CpuChunk) {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = CpuChunk::alloc(storage.clone(), size, AllocFlags::default()).unwrap();
        (storage, chunk)
    }

    #[test]
    fn table_stays_sorted_by_device() {
        let (_storage, chunk) = setup(PAGE_SIZE);

        for index in [3, 1, 2] {
            chunk
                .ensure_mapped(DeviceContext::whole(DeviceId::new(index)))
                .unwrap();
        }

        let root = chunk.physical();
        let state = root.lock_state();
        let devices = state
            .mappings
            .entries
            .iter()
            .map(|mapping| mapping.device.index)
            .collect::<alloc::vec::Vec<_>>();
        assert_eq!(devices, [1, 2, 3]);
        drop(state);

        for index in [1, 2, 3] {
            chunk
                .unmap(DeviceContext::whole(DeviceId::new(index)))
                .unwrap();
        }
    }

    #[test]
    fn sub_contexts_count_once() {
        let (storage, chunk) = setup(PAGE_SIZE);
        let device = DeviceId::new(0);

        let first = chunk.ensure_mapped(DeviceContext::new(device, 1)).unwrap();
        let again = chunk.ensure_mapped(DeviceContext::new(device, 1)).unwrap();
        let other = chunk.ensure_mapped(DeviceContext::new(device, 4)).unwrap();

        assert!(first.platform_call);
        assert!(!again.platform_call);
        assert_eq!(first.dma_addr, other.dma_addr);
        assert_eq!(chunk.mapping_use_count(device), 2);
        assert_eq!(storage.live_dma_mappings(device), 1);

        chunk.unmap(DeviceContext::new(device, 1)).unwrap();
        let err = chunk.unmap(DeviceContext::new(device, 1)).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(chunk.mapping_use_count(device), 1);

        let last = chunk.unmap(DeviceContext::new(device, 4)).unwrap();
        assert!(last.platform_call);
        assert_eq!(storage.live_dma_mappings(device), 0);
    }

    #[test]
    fn platform_failure_leaves_no_entry() {
        let (storage, chunk) = setup(PAGE_SIZE);
        let ctx = DeviceContext::whole(DeviceId::new(0));

        storage.fail_next_dma_map();
        let err = chunk.ensure_mapped(ctx).unwrap_err();

        assert!(matches!(err, SysmemError::OperatingSystem { .. }));
        assert_eq!(chunk.mapping_use_count(ctx.device), 0);
        assert_eq!(chunk.dma_address(ctx), None);
    }
}
