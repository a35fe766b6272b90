use super::{
    base::{ChunkKind, ChunkNode, CpuChunk, SplitRecord},
    sizes::ChunkSizes,
};
use crate::error::SysmemError;
use alloc::{format, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};
use smallvec::SmallVec;
use sysmem_common::device::{DeviceId, SubContextMask};

/// Failure injection for the split engine.
#[derive(Debug, Default)]
pub struct ErrorInjection {
    // Chunk creations left before the injected failure, zero when disarmed.
    chunk_creation_countdown: AtomicU32,
}

impl ErrorInjection {
    /// Make the `nth` next chunk descriptor creation fail, starting at one.
    pub fn fail_nth_chunk_creation(&self, nth: u32) {
        self.chunk_creation_countdown.store(nth, Ordering::Relaxed);
    }

    /// Disarm any pending failure.
    pub fn reset(&self) {
        self.chunk_creation_countdown.store(0, Ordering::Relaxed);
    }

    fn chunk_creation_fails(&self) -> bool {
        self.chunk_creation_countdown
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            })
            == Ok(1)
    }
}

/// Split `chunk` into logical children of `child_size`, the next smaller size of the lattice.
///
/// Every device mapped through `chunk` ends up mapped through each child. On failure the mapping
/// state is restored and every child created so far is released.
pub(crate) fn split(
    chunk: &CpuChunk,
    child_size: u64,
    sizes: &ChunkSizes,
    injection: &ErrorInjection,
) -> Result<Vec<CpuChunk>, SysmemError> {
    if chunk.kind() == ChunkKind::ExternallyOwned {
        return Err(SysmemError::invalid_argument(
            "Externally owned chunks can't be split",
        ));
    }
    chunk.assert_not_split("split")?;

    if sizes.next_smaller(chunk.size()) != Some(child_size) {
        return Err(SysmemError::invalid_argument(format!(
            "Can't split a chunk of {:#x} bytes into {child_size:#x} bytes, sizes are {:#x}",
            chunk.size(),
            sizes.mask()
        )));
    }

    let count = (chunk.size() / child_size) as usize;
    let mut children: Vec<CpuChunk> = Vec::new();
    children.try_reserve_exact(count).map_err(|err| {
        SysmemError::out_of_memory(format!("Allocating {count} chunk descriptors: {err}"))
    })?;

    let root = chunk.physical();
    let mut state = root.lock_state();

    let holders: SmallVec<[DeviceId; 2]> = match &chunk.inner.node {
        ChunkNode::Logical(logical) => logical.mapped.lock().clone(),
        ChunkNode::Physical(_) => state
            .mappings
            .iter_mut()
            .filter(|mapping| !mapping.sub_contexts.is_empty())
            .map(|mapping| mapping.device)
            .collect(),
    };

    for index in 0..count {
        if injection.chunk_creation_fails() {
            for child in children.iter() {
                let ChunkNode::Logical(logical) = &child.inner.node else {
                    unreachable!("Split children are logical");
                };
                for device in core::mem::take(&mut *logical.mapped.lock()) {
                    root.release_holder(&mut state, device);
                }
            }

            // Children release the parent, never while its state is locked.
            drop(state);
            drop(children);

            return Err(SysmemError::out_of_memory(format!(
                "Creating child {index} of chunk {} failed",
                chunk.id()
            )));
        }

        let child = CpuChunk::logical(chunk, index as u32, child_size);
        if let ChunkNode::Logical(logical) = &child.inner.node {
            let mut mapped = logical.mapped.lock();
            for device in holders.iter() {
                root.retain_mapping(&mut state, *device, None);
                mapped.push(*device);
            }
        }
        children.push(child);
    }

    let mut record = SplitRecord {
        child_size,
        live_children: count as u32,
        sub_contexts: SmallVec::new(),
    };

    match &chunk.inner.node {
        ChunkNode::Logical(logical) => {
            for device in core::mem::take(&mut *logical.mapped.lock()) {
                root.release_holder(&mut state, device);
            }
        }
        ChunkNode::Physical(_) => {
            for mapping in state.mappings.iter_mut() {
                let held = core::mem::take(&mut mapping.sub_contexts);
                if held.is_empty() {
                    continue;
                }

                assert!(
                    mapping.use_count > held.count(),
                    "Split left no holder for {}",
                    mapping.device
                );
                mapping.use_count -= held.count();
                record.sub_contexts.push((mapping.device, held));
            }
        }
    }

    drop(state);
    chunk.set_split_record(Some(record));

    Ok(children)
}

/// Merge every child of a split chunk back into it, returning the parent.
///
/// The parent inherits the mappings held by any child. The caller must hand over the only
/// handles to the children: they are drained from `children` on success and left untouched
/// when the merge is rejected.
pub(crate) fn merge(children: &mut Vec<CpuChunk>) -> Result<CpuChunk, SysmemError> {
    let parent = validate_siblings(children)?;
    let Some(record) = parent.split_record() else {
        unreachable!("Validated siblings have a split parent");
    };

    let root = parent.physical();
    let mut state = root.lock_state();

    let mut devices: SmallVec<[DeviceId; 2]> = SmallVec::new();
    for child in children.iter() {
        if let ChunkNode::Logical(logical) = &child.inner.node {
            devices.extend(logical.mapped.lock().iter().copied());
        }
    }
    devices.sort();
    devices.dedup();

    for device in devices.iter().copied() {
        match &parent.inner.node {
            ChunkNode::Physical(_) => {
                let held = record
                    .sub_contexts
                    .iter()
                    .find(|(holder, _)| *holder == device)
                    .map(|(_, mask)| *mask)
                    .unwrap_or_else(whole_device);

                for sub in held.iter() {
                    root.retain_mapping(&mut state, device, Some(sub));
                }
            }
            ChunkNode::Logical(logical) => {
                root.retain_mapping(&mut state, device, None);
                let mut mapped = logical.mapped.lock();
                if let Err(index) = mapped.binary_search(&device) {
                    mapped.insert(index, device);
                }
            }
        }
    }

    for child in children.iter() {
        if let ChunkNode::Logical(logical) = &child.inner.node {
            for device in core::mem::take(&mut *logical.mapped.lock()) {
                root.release_holder(&mut state, device);
            }
        }
    }

    drop(state);
    parent.set_split_record(None);
    children.clear();

    Ok(parent)
}

// Checks that `children` are exactly the uniquely owned children of one split chunk.
fn validate_siblings(children: &[CpuChunk]) -> Result<CpuChunk, SysmemError> {
    let Some(first) = children.first() else {
        return Err(SysmemError::invalid_argument("Nothing to merge"));
    };
    let Some(parent) = first.parent().cloned() else {
        return Err(SysmemError::invalid_argument(format!(
            "Chunk {} wasn't split from another chunk",
            first.id()
        )));
    };
    let Some(record) = parent.split_record() else {
        return Err(SysmemError::invalid_argument(format!(
            "Chunk {} isn't split",
            parent.id()
        )));
    };

    let count = (parent.size() / record.child_size) as usize;
    let mut covered = alloc::vec![false; count];

    for child in children {
        let same_parent = child
            .parent()
            .is_some_and(|other| other.ptr_eq(&parent));
        assert!(
            same_parent,
            "Chunk {} isn't a sibling of chunk {}",
            child.id(),
            first.id()
        );

        if child.size() != record.child_size {
            return Err(SysmemError::invalid_argument(format!(
                "Chunk {} has {:#x} bytes, its siblings {:#x}",
                child.id(),
                child.size(),
                record.child_size
            )));
        }
        child.assert_not_split("merge")?;

        // Only the caller's handle remains.
        if child.ref_count() != 1 {
            return Err(SysmemError::invalid_argument(format!(
                "Chunk {} is still retained elsewhere",
                child.id()
            )));
        }

        let index = child.child_index().unwrap_or_default() as usize;
        match covered.get_mut(index) {
            Some(seen) if !*seen => *seen = true,
            _ => {
                return Err(SysmemError::invalid_argument(format!(
                    "Child {index} of chunk {} appears twice",
                    parent.id()
                )));
            }
        }
    }

    if covered.iter().any(|seen| !seen) {
        return Err(SysmemError::invalid_argument(format!(
            "Merging chunk {} needs all of its {count} children",
            parent.id()
        )));
    }

    Ok(parent)
}

fn whole_device() -> SubContextMask {
    let mut mask = SubContextMask::empty();
    mask.test_and_set(0);
    mask
}

#[cfg(all(test, feature = "storage-bytes"))]
mod tests {
    use super::*;
    use crate::{
        PAGE_SIZE,
        storage::{AllocFlags, BytesHostStorage},
    };
    use alloc::sync::Arc;
    use sysmem_common::device::DeviceContext;

    const KB: u64 = 1024;

    fn sizes() -> ChunkSizes {
        ChunkSizes::from_sizes(&[4 * KB, 64 * KB, 2048 * KB]).unwrap()
    }

    fn alloc(storage: &Arc<BytesHostStorage>, size: u64) -> CpuChunk {
        CpuChunk::alloc(storage.clone(), size, AllocFlags::default()).unwrap()
    }

    #[test]
    fn split_covers_the_parent() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = alloc(&storage, 64 * KB);

        let children = split(&chunk, 4 * KB, &sizes(), &ErrorInjection::default()).unwrap();

        assert_eq!(children.len(), 16);
        for (index, child) in children.iter().enumerate() {
            assert_eq!(child.page_offset(), index as u64);
            assert_eq!(child.host_address(0), chunk.host_address(index as u64));
        }
        assert!(chunk.is_split());
        assert_eq!(chunk.ref_count(), 17);
    }

    #[test]
    fn split_needs_the_next_smaller_size() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = alloc(&storage, 2048 * KB);

        let err = split(&chunk, 4 * KB, &sizes(), &ErrorInjection::default()).unwrap_err();

        assert!(err.is_invalid_argument());
        assert!(!chunk.is_split());
    }

    #[test]
    fn split_hands_the_physical_mapping_to_children() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = alloc(&storage, 64 * KB);
        let device = DeviceId::new(1);
        let dma_addr = chunk.ensure_mapped(DeviceContext::new(device, 2)).unwrap().dma_addr;

        let children = split(&chunk, 4 * KB, &sizes(), &ErrorInjection::default()).unwrap();

        assert_eq!(chunk.mapping_use_count(device), 16);
        assert!(chunk.mapping_sub_contexts(device).is_empty());
        assert_eq!(
            children[3].dma_address(DeviceContext::whole(device)),
            Some(dma_addr + 3 * PAGE_SIZE)
        );

        let mut children = children;
        let merged = merge(&mut children).unwrap();

        assert!(children.is_empty());
        assert!(merged.ptr_eq(&chunk));
        assert_eq!(chunk.mapping_use_count(device), 1);
        assert!(chunk.mapping_sub_contexts(device).contains(2));
    }

    #[test]
    fn merge_rejects_missing_children() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = alloc(&storage, 64 * KB);
        let mut children = split(&chunk, 4 * KB, &sizes(), &ErrorInjection::default()).unwrap();
        let last = children.pop().unwrap();

        assert!(merge(&mut children).unwrap_err().is_invalid_argument());
        assert_eq!(children.len(), 15);

        children.push(last);
        merge(&mut children).unwrap();
        assert!(!chunk.is_split());
    }

    #[test]
    fn merge_rejects_retained_children() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = alloc(&storage, 64 * KB);
        let mut children = split(&chunk, 4 * KB, &sizes(), &ErrorInjection::default()).unwrap();
        let retained = children[0].clone();

        assert!(merge(&mut children).unwrap_err().is_invalid_argument());
        drop(retained);
        assert!(merge(&mut children).is_ok());
    }

    #[test]
    fn dropping_every_child_ends_the_split() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = alloc(&storage, 64 * KB);
        let device = DeviceId::new(0);
        let ctx = DeviceContext::new(device, 2);
        chunk.ensure_mapped(ctx).unwrap();

        let mut children = split(&chunk, 4 * KB, &sizes(), &ErrorInjection::default()).unwrap();
        let last = children.pop().unwrap();
        drop(children);

        assert!(chunk.is_split());
        assert_eq!(chunk.mapping_use_count(device), 1);

        drop(last);

        assert!(!chunk.is_split());
        assert_eq!(chunk.ref_count(), 1);
        assert_eq!(chunk.mapping_use_count(device), 0);
        assert_eq!(storage.live_dma_mappings(device), 0);

        chunk.ensure_mapped(ctx).unwrap();
        assert!(chunk.mapping_sub_contexts(device).contains(2));
        chunk.unmap(ctx).unwrap();
        assert_eq!(split(&chunk, 4 * KB, &sizes(), &ErrorInjection::default()).unwrap().len(), 16);
    }

    #[test]
    fn injection_fires_once() {
        let injection = ErrorInjection::default();
        injection.fail_nth_chunk_creation(2);

        assert!(!injection.chunk_creation_fails());
        assert!(injection.chunk_creation_fails());
        assert!(!injection.chunk_creation_fails());
    }
}
