use super::base::{CpuChunk, PhysicalChunk, PhysicalState};
use alloc::{vec, vec::Vec};

/// One bit per page of a multi-page physical chunk.
#[derive(Debug, Clone)]
pub(crate) struct DirtyBitmap {
    words: Vec<u64>,
    num_pages: usize,
}

impl DirtyBitmap {
    pub(crate) fn new(num_pages: usize) -> Self {
        Self {
            words: vec![0; num_pages.div_ceil(64)],
            num_pages,
        }
    }

    pub(crate) fn set(&mut self, page: usize) {
        self.words[page / 64] |= 1 << (page % 64);
    }

    pub(crate) fn clear(&mut self, page: usize) {
        self.words[page / 64] &= !(1 << (page % 64));
    }

    pub(crate) fn test(&self, page: usize) -> bool {
        self.words[page / 64] & (1 << (page % 64)) != 0
    }

    pub(crate) fn fill(&mut self) {
        self.words.fill(u64::MAX);
        let tail = self.num_pages % 64;
        if tail != 0
            && let Some(last) = self.words.last_mut()
        {
            *last = (1 << tail) - 1;
        }
    }

    pub(crate) fn any(&self) -> bool {
        self.words.iter().any(|word| *word != 0)
    }
}

impl PhysicalChunk {
    // Large allocations only report dirtiness for the whole run of pages, so a set page flag
    // dirties every page of the chunk.
    fn sample_page_dirty(&self, state: &mut PhysicalState) {
        if self.storage.test_and_clear_page_dirty(&self.page)
            && let Some(dirty) = state.dirty.as_mut()
        {
            dirty.fill();
        }
    }
}

impl CpuChunk {
    /// Mark page `page_index` of the chunk as modified.
    pub fn mark_dirty(&self, page_index: u64) {
        self.assert_page_index(page_index);
        let root = self.physical();
        let index = (self.page_offset() + page_index) as usize;
        let mut state = root.lock_state();

        match state.dirty.as_mut() {
            Some(dirty) => dirty.set(index),
            None => root.storage.set_page_dirty(&root.page),
        }
    }

    /// Mark page `page_index` of the chunk as clean.
    pub fn mark_clean(&self, page_index: u64) {
        self.assert_page_index(page_index);
        let root = self.physical();
        let index = (self.page_offset() + page_index) as usize;
        let mut state = root.lock_state();

        if state.dirty.is_none() {
            root.storage.clear_page_dirty(&root.page);
            return;
        }

        root.sample_page_dirty(&mut state);
        if let Some(dirty) = state.dirty.as_mut() {
            dirty.clear(index);
        }
    }

    /// Whether page `page_index` of the chunk was modified.
    pub fn is_dirty(&self, page_index: u64) -> bool {
        self.assert_page_index(page_index);
        let root = self.physical();
        let index = (self.page_offset() + page_index) as usize;
        let mut state = root.lock_state();

        if state.dirty.is_none() {
            return root.storage.is_page_dirty(&root.page);
        }

        root.sample_page_dirty(&mut state);
        state
            .dirty
            .as_ref()
            .is_some_and(|dirty| dirty.test(index))
    }
}

#[cfg(all(test, feature = "storage-bytes"))]
mod tests {
    use super::*;
    use crate::{
        PAGE_SIZE,
        storage::{AllocFlags, BytesHostStorage, HostStorage},
    };
    use alloc::sync::Arc;

    #[test]
    fn bitmap_fill_stops_at_last_page() {
        let mut bitmap = DirtyBitmap::new(70);
        bitmap.fill();

        assert!(bitmap.test(69));
        assert_eq!(bitmap.words[1], (1 << 6) - 1);
    }

    #[test]
    fn zeroed_chunk_starts_dirty() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk =
            CpuChunk::alloc(storage.clone(), 16 * PAGE_SIZE, AllocFlags::default().zeroed())
                .unwrap();

        assert!(chunk.is_dirty(5));
        assert!(!storage.is_page_dirty(&chunk.host_page()));

        chunk.mark_clean(5);
        assert!(!chunk.is_dirty(5));
        assert!(chunk.is_dirty(6));
    }

    #[test]
    fn logical_pages_share_the_physical_bitmap() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = CpuChunk::alloc(storage.clone(), 16 * PAGE_SIZE, AllocFlags::default()).unwrap();
        let child = CpuChunk::logical(&chunk, 1, 8 * PAGE_SIZE);

        child.mark_dirty(2);

        assert!(chunk.is_dirty(10));
        assert!(!chunk.is_dirty(2));
    }

    #[test]
    fn released_dirty_bits_reach_the_page() {
        let storage = Arc::new(BytesHostStorage::new());
        let page = storage.alloc_pages(4 * PAGE_SIZE, AllocFlags::default()).unwrap();
        let chunk = CpuChunk::external(storage.clone(), page);

        chunk.mark_dirty(3);
        drop(chunk);

        assert!(storage.is_page_dirty(&page));
        storage.free_pages(page);
    }

    #[test]
    fn single_page_uses_the_page_flag() {
        let storage = Arc::new(BytesHostStorage::new());
        let chunk = CpuChunk::alloc(storage.clone(), PAGE_SIZE, AllocFlags::default()).unwrap();

        chunk.mark_dirty(0);
        assert!(storage.is_page_dirty(&chunk.host_page()));
        chunk.mark_clean(0);
        assert!(!chunk.is_dirty(0));
    }
}
