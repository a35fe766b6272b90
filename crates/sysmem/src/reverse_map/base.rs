use crate::{
    PAGE_SIZE,
    error::SysmemError,
    region::{PageRange, VaRegion},
};
use alloc::{
    collections::BTreeMap,
    format,
    sync::{Arc, Weak},
    vec::Vec,
};
use hashbrown::HashMap;
use std::sync::{Mutex, MutexGuard};
use sysmem_common::device::{DeviceId, Processor};

type EntryId = u64;

/// A run of device pages resolved back to the region owning them.
#[derive(Clone)]
pub struct ReverseMapping {
    /// The owning region, retained until the mapping is dropped.
    pub region: Arc<dyn VaRegion>,
    /// Pages of the region covered by the run.
    pub pages: PageRange,
    /// Processor owning the pages.
    pub owner: Processor,
}

impl core::fmt::Debug for ReverseMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReverseMapping")
            .field("region_start", &self.region.start())
            .field("pages", &self.pages)
            .field("owner", &self.owner)
            .finish()
    }
}

struct ReverseMapEntry {
    region: Weak<dyn VaRegion>,
    pages: PageRange,
    owner: Processor,
    // First key covered by the entry.
    base_key: u64,
    // Virtual address of the first page.
    virt_addr: u64,
}

impl ReverseMapEntry {
    fn keys(&self) -> core::ops::Range<u64> {
        self.base_key..self.base_key + self.pages.len()
    }

    fn region(&self) -> Arc<dyn VaRegion> {
        self.region
            .upgrade()
            .unwrap_or_else(|| panic!("Region owning key {:#x} was dropped", self.base_key))
    }
}

#[derive(Default)]
struct ReverseMapState {
    keys: BTreeMap<u64, EntryId>,
    entries: HashMap<EntryId, ReverseMapEntry>,
    next_id: EntryId,
}

impl ReverseMapState {
    fn next_id(&mut self) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn entry_at(&self, key: u64) -> Option<(EntryId, &ReverseMapEntry)> {
        let id = *self.keys.get(&key)?;
        let entry = self
            .entries
            .get(&id)
            .unwrap_or_else(|| panic!("Key {key:#x} points to a freed entry"));
        Some((id, entry))
    }
}

/// Per device index from DMA pages back to the virtual region owning them.
///
/// Keys are DMA addresses divided by the page size. All keys of an entry point to the same
/// entry.
pub struct ReverseMap {
    device: DeviceId,
    supports_lookup: bool,
    max_region_size: u64,
    state: Mutex<ReverseMapState>,
}

impl ReverseMap {
    /// Create the index of `device`.
    ///
    /// Devices without physical address based reverse lookup keep an always empty index.
    pub fn new(device: DeviceId, supports_lookup: bool, max_region_size: u64) -> Self {
        Self {
            device,
            supports_lookup,
            max_region_size,
            state: Mutex::new(ReverseMapState::default()),
        }
    }

    /// The device owning the index.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Whether the device resolves DMA addresses through this index.
    pub fn supports_lookup(&self) -> bool {
        self.supports_lookup
    }

    /// Number of entries in the index.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether the index has no entry.
    pub fn is_empty(&self) -> bool {
        self.state().keys.is_empty()
    }

    /// Record that `region_size` bytes at `dma_addr` back `virt_addr` in `region`.
    ///
    /// Fails with [SysmemError::AlreadyExists] when any page is already indexed, leaving the
    /// index untouched.
    pub fn insert(
        &self,
        dma_addr: u64,
        virt_addr: u64,
        region_size: u64,
        region: &Arc<dyn VaRegion>,
        owner: Processor,
    ) -> Result<(), SysmemError> {
        self.check_region_size(dma_addr, virt_addr, region_size)?;
        assert!(!region.is_dead(), "Indexing pages of a dead region");
        assert!(region.is_locked(), "Indexing pages without the region lock");

        if !region.contains(virt_addr) || !region.contains(virt_addr + region_size - 1) {
            return Err(SysmemError::invalid_argument(format!(
                "{region_size:#x} bytes at {virt_addr:#x} exceed the owning region"
            )));
        }

        if !self.supports_lookup {
            return Ok(());
        }

        let base_key = dma_addr / PAGE_SIZE;
        let first = region.page_index_of(virt_addr);
        let entry = ReverseMapEntry {
            region: Arc::downgrade(region),
            pages: PageRange::new(first, first + region_size / PAGE_SIZE),
            owner,
            base_key,
            virt_addr,
        };

        let mut state = self.state();
        state.entries.try_reserve(1).map_err(|err| {
            SysmemError::out_of_memory(format!("Growing the reverse map failed: {err:?}"))
        })?;

        if let Some((&key, _)) = state.keys.range(entry.keys()).next() {
            return Err(SysmemError::AlreadyExists { key });
        }

        let id = state.next_id();
        for key in entry.keys() {
            state.keys.insert(key, id);
        }
        state.entries.insert(id, entry);

        Ok(())
    }

    /// Remove the entry starting at `dma_addr`.
    ///
    /// # Panics
    ///
    /// If no entry starts at `dma_addr`.
    pub fn remove(&self, dma_addr: u64) {
        let removed = self.remove_entry(dma_addr);
        assert!(
            removed || !self.supports_lookup,
            "No reverse mapping at {dma_addr:#x} on {}",
            self.device
        );
    }

    /// Remove the entry starting at `dma_addr` if it is still indexed.
    ///
    /// Returns whether an entry was removed.
    pub fn remove_on_eviction(&self, dma_addr: u64) -> bool {
        self.remove_entry(dma_addr)
    }

    fn remove_entry(&self, dma_addr: u64) -> bool {
        if !self.supports_lookup {
            return false;
        }

        let key = dma_addr / PAGE_SIZE;
        let mut state = self.state();
        let Some((id, entry)) = state.entry_at(key) else {
            return false;
        };

        assert_eq!(
            entry.base_key, key,
            "{dma_addr:#x} isn't the start of a reverse mapping"
        );
        if let Some(region) = entry.region.upgrade() {
            assert!(region.is_locked(), "Removing pages without the region lock");
        }

        let keys = entry.keys();
        for key in keys {
            let removed = state.keys.remove(&key);
            assert_eq!(removed, Some(id), "Key {key:#x} points to another entry");
        }
        state.entries.remove(&id);

        true
    }

    /// Move the entry starting at `dma_addr` to `region`, keeping its pages.
    pub fn reparent(&self, dma_addr: u64, region: &Arc<dyn VaRegion>) {
        assert_eq!(dma_addr % PAGE_SIZE, 0, "{dma_addr:#x} isn't page aligned");
        assert!(!region.is_dead(), "Reparenting pages to a dead region");
        assert!(region.is_locked(), "Reparenting pages without the region lock");

        if !self.supports_lookup {
            return;
        }

        let key = dma_addr / PAGE_SIZE;
        let mut state = self.state();
        let Some((id, _)) = state.entry_at(key) else {
            panic!("No reverse mapping at {dma_addr:#x} on {}", self.device);
        };
        let entry = state
            .entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("Key {key:#x} points to a freed entry"));

        let size = entry.pages.len() * PAGE_SIZE;
        assert!(
            region.contains(entry.virt_addr) && region.contains(entry.virt_addr + size - 1),
            "New region doesn't cover {size:#x} bytes at {:#x}",
            entry.virt_addr
        );

        let first = region.page_index_of(entry.virt_addr);
        entry.pages = PageRange::new(first, first + entry.pages.len());
        entry.region = Arc::downgrade(region);
    }

    /// Split the entry starting at `dma_addr` into entries of `new_region_size` bytes.
    ///
    /// New entries are allocated before any key is rewritten, a failure leaves the index as it
    /// was.
    pub fn split_entry(&self, dma_addr: u64, new_region_size: u64) -> Result<(), SysmemError> {
        if new_region_size == 0 || new_region_size % PAGE_SIZE != 0 {
            return Err(SysmemError::invalid_argument(format!(
                "Region size {new_region_size:#x} isn't a multiple of the page size"
            )));
        }

        if !self.supports_lookup {
            return Ok(());
        }

        let key = dma_addr / PAGE_SIZE;
        let num_pages = new_region_size / PAGE_SIZE;
        let mut state = self.state();

        let Some((id, entry)) = state.entry_at(key) else {
            return Err(SysmemError::invalid_argument(format!(
                "No reverse mapping at {dma_addr:#x}"
            )));
        };
        if entry.base_key != key {
            return Err(SysmemError::invalid_argument(format!(
                "{dma_addr:#x} isn't the start of a reverse mapping"
            )));
        }

        let old_pages = entry.pages.len();
        if num_pages >= old_pages || old_pages % num_pages != 0 {
            return Err(SysmemError::invalid_argument(format!(
                "Can't split {:#x} bytes into regions of {new_region_size:#x} bytes",
                old_pages * PAGE_SIZE
            )));
        }
        if let Some(region) = entry.region.upgrade() {
            assert!(region.is_locked(), "Splitting pages without the region lock");
        }

        let num_subregions = old_pages / num_pages;
        let mut subentries = Vec::new();
        subentries
            .try_reserve_exact(num_subregions as usize - 1)
            .map_err(|err| {
                SysmemError::out_of_memory(format!("Allocating reverse map entries: {err}"))
            })?;

        for subregion in 1..num_subregions {
            let offset = subregion * num_pages;
            subentries.push(ReverseMapEntry {
                region: entry.region.clone(),
                pages: PageRange::new(entry.pages.first + offset, entry.pages.first + offset + num_pages),
                owner: entry.owner,
                base_key: entry.base_key + offset,
                virt_addr: entry.virt_addr + offset * PAGE_SIZE,
            });
        }

        state
            .entries
            .try_reserve(subentries.len())
            .map_err(|err| {
                SysmemError::out_of_memory(format!("Growing the reverse map failed: {err:?}"))
            })?;

        for subentry in subentries {
            let sub_id = state.next_id();
            for key in subentry.keys() {
                let previous = state.keys.insert(key, sub_id);
                assert_eq!(previous, Some(id), "Key {key:#x} points to another entry");
            }
            state.entries.insert(sub_id, subentry);
        }

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.pages.outer = entry.pages.first + num_pages;
        }

        Ok(())
    }

    /// Merge the adjacent entries covering `new_region_size` bytes at `dma_addr` into the first.
    ///
    /// # Panics
    ///
    /// If the entries don't chain contiguously within the same region and owner.
    pub fn merge_entries(&self, dma_addr: u64, new_region_size: u64) -> Result<(), SysmemError> {
        if new_region_size == 0 || new_region_size % PAGE_SIZE != 0 {
            return Err(SysmemError::invalid_argument(format!(
                "Region size {new_region_size:#x} isn't a multiple of the page size"
            )));
        }
        if new_region_size > self.max_region_size {
            return Err(SysmemError::invalid_argument(format!(
                "Region size {new_region_size:#x} exceeds {:#x}",
                self.max_region_size
            )));
        }

        if !self.supports_lookup {
            return Ok(());
        }

        let base_key = dma_addr / PAGE_SIZE;
        let num_pages = new_region_size / PAGE_SIZE;
        let mut state = self.state();

        let Some((first_id, first)) = state.entry_at(base_key) else {
            return Err(SysmemError::invalid_argument(format!(
                "No reverse mapping at {dma_addr:#x}"
            )));
        };
        if first.base_key != base_key || first.pages.len() > num_pages {
            return Err(SysmemError::invalid_argument(format!(
                "{dma_addr:#x} doesn't start a run of {new_region_size:#x} bytes"
            )));
        }

        let region = first.region.clone();
        if let Some(region) = region.upgrade() {
            assert!(region.is_locked(), "Merging pages without the region lock");
        }
        let owner = first.owner;
        let first_page = first.pages.first;
        let mut key = base_key + first.pages.len();
        let mut running_page = first.pages.outer;

        while key < base_key + num_pages {
            let Some((id, entry)) = state.entry_at(key) else {
                panic!("Gap at key {key:#x} merging reverse mappings");
            };
            assert_ne!(id, first_id, "Key {key:#x} already merged");
            assert!(
                entry.region.ptr_eq(&region) && entry.owner == owner,
                "Merging reverse mappings of different regions or owners"
            );
            assert_eq!(
                entry.pages.first, running_page,
                "Reverse mappings don't chain contiguously"
            );
            assert!(
                key + entry.pages.len() <= base_key + num_pages,
                "Reverse mapping at key {key:#x} overflows the merged region"
            );

            let keys = entry.keys();
            running_page = entry.pages.outer;
            for key in keys.clone() {
                state.keys.insert(key, first_id);
            }
            state.entries.remove(&id);
            key = keys.end;
        }

        if let Some(first) = state.entries.get_mut(&first_id) {
            first.pages = PageRange::new(first_page, first_page + num_pages);
        }

        Ok(())
    }

    /// Resolve `region_size` bytes at `dma_addr`, one result per run of pages sharing an entry.
    ///
    /// Stops after `max_entries` results.
    pub fn lookup_range(
        &self,
        dma_addr: u64,
        region_size: u64,
        max_entries: usize,
    ) -> Result<Vec<ReverseMapping>, SysmemError> {
        if !self.supports_lookup {
            return Err(SysmemError::invalid_argument(format!(
                "{} doesn't support reverse lookups",
                self.device
            )));
        }
        if region_size < PAGE_SIZE || region_size % PAGE_SIZE != 0 || max_entries == 0 {
            return Err(SysmemError::invalid_argument(format!(
                "Invalid lookup of {region_size:#x} bytes for {max_entries} entries"
            )));
        }

        let state = self.state();
        let mut key = dma_addr / PAGE_SIZE;
        let end = key + region_size / PAGE_SIZE;
        let mut mappings = Vec::new();

        while key < end && mappings.len() < max_entries {
            // Skip unindexed pages.
            let Some((&next, &id)) = state.keys.range(key..end).next() else {
                break;
            };
            key = next;
            let entry = state
                .entries
                .get(&id)
                .unwrap_or_else(|| panic!("Key {key:#x} points to a freed entry"));

            let page_offset = key - entry.base_key;
            let run = (entry.pages.len() - page_offset).min(end - key);
            let first = entry.pages.first + page_offset;

            mappings.push(ReverseMapping {
                region: entry.region(),
                pages: PageRange::new(first, first + run),
                owner: entry.owner,
            });
            key += run;
        }

        Ok(mappings)
    }

    fn check_region_size(
        &self,
        dma_addr: u64,
        virt_addr: u64,
        region_size: u64,
    ) -> Result<(), SysmemError> {
        let alignment = match region_size.is_power_of_two() {
            true => region_size,
            false => PAGE_SIZE,
        };

        if region_size == 0
            || region_size % PAGE_SIZE != 0
            || region_size > self.max_region_size
            || dma_addr % alignment != 0
            || virt_addr % alignment != 0
        {
            return Err(SysmemError::invalid_argument(format!(
                "Invalid reverse mapping of {region_size:#x} bytes at DMA {dma_addr:#x}, virtual {virt_addr:#x}"
            )));
        }

        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, ReverseMapState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for ReverseMap {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poison| poison.into_inner());
        assert!(
            state.keys.is_empty(),
            "Reverse map of {} still has {} entries",
            self.device,
            state.entries.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::ManagedRegion;

    const REGION_START: u64 = 0x4000_0000;

    fn region(pages: u64) -> Arc<ManagedRegion> {
        Arc::new(ManagedRegion::new(REGION_START, pages * PAGE_SIZE))
    }

    fn index() -> ReverseMap {
        ReverseMap::new(DeviceId::new(0), true, 2 * 1024 * 1024)
    }

    #[test]
    fn collision_leaves_index_untouched() {
        let managed = region(8);
        let owning: Arc<dyn VaRegion> = managed.clone();
        let index = index();
        let _guard = managed.lock();

        index
            .insert(0x2000, REGION_START, 2 * PAGE_SIZE, &owning, Processor::Cpu)
            .unwrap();
        let err = index
            .insert(0x0000, REGION_START + 4 * PAGE_SIZE, 4 * PAGE_SIZE, &owning, Processor::Cpu)
            .unwrap_err();

        assert_eq!(err, SysmemError::AlreadyExists { key: 2 });
        assert_eq!(index.len(), 1);
        assert!(index.lookup_range(0x0000, 2 * PAGE_SIZE, 4).unwrap().is_empty());

        index.remove(0x2000);
        assert!(index.is_empty());
    }

    #[test]
    fn lookup_respects_max_entries() {
        let managed = region(8);
        let owning: Arc<dyn VaRegion> = managed.clone();
        let index = index();
        let _guard = managed.lock();

        for page in 0..4 {
            index
                .insert(
                    page * PAGE_SIZE,
                    REGION_START + page * PAGE_SIZE,
                    PAGE_SIZE,
                    &owning,
                    Processor::Cpu,
                )
                .unwrap();
        }

        let found = index.lookup_range(0, 4 * PAGE_SIZE, 2).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].pages, PageRange::new(1, 2));

        for page in 0..4 {
            index.remove(page * PAGE_SIZE);
        }
    }

    #[test]
    fn lookup_starting_mid_entry_reports_the_tail() {
        let managed = region(8);
        let owning: Arc<dyn VaRegion> = managed.clone();
        let index = index();
        let _guard = managed.lock();

        index
            .insert(0x10000, REGION_START + 0x4000, 4 * PAGE_SIZE, &owning, Processor::Cpu)
            .unwrap();

        let found = index.lookup_range(0x12000, 8 * PAGE_SIZE, 8).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pages, PageRange::new(6, 8));

        index.remove(0x10000);
    }

    #[test]
    fn eviction_tolerates_missing_entries() {
        let index = index();

        assert!(!index.remove_on_eviction(0x8000));
    }

    #[test]
    fn unsupported_device_skips_indexing() {
        let managed = region(4);
        let owning: Arc<dyn VaRegion> = managed.clone();
        let index = ReverseMap::new(DeviceId::new(1), false, 2 * 1024 * 1024);
        let _guard = managed.lock();

        index
            .insert(0, REGION_START, 4 * PAGE_SIZE, &owning, Processor::Cpu)
            .unwrap();

        assert!(index.is_empty());
        assert!(index.lookup_range(0, PAGE_SIZE, 1).is_err());
        index.remove(0);
    }

    #[test]
    fn reparent_recomputes_pages() {
        let old = region(8);
        let old_owner: Arc<dyn VaRegion> = old.clone();
        let new = Arc::new(ManagedRegion::new(REGION_START + 4 * PAGE_SIZE, 4 * PAGE_SIZE));
        let new_owner: Arc<dyn VaRegion> = new.clone();
        let index = index();

        {
            let _guard = old.lock();
            index
                .insert(0x6000, REGION_START + 6 * PAGE_SIZE, 2 * PAGE_SIZE, &old_owner, Processor::Cpu)
                .unwrap();
        }

        let _guard = new.lock();
        index.reparent(0x6000, &new_owner);

        let found = index.lookup_range(0x6000, 2 * PAGE_SIZE, 1).unwrap();
        assert_eq!(found[0].pages, PageRange::new(2, 4));
        assert_eq!(found[0].region.start(), REGION_START + 4 * PAGE_SIZE);

        index.remove(0x6000);
    }

    #[test]
    #[should_panic = "without the region lock"]
    fn reparent_needs_the_new_region_lock() {
        let old = region(8);
        let old_owner: Arc<dyn VaRegion> = old.clone();
        let new = Arc::new(ManagedRegion::new(REGION_START, 8 * PAGE_SIZE));
        let new_owner: Arc<dyn VaRegion> = new.clone();
        let index = index();

        let _guard = old.lock();
        index
            .insert(0, REGION_START, PAGE_SIZE, &old_owner, Processor::Cpu)
            .unwrap();

        index.reparent(0, &new_owner);
    }

    #[test]
    #[should_panic = "without the region lock"]
    fn merge_needs_the_region_lock() {
        let managed = region(8);
        let owning: Arc<dyn VaRegion> = managed.clone();
        let index = index();

        {
            let _guard = managed.lock();
            index
                .insert(0, REGION_START, 2 * PAGE_SIZE, &owning, Processor::Cpu)
                .unwrap();
            index.split_entry(0, PAGE_SIZE).unwrap();
        }

        index.merge_entries(0, 2 * PAGE_SIZE).unwrap();
    }

    #[test]
    fn sparse_lookup_skips_unindexed_pages() {
        let managed = region(8);
        let owning: Arc<dyn VaRegion> = managed.clone();
        let index = index();
        let _guard = managed.lock();
        let far = 1 << 35;

        index
            .insert(far, REGION_START + 2 * PAGE_SIZE, 2 * PAGE_SIZE, &owning, Processor::Cpu)
            .unwrap();

        let found = index.lookup_range(0, 1 << 36, 8).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pages, PageRange::new(2, 4));

        index.remove(far);
    }

    #[test]
    #[should_panic]
    fn merge_asserts_contiguity() {
        let managed = region(8);
        let owning: Arc<dyn VaRegion> = managed.clone();
        let index = index();
        let _guard = managed.lock();

        index
            .insert(0, REGION_START, PAGE_SIZE, &owning, Processor::Cpu)
            .unwrap();
        index
            .insert(PAGE_SIZE, REGION_START + 5 * PAGE_SIZE, PAGE_SIZE, &owning, Processor::Cpu)
            .unwrap();

        index.merge_entries(0, 2 * PAGE_SIZE).unwrap();
    }
}
