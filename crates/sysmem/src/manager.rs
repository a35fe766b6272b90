use crate::{
    PAGE_SIZE,
    chunk::{self, ChunkSizes, CpuChunk, ErrorInjection, MappingUpdate},
    config::GlobalConfig,
    error::SysmemError,
    logging::{SysmemLogger, Verbosity},
    region::VaRegion,
    reverse_map::{ReverseMap, ReverseMapping},
    storage::{AllocFlags, DmaStorage, HostPage},
};
use alloc::{format, sync::Arc, vec::Vec};
use hashbrown::HashMap;
use std::sync::{Mutex, MutexGuard};
use sysmem_common::device::{DeviceContext, DeviceId, Processor};

/// The host memory service of a driver instance.
///
/// Owns the host storage, the size lattice and the reverse mapping index of every registered
/// device. Chunk and index mutations must be made while holding the lock of the region owning
/// the pages.
pub struct SysmemManager<S: DmaStorage + 'static> {
    storage: Arc<S>,
    sizes: ChunkSizes,
    config: Arc<GlobalConfig>,
    logger: Mutex<SysmemLogger>,
    injection: ErrorInjection,
    devices: Mutex<HashMap<DeviceId, Arc<ReverseMap>>>,
}

impl<S: DmaStorage + 'static> core::fmt::Debug for SysmemManager<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SysmemManager")
            .field("sizes", &self.sizes)
            .field("devices", &self.devices().len())
            .finish()
    }
}

impl<S: DmaStorage + 'static> SysmemManager<S> {
    /// Create a manager using the [global configuration](GlobalConfig::get).
    pub fn new(storage: S) -> Result<Self, SysmemError> {
        Self::with_config(storage, GlobalConfig::get())
    }

    /// Create a manager with an explicit configuration.
    pub fn with_config(storage: S, config: Arc<GlobalConfig>) -> Result<Self, SysmemError> {
        let sizes = ChunkSizes::from_sizes(&config.chunk.allocation_sizes)?;
        let logger = SysmemLogger::new(config.clone());

        log::debug!("Host chunk sizes {:#x}", sizes.mask());

        Ok(Self {
            storage: Arc::new(storage),
            sizes,
            config,
            logger: Mutex::new(logger),
            injection: ErrorInjection::default(),
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// The host storage backing the chunks.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The configured size lattice.
    pub fn sizes(&self) -> ChunkSizes {
        self.sizes
    }

    /// The configuration the manager was built with.
    pub fn config(&self) -> &Arc<GlobalConfig> {
        &self.config
    }

    /// Failure injection for the split engine.
    pub fn error_injection(&self) -> &ErrorInjection {
        &self.injection
    }

    /// Allocate a physical chunk of `size` bytes, one of the configured sizes.
    pub fn alloc(&self, size: u64, flags: AllocFlags) -> Result<CpuChunk, SysmemError> {
        if !self.sizes.contains(size) {
            return Err(SysmemError::invalid_argument(format!(
                "Chunk size {size:#x} isn't one of {:#x}",
                self.sizes.mask()
            )));
        }

        let chunk = CpuChunk::alloc(self.dyn_storage(), size, flags)?;
        self.logger().log_chunk(Verbosity::Basic, || {
            format!("Allocated {} of {size:#x} bytes {flags:?}", chunk.id())
        });

        Ok(chunk)
    }

    /// Allocate the largest configured size not above `max_size` the host can provide.
    ///
    /// Sizes above a page are tried without memory compaction, falling back to smaller sizes.
    pub fn alloc_best_fit(&self, max_size: u64, flags: AllocFlags) -> Result<CpuChunk, SysmemError> {
        let mut last_err = None;

        for size in self.sizes.iter_rev().filter(|size| *size <= max_size) {
            let mut flags = flags;
            flags.no_retry = size > PAGE_SIZE;

            match CpuChunk::alloc(self.dyn_storage(), size, flags) {
                Ok(chunk) => {
                    self.logger().log_chunk(Verbosity::Basic, || {
                        format!("Allocated {} of {size:#x} bytes, best fit for {max_size:#x}", chunk.id())
                    });
                    return Ok(chunk);
                }
                Err(err) if err.is_out_of_memory() => {
                    log::debug!("No chunk of {size:#x} bytes available, trying a smaller size");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            SysmemError::invalid_argument(format!(
                "No configured chunk size fits in {max_size:#x} bytes"
            ))
        }))
    }

    /// Track pages allocated and freed by someone else.
    ///
    /// The pages must be a page aligned power of two run, they are never freed by the chunk.
    pub fn alloc_external(&self, page: HostPage) -> Result<CpuChunk, SysmemError> {
        if !page.size.is_power_of_two() || page.size < PAGE_SIZE || page.address % PAGE_SIZE != 0 {
            return Err(SysmemError::invalid_argument(format!(
                "External pages {:#x}+{:#x} aren't a page aligned power of two",
                page.address, page.size
            )));
        }

        let chunk = CpuChunk::external(self.dyn_storage(), page);
        self.logger().log_chunk(Verbosity::Basic, || {
            format!("Tracking external {} of {:#x} bytes", chunk.id(), page.size)
        });

        Ok(chunk)
    }

    /// Release a chunk handle.
    ///
    /// The chunk is destroyed with its last handle, a logical chunk then releases its parent.
    pub fn free(&self, chunk: CpuChunk) {
        self.logger().log_chunk(Verbosity::Full, || {
            format!("Releasing {} ({} handles)", chunk.id(), chunk.ref_count())
        });
        drop(chunk);
    }

    /// Split `chunk` into logical children of `child_size`, the next smaller configured size.
    pub fn split(&self, chunk: &CpuChunk, child_size: u64) -> Result<Vec<CpuChunk>, SysmemError> {
        let result = chunk::split(chunk, child_size, &self.sizes, &self.injection);

        match &result {
            Ok(children) => self.logger().log_chunk(Verbosity::Basic, || {
                format!(
                    "Split {} into {} chunks of {child_size:#x} bytes",
                    chunk.id(),
                    children.len()
                )
            }),
            Err(err) => self.logger().log_chunk(Verbosity::Basic, || {
                format!("Splitting {} failed: {err}", chunk.id())
            }),
        }

        result
    }

    /// Merge all children of a split chunk back into it.
    ///
    /// `children` must hold the only handles to every child. It is emptied on success and left
    /// untouched on error.
    pub fn merge(&self, children: &mut Vec<CpuChunk>) -> Result<CpuChunk, SysmemError> {
        let count = children.len();
        let parent = chunk::merge(children)?;

        self.logger().log_chunk(Verbosity::Basic, || {
            format!("Merged {count} chunks into {}", parent.id())
        });

        Ok(parent)
    }

    /// Make `chunk` visible to `ctx`, returning its bus address.
    pub fn map_to_device(&self, chunk: &CpuChunk, ctx: DeviceContext) -> Result<u64, SysmemError> {
        let update = chunk.ensure_mapped(ctx)?;
        self.log_mapping("Mapped", chunk, ctx, update);

        Ok(update.dma_addr)
    }

    /// Release the mapping `ctx` holds through `chunk`.
    ///
    /// Fails with [SysmemError::InvalidArgument] when `ctx` holds no mapping through `chunk`.
    pub fn unmap_from_device(&self, chunk: &CpuChunk, ctx: DeviceContext) -> Result<(), SysmemError> {
        let update = chunk.unmap(ctx)?;
        self.log_mapping("Unmapped", chunk, ctx, update);

        Ok(())
    }

    /// Bus address of `chunk` for `ctx`, if mapped.
    pub fn dma_address(&self, chunk: &CpuChunk, ctx: DeviceContext) -> Option<u64> {
        chunk.dma_address(ctx)
    }

    /// Mark a page of `chunk` as modified.
    pub fn mark_dirty(&self, chunk: &CpuChunk, page_index: u64) {
        chunk.mark_dirty(page_index);
        self.logger().log_chunk(Verbosity::Full, || {
            format!("Page {page_index} of {} dirty", chunk.id())
        });
    }

    /// Mark a page of `chunk` as clean.
    pub fn mark_clean(&self, chunk: &CpuChunk, page_index: u64) {
        chunk.mark_clean(page_index);
        self.logger().log_chunk(Verbosity::Full, || {
            format!("Page {page_index} of {} clean", chunk.id())
        });
    }

    /// Whether a page of `chunk` was modified.
    pub fn is_dirty(&self, chunk: &CpuChunk, page_index: u64) -> bool {
        chunk.is_dirty(page_index)
    }

    /// Create the reverse mapping index of `device`.
    pub fn register_device(&self, device: DeviceId, supports_reverse_lookup: bool) -> Result<(), SysmemError> {
        let mut devices = self.devices();

        if devices.contains_key(&device) {
            return Err(SysmemError::invalid_argument(format!(
                "{device} is already registered"
            )));
        }

        devices.insert(
            device,
            Arc::new(ReverseMap::new(
                device,
                supports_reverse_lookup,
                self.config.reverse_map.max_region_size,
            )),
        );
        log::debug!("Registered {device}, reverse lookup {supports_reverse_lookup}");

        Ok(())
    }

    /// Destroy the reverse mapping index of `device`.
    ///
    /// # Panics
    ///
    /// If the index still has entries.
    pub fn unregister_device(&self, device: DeviceId) -> Result<(), SysmemError> {
        let Some(index) = self.devices().remove(&device) else {
            return Err(SysmemError::invalid_argument(format!(
                "{device} isn't registered"
            )));
        };

        assert!(
            index.is_empty(),
            "Reverse map of {device} still has {} entries",
            index.len()
        );
        log::debug!("Unregistered {device}");

        Ok(())
    }

    /// Index `region_size` bytes at `dma_addr` of `device` as backing `virt_addr` in `region`.
    pub fn insert_reverse_mapping(
        &self,
        device: DeviceId,
        dma_addr: u64,
        virt_addr: u64,
        region_size: u64,
        region: &Arc<dyn VaRegion>,
        owner: Processor,
    ) -> Result<(), SysmemError> {
        self.reverse_map(device)?
            .insert(dma_addr, virt_addr, region_size, region, owner)?;

        self.logger().log_reverse_map(Verbosity::Basic, || {
            format!(
                "{device}: indexed {region_size:#x} bytes at {dma_addr:#x} for {virt_addr:#x}, owner {owner:?}"
            )
        });

        Ok(())
    }

    /// Remove the reverse mapping starting at `dma_addr` of `device`.
    ///
    /// # Panics
    ///
    /// If no reverse mapping starts at `dma_addr`.
    pub fn remove_reverse_mapping(&self, device: DeviceId, dma_addr: u64) -> Result<(), SysmemError> {
        self.reverse_map(device)?.remove(dma_addr);
        self.logger().log_reverse_map(Verbosity::Basic, || {
            format!("{device}: removed {dma_addr:#x}")
        });

        Ok(())
    }

    /// Remove the reverse mapping starting at `dma_addr` of `device` if it still exists.
    pub fn remove_reverse_mapping_on_eviction(&self, device: DeviceId, dma_addr: u64) -> Result<bool, SysmemError> {
        let removed = self.reverse_map(device)?.remove_on_eviction(dma_addr);
        self.logger().log_reverse_map(Verbosity::Basic, || {
            format!("{device}: evicted {dma_addr:#x}, present {removed}")
        });

        Ok(removed)
    }

    /// Move the reverse mapping starting at `dma_addr` of `device` to `region`.
    pub fn reparent_reverse_mapping(
        &self,
        device: DeviceId,
        dma_addr: u64,
        region: &Arc<dyn VaRegion>,
    ) -> Result<(), SysmemError> {
        self.reverse_map(device)?.reparent(dma_addr, region);
        self.logger().log_reverse_map(Verbosity::Full, || {
            format!("{device}: reparented {dma_addr:#x} to {:#x}", region.start())
        });

        Ok(())
    }

    /// Split the reverse mapping starting at `dma_addr` of `device` into `new_region_size` pieces.
    pub fn split_reverse_mapping(
        &self,
        device: DeviceId,
        dma_addr: u64,
        new_region_size: u64,
    ) -> Result<(), SysmemError> {
        self.reverse_map(device)?
            .split_entry(dma_addr, new_region_size)?;
        self.logger().log_reverse_map(Verbosity::Full, || {
            format!("{device}: split {dma_addr:#x} into {new_region_size:#x} bytes")
        });

        Ok(())
    }

    /// Merge the reverse mappings covering `new_region_size` bytes at `dma_addr` of `device`.
    pub fn merge_reverse_mappings(
        &self,
        device: DeviceId,
        dma_addr: u64,
        new_region_size: u64,
    ) -> Result<(), SysmemError> {
        self.reverse_map(device)?
            .merge_entries(dma_addr, new_region_size)?;
        self.logger().log_reverse_map(Verbosity::Full, || {
            format!("{device}: merged {new_region_size:#x} bytes at {dma_addr:#x}")
        });

        Ok(())
    }

    /// Resolve `region_size` bytes at `dma_addr` of `device` to at most `max_entries` regions.
    pub fn lookup_reverse_mappings(
        &self,
        device: DeviceId,
        dma_addr: u64,
        region_size: u64,
        max_entries: usize,
    ) -> Result<Vec<ReverseMapping>, SysmemError> {
        let mappings = self
            .reverse_map(device)?
            .lookup_range(dma_addr, region_size, max_entries)?;

        self.logger().log_reverse_map(Verbosity::Full, || {
            format!(
                "{device}: {region_size:#x} bytes at {dma_addr:#x} resolve to {} regions",
                mappings.len()
            )
        });

        Ok(mappings)
    }

    fn reverse_map(&self, device: DeviceId) -> Result<Arc<ReverseMap>, SysmemError> {
        self.devices()
            .get(&device)
            .cloned()
            .ok_or_else(|| SysmemError::invalid_argument(format!("{device} isn't registered")))
    }

    fn log_mapping(&self, action: &str, chunk: &CpuChunk, ctx: DeviceContext, update: MappingUpdate) {
        let verbosity = match update.platform_call {
            true => Verbosity::Basic,
            false => Verbosity::Full,
        };

        self.logger().log_mapping(verbosity, || {
            format!(
                "{action} {} on {ctx} at {:#x}, use count {}",
                chunk.id(),
                update.dma_addr,
                update.use_count
            )
        });
    }

    fn dyn_storage(&self) -> Arc<dyn DmaStorage> {
        self.storage.clone()
    }

    fn logger(&self) -> MutexGuard<'_, SysmemLogger> {
        self.logger.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<DeviceId, Arc<ReverseMap>>> {
        self.devices.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl<S: DmaStorage + 'static> Drop for SysmemManager<S> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        let devices = self
            .devices
            .get_mut()
            .unwrap_or_else(|poison| poison.into_inner());

        for (device, index) in devices.iter() {
            assert!(
                index.is_empty(),
                "Reverse map of {device} still has {} entries at teardown",
                index.len()
            );
        }
    }
}

#[cfg(all(test, feature = "storage-bytes"))]
mod tests {
    use super::*;
    use crate::storage::BytesHostStorage;

    const KB: u64 = 1024;

    fn manager(storage: BytesHostStorage) -> SysmemManager<BytesHostStorage> {
        SysmemManager::with_config(storage, Arc::new(GlobalConfig::default())).unwrap()
    }

    #[test]
    fn alloc_rejects_unconfigured_sizes() {
        let manager = manager(BytesHostStorage::new());

        let err = manager.alloc(512 * KB, AllocFlags::default()).unwrap_err();

        assert!(err.is_invalid_argument());
    }

    #[test]
    fn best_fit_falls_back_to_smaller_sizes() {
        let manager = manager(BytesHostStorage::new().with_max_page_size(64 * KB));

        let chunk = manager
            .alloc_best_fit(2048 * KB, AllocFlags::default())
            .unwrap();

        assert_eq!(chunk.size(), 64 * KB);
    }

    #[test]
    fn best_fit_reports_the_last_failure() {
        let manager = manager(BytesHostStorage::new().with_numa_nodes(1));

        let err = manager
            .alloc_best_fit(64 * KB, AllocFlags::default().on_node(2, true))
            .unwrap_err();

        assert!(err.is_out_of_memory());
    }

    #[test]
    fn external_chunks_need_aligned_pages() {
        let manager = manager(BytesHostStorage::new());
        let page = HostPage::new(crate::storage::PageId::new(), 0x1800, PAGE_SIZE);

        assert!(manager.alloc_external(page).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn devices_register_once() {
        let manager = manager(BytesHostStorage::new());
        let device = DeviceId::new(0);

        manager.register_device(device, true).unwrap();
        assert!(manager.register_device(device, false).is_err());
        manager.unregister_device(device).unwrap();
        assert!(manager.unregister_device(device).is_err());
    }

    #[test]
    fn reverse_map_needs_a_registered_device() {
        let manager = manager(BytesHostStorage::new());

        let err = manager
            .lookup_reverse_mappings(DeviceId::new(3), 0, PAGE_SIZE, 1)
            .unwrap_err();

        assert!(err.is_invalid_argument());
    }
}
