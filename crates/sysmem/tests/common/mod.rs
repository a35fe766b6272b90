use std::sync::Arc;

use sysmem::{
    PAGE_SIZE, SysmemManager,
    config::GlobalConfig,
    region::{ManagedRegion, VaRegion},
    storage::BytesHostStorage,
};
use sysmem_common::device::DeviceId;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;

pub const DEVICE: DeviceId = DeviceId { index: 0 };
pub const OTHER_DEVICE: DeviceId = DeviceId { index: 1 };

pub type TestManager = SysmemManager<BytesHostStorage>;

/// A manager over heap pages producing the given chunk sizes.
pub fn test_manager(sizes: &[u64]) -> TestManager {
    test_manager_with_storage(sizes, BytesHostStorage::new())
}

pub fn test_manager_with_storage(sizes: &[u64], storage: BytesHostStorage) -> TestManager {
    let mut config = GlobalConfig::default();
    config.chunk.allocation_sizes = sizes.to_vec();

    SysmemManager::with_config(storage, Arc::new(config)).unwrap()
}

/// A region of `num_pages` pages, along with the handle the reverse map indexes.
pub fn test_region(start: u64, num_pages: u64) -> (Arc<ManagedRegion>, Arc<dyn VaRegion>) {
    let region = Arc::new(ManagedRegion::new(start, num_pages * PAGE_SIZE));
    let indexed: Arc<dyn VaRegion> = region.clone();

    (region, indexed)
}
