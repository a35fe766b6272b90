mod base;

// Heap backed host storage with simulated IOVA windows, used to run the core without a device.
#[cfg(feature = "storage-bytes")]
mod bytes_host;
#[cfg(feature = "storage-bytes")]
pub use bytes_host::*;

pub use base::*;
