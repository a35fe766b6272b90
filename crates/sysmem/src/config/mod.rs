/// Chunk config module.
pub mod chunk;
/// DMA mapping config module.
pub mod mapping;
/// Reverse mapping index config module.
pub mod reverse_map;

mod base;
mod logger;

pub use base::*;
pub use logger::*;
