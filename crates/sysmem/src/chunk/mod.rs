mod base;
mod dirty;
mod mapping;
mod sizes;
mod split;

pub use base::{ChunkId, ChunkKind, CpuChunk};
pub use sizes::ChunkSizes;
pub use split::ErrorInjection;

pub(crate) use mapping::MappingUpdate;
pub(crate) use split::{merge, split};
