#![warn(missing_docs)]

//! Host memory chunks backing device-visible data.
//!
//! Chunks are naturally aligned runs of host pages that can be split into logical children and
//! merged back, mapped for DMA by any number of devices, and tracked per page for modification.
//! Each device keeps a reverse mapping index resolving bus addresses back to the virtual memory
//! regions they back.

extern crate alloc;

#[macro_use]
extern crate derive_new;

mod id;

/// Chunk module.
pub mod chunk;
/// Config module.
pub mod config;
/// Error module.
pub mod error;
/// Virtual memory regions owning chunk pages.
pub mod region;
/// Per-device reverse mapping index.
pub mod reverse_map;
/// Host storage module.
pub mod storage;

mod logging;
mod manager;

pub use manager::*;

/// Size of a host page in bytes.
pub const PAGE_SIZE: u64 = 4096;
