#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

//! Common types shared by the sysmem crates.

extern crate alloc;

#[macro_use]
extern crate derive_new;

/// Backtrace module to build error reports.
pub mod backtrace;

/// Device identities used as mapping-table and reverse-index keys.
pub mod device;
