#![forbid(unsafe_code)]
//! kfs public API.
//!
//! Re-exports the engine from `kfs-core`. Downstream users depend on this
//! crate rather than on the layered internals.

pub use kfs_core::*;
