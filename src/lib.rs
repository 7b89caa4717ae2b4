//! # Carve
//!
//! Shared-memory arena allocation and O(1) offset translation for zero-copy
//! transfer engines.
//!
//! Carve replaces the per-buffer pattern of (create SHM object → size it →
//! map it) with a single large, pre-mapped region out of which individual
//! buffers are carved by a lock-free bump cursor. A remote process that has
//! attached the same region turns an offset published by the owner into a
//! local virtual address by pure arithmetic.
//!
//! ## Features
//!
//! - **Lock-free allocation**: a compare-and-swap bump cursor, no syscalls
//!   and no mutexes on the hot path
//! - **O(1) translation**: `offset ↔ address` is one bounds check plus
//!   pointer arithmetic
//! - **Cross-process**: owner creates and unlinks the named region,
//!   attachers map it read/write and never unlink
//! - **Registry**: one mapping per arena name per process, shared between
//!   subsystems via `Arc` handles
//! - **Transport adapter**: allocate-publish-relocate surface for a
//!   transfer engine, with a thread-local attachment cache
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use carve::prelude::*;
//!
//! // Owner side: carve a buffer out of a 1 GiB pool.
//! let config = ArenaConfig {
//!     pool_size: 1 << 30,
//!     ..ArenaConfig::default()
//! };
//! let arena = ArenaRegistry::global().get_or_create("local", &config)?;
//! let alloc = arena.allocate(4096)?;
//!
//! // Publish (arena.name(), alloc.offset) through the control plane...
//!
//! // Attacher side: translate the published offset.
//! let remote = ArenaRegistry::global().attach(&name, pool_size)?;
//! let addr = remote.translate_offset(alloc.offset, 4096)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod error;
pub mod transport;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::arena::{Allocation, ArenaConfig, ArenaRegistry, ArenaStats, ShmArena};
    pub use crate::error::{Error, Result};
    pub use crate::transport::{
        AdapterConfig, BufferDesc, SegmentDesc, SegmentDirectory, ShmAdapter,
    };
}

pub use error::{Error, Result};
