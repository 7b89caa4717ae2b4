//! Transport-facing integration surface.
//!
//! The transfer engine never touches the arena directly; it goes through
//! the [`ShmAdapter`], which owns three concerns:
//!
//! - **Allocate**: carve local buffers out of the arena and hand back the
//!   [`BufferDesc`] the control plane publishes.
//! - **Name**: every descriptor carries the arena's SHM name, the buffer's
//!   base offset, and the region size an attacher verifies.
//! - **Translate**: resolve `(segment, offset, length)` targets from peers
//!   into local addresses, attaching each peer's arena once and caching
//!   the handle thread-locally.
//!
//! The engine's batching, RPC, and control-plane code live elsewhere and
//! consume only this surface.

mod adapter;
mod descriptor;
mod direct;

pub use adapter::{AdapterConfig, ShmAdapter, TransferOpcode, TransferRequest};
pub use descriptor::{BufferDesc, SegmentDesc, SegmentDirectory, StaticDirectory};
