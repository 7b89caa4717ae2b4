//! Error types for Carve.

use thiserror::Error;

/// Result type alias using Carve's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Carve operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument was rejected (zero size, bad alignment,
    /// out-of-bounds offset, size mismatch on attach, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `initialize` or `attach` was called on an arena that already has a
    /// mapped region.
    #[error("arena already initialized")]
    AlreadyInitialized,

    /// The arena pool is exhausted, or aligning the request overflowed.
    ///
    /// The arena stays usable after this; the cursor is never advanced by
    /// a failing allocation.
    #[error("arena pool exhausted: requested {requested} bytes, {remaining} bytes remaining")]
    OutOfMemory {
        /// Bytes the caller asked for (before alignment).
        requested: usize,
        /// Bytes left between the cursor and the end of the pool.
        remaining: usize,
    },

    /// Creating or opening the shared-memory object failed.
    #[error("shm open failed for `{name}`: {source}")]
    CreateFailed {
        /// SHM object name.
        name: String,
        /// Underlying errno.
        #[source]
        source: rustix::io::Errno,
    },

    /// Resizing the shared-memory object to the pool size failed.
    #[error("shm resize failed for `{name}`: {source}")]
    ResizeFailed {
        /// SHM object name.
        name: String,
        /// Underlying errno.
        #[source]
        source: rustix::io::Errno,
    },

    /// Mapping the shared-memory object into the address space failed.
    #[error("shm map failed for `{name}`: {source}")]
    MapFailed {
        /// SHM object name.
        name: String,
        /// Underlying errno.
        #[source]
        source: rustix::io::Errno,
    },

    /// A registry, segment, or shared-memory name lookup missed.
    #[error("not found: {0}")]
    NotFound(String),
}
