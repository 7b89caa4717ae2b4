//! Direct per-buffer mapping, the arena bypass.
//!
//! With `DISABLE_ARENA=1` the adapter falls back to the pre-arena
//! pattern: one named SHM region per buffer. Each region still honours
//! the configured alignment and large-page rounding, and publishes a
//! descriptor with `offset = 0`, so peers relocate against it through
//! exactly the same attach/translate path as arena-backed buffers.

use crate::arena::config::{align_up, LARGE_PAGE_SIZE, PAGE_SIZE};
use crate::arena::region::SharedRegion;
use crate::error::{Error, Result};
use crate::transport::descriptor::BufferDesc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Allocates one shared region per buffer.
pub(crate) struct DirectAllocator {
    shm_name_prefix: String,
    alignment: usize,
    use_large_pages: bool,
    prefault_pages: bool,
    regions: Mutex<HashMap<u64, SharedRegion>>,
    counter: AtomicU64,
}

impl DirectAllocator {
    pub(crate) fn new(
        shm_name_prefix: &str,
        alignment: usize,
        use_large_pages: bool,
        prefault_pages: bool,
    ) -> Self {
        Self {
            shm_name_prefix: shm_name_prefix.to_string(),
            alignment,
            use_large_pages,
            prefault_pages,
            regions: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    /// Create a dedicated region for one buffer.
    pub(crate) fn allocate(&self, size: usize) -> Result<BufferDesc> {
        if size == 0 {
            return Err(Error::InvalidArgument("cannot allocate 0 bytes".into()));
        }

        let page = if self.use_large_pages {
            LARGE_PAGE_SIZE
        } else {
            PAGE_SIZE
        };
        let region_size = align_up(size, self.alignment)
            .and_then(|s| align_up(s, page))
            .ok_or(Error::OutOfMemory {
                requested: size,
                remaining: 0,
            })?;

        let name = format!(
            "{}direct_{}_{}",
            self.shm_name_prefix,
            std::process::id(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        );
        let region = SharedRegion::create(
            &name,
            region_size,
            self.use_large_pages,
            self.prefault_pages,
        )?;

        let addr = region.base().as_ptr() as u64;
        let desc = BufferDesc {
            addr,
            length: size as u64,
            arena_name: name,
            offset: 0,
            region_size: region_size as u64,
        };

        self.lock().insert(addr, region);
        Ok(desc)
    }

    /// Drop (and unlink) the region backing `addr`.
    pub(crate) fn free(&self, addr: u64) -> Result<()> {
        match self.lock().remove(&addr) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidArgument(format!(
                "address {:#x} was not allocated by this transport",
                addr
            ))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SharedRegion>> {
        self.regions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
