//! Bump-cursor arena over a shared region.
//!
//! One [`ShmArena`] owns or attaches to one named shared-memory region and
//! carves allocations out of it with a lock-free compare-and-swap cursor.
//! Offsets are the portable identity of an allocation: any process that
//! attached the same region converts an offset to a local address with one
//! bounds check and an add.
//!
//! # Concurrency
//!
//! `initialize` and `attach` are serialized by an internal mutex and
//! publish the mapped base with release ordering; `allocate`,
//! `translate_offset`, `offset_of`, and `owns` never block. The cursor is
//! process-local: allocation is a single-producer-per-process contract,
//! attachers translate but do not carve.
//!
//! # Reclamation
//!
//! There is none. The cursor only advances, `deallocate` is a no-op, and
//! `reset` rewinds the whole arena at once. Returned pointers are valid
//! for the lifetime of the arena that produced them; the arena does not
//! refcount them.

use crate::arena::config::{align_up_u64, ArenaConfig, DEFAULT_ALIGNMENT};
use crate::arena::region::SharedRegion;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Global counter for generating process-unique arena IDs.
static ARENA_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Generate a process-unique arena ID.
fn next_arena_id() -> u32 {
    ARENA_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An immutable record of one successful allocation.
///
/// `addr` is only meaningful in the process that allocated; `offset` is
/// the portable identity a peer feeds to
/// [`ShmArena::translate_offset`]. A null `addr` denotes an invalid
/// handle (see [`Allocation::is_valid`]).
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// Local virtual address of the allocation.
    pub addr: *mut u8,
    /// Offset from the arena base.
    pub offset: u64,
    /// Aligned size actually consumed (≥ the requested size).
    pub size: usize,
    /// ID of the arena that produced this allocation.
    pub arena_id: u32,
}

impl Allocation {
    /// The invalid handle: null address, zero everything.
    pub const fn invalid() -> Self {
        Self {
            addr: std::ptr::null_mut(),
            offset: 0,
            size: 0,
            arena_id: 0,
        }
    }

    /// Whether this handle refers to a real allocation.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.addr.is_null()
    }
}

impl Default for Allocation {
    fn default() -> Self {
        Self::invalid()
    }
}

// SAFETY: the pointer targets a shared mapping that outlives the handle
// only by the arena-lifetime contract; synchronizing access to the bytes
// is the caller's responsibility, the handle itself is plain data.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// Point-in-time arena counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total pool size in bytes.
    pub pool_size: usize,
    /// Bytes consumed by the cursor so far.
    pub allocated_bytes: u64,
    /// High-water mark of `allocated_bytes`.
    pub peak_allocated: u64,
    /// Number of successful allocations.
    pub num_allocations: u64,
    /// Number of failed (out-of-memory) allocations.
    pub num_failed_allocs: u64,
}

/// Slow-path state, guarded by the init mutex.
#[derive(Debug, Default)]
struct ArenaState {
    region: Option<SharedRegion>,
}

/// A shared-memory arena: one pre-mapped region, one bump cursor.
///
/// Create with [`ShmArena::new`], then bring it up with either
/// [`initialize`](Self::initialize) (owner: creates and later unlinks the
/// region) or [`attach`](Self::attach) (attacher: maps an existing region,
/// never unlinks). Handles are shared as `Arc<ShmArena>`; see
/// [`ArenaRegistry`](crate::arena::ArenaRegistry).
#[derive(Debug)]
pub struct ShmArena {
    /// Process-unique ID, tagged onto every allocation.
    arena_id: u32,
    /// Region + owner bookkeeping; also serializes initialize/attach.
    state: Mutex<ArenaState>,
    /// Mapped base. Published with release after all metadata stores;
    /// read with acquire everywhere. Null while uninitialized.
    base: AtomicPtr<u8>,
    /// Pool size in bytes. Stored before `base` is published.
    pool_size: AtomicUsize,
    /// Minimum allocation alignment. Stored before `base` is published.
    alignment: AtomicUsize,
    /// Offset of the next free byte. Only advances via successful CAS.
    cursor: AtomicU64,
    peak_allocated: AtomicU64,
    num_allocations: AtomicU64,
    num_failed_allocs: AtomicU64,
}

impl ShmArena {
    /// Create an uninitialized arena.
    pub fn new() -> Self {
        Self {
            arena_id: next_arena_id(),
            state: Mutex::new(ArenaState::default()),
            base: AtomicPtr::new(std::ptr::null_mut()),
            pool_size: AtomicUsize::new(0),
            alignment: AtomicUsize::new(0),
            cursor: AtomicU64::new(0),
            peak_allocated: AtomicU64::new(0),
            num_allocations: AtomicU64::new(0),
            num_failed_allocs: AtomicU64::new(0),
        }
    }

    /// Create the backing region and become its owner.
    ///
    /// Performs exactly one exclusive SHM create, one resize to the pool
    /// size rounded up to a large-page multiple, and one mapping. Under
    /// concurrent calls exactly one succeeds; the rest see
    /// [`Error::AlreadyInitialized`].
    pub fn initialize(&self, config: &ArenaConfig) -> Result<()> {
        let mut state = self.lock_state();
        if state.region.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let alignment = config.validate()?;
        let pool_size = config.rounded_pool_size()?;
        if !config.shm_name_prefix.starts_with('/') {
            return Err(Error::InvalidArgument(format!(
                "shm name prefix `{}` must start with '/'",
                config.shm_name_prefix
            )));
        }

        let name = format!(
            "{}{}_{}",
            config.shm_name_prefix,
            std::process::id(),
            self.arena_id
        );
        let region = SharedRegion::create(
            &name,
            pool_size,
            config.use_large_pages,
            config.prefault_pages,
        )?;

        self.publish(&mut state, region, pool_size, alignment);
        Ok(())
    }

    /// Map an existing region created by another arena (usually in another
    /// process).
    ///
    /// Fails with [`Error::InvalidArgument`] if the region's actual size
    /// differs from `expected_size`, and with [`Error::NotFound`] if no
    /// region of that name exists.
    pub fn attach(&self, name: &str, expected_size: usize) -> Result<()> {
        let mut state = self.lock_state();
        if state.region.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let region = SharedRegion::open(name, expected_size)?;
        self.publish(&mut state, region, expected_size, DEFAULT_ALIGNMENT);
        Ok(())
    }

    /// Store metadata, then publish `base` with release so any acquire
    /// load of a non-null base observes finalized pool size and alignment.
    fn publish(
        &self,
        state: &mut ArenaState,
        region: SharedRegion,
        pool_size: usize,
        alignment: usize,
    ) {
        self.cursor.store(0, Ordering::Relaxed);
        self.peak_allocated.store(0, Ordering::Relaxed);
        self.num_allocations.store(0, Ordering::Relaxed);
        self.num_failed_allocs.store(0, Ordering::Relaxed);
        self.pool_size.store(pool_size, Ordering::Relaxed);
        self.alignment.store(alignment, Ordering::Relaxed);

        let base = region.base().as_ptr();
        state.region = Some(region);
        self.base.store(base, Ordering::Release);
    }

    /// Carve `size` bytes with the arena's minimum alignment.
    pub fn allocate(&self, size: usize) -> Result<Allocation> {
        self.allocate_aligned(size, 0)
    }

    /// Carve `size` bytes aligned to `max(arena alignment, alignment)`.
    ///
    /// `alignment` must be zero (use the arena minimum) or a power of two.
    /// The *offset* is aligned, not just the size, so the contract holds
    /// even when the cursor sits on an odd boundary left by a previous
    /// smaller-alignment allocation.
    ///
    /// Lock-free: a failed allocation never advances the cursor, so a
    /// concurrent thread can never observe a cursor beyond the pool.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<Allocation> {
        let base = self.base.load(Ordering::Acquire);
        if base.is_null() {
            return Err(Error::InvalidArgument("arena not initialized".into()));
        }
        if size == 0 {
            return Err(Error::InvalidArgument("cannot allocate 0 bytes".into()));
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }

        let pool_size = self.pool_size.load(Ordering::Relaxed) as u64;
        let align = self.alignment.load(Ordering::Relaxed).max(alignment) as u64;

        let Some(aligned_size) = align_up_u64(size as u64, align) else {
            return Err(self.fail_alloc(size, pool_size));
        };

        loop {
            let raw = self.cursor.load(Ordering::Relaxed);
            let Some(aligned_off) = align_up_u64(raw, align) else {
                return Err(self.fail_alloc(size, pool_size));
            };
            let Some(next) = aligned_off.checked_add(aligned_size) else {
                return Err(self.fail_alloc(size, pool_size));
            };
            if next > pool_size {
                return Err(self.fail_alloc(size, pool_size));
            }

            if self
                .cursor
                .compare_exchange_weak(raw, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                self.num_allocations.fetch_add(1, Ordering::Relaxed);
                self.update_peak(next);

                // SAFETY: aligned_off + aligned_size <= pool_size, so the
                // result is inside the mapping.
                let addr = unsafe { base.add(aligned_off as usize) };
                return Ok(Allocation {
                    addr,
                    offset: aligned_off,
                    size: aligned_size as usize,
                    arena_id: self.arena_id,
                });
            }
        }
    }

    /// Monotonic-max update of the high-water mark.
    fn update_peak(&self, candidate: u64) {
        let mut peak = self.peak_allocated.load(Ordering::Relaxed);
        while candidate > peak {
            match self.peak_allocated.compare_exchange_weak(
                peak,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    /// Count the failure and build the error; warn once per 100 failures.
    fn fail_alloc(&self, requested: usize, pool_size: u64) -> Error {
        let failed = self.num_failed_allocs.fetch_add(1, Ordering::Relaxed);
        let remaining = pool_size.saturating_sub(self.cursor.load(Ordering::Relaxed)) as usize;
        if failed % 100 == 0 {
            tracing::warn!(requested, remaining, "arena out of memory");
        }
        Error::OutOfMemory {
            requested,
            remaining,
        }
    }

    /// Release an allocation. A no-op: the bump cursor never rewinds for
    /// individual allocations. Callers needing reclamation must
    /// [`reset`](Self::reset) the whole arena.
    pub fn deallocate(&self, _alloc: &Allocation) {}

    /// Translate an offset published by a peer into a local address.
    ///
    /// O(1): one overflow-safe bounds check and an add. Fails with
    /// [`Error::InvalidArgument`] when `[offset, offset + len)` does not
    /// lie inside the pool; `translate_offset(pool_size, 0)` is rejected
    /// as past-the-end.
    pub fn translate_offset(&self, offset: u64, len: usize) -> Result<*mut u8> {
        let base = self.base.load(Ordering::Acquire);
        if base.is_null() {
            return Err(Error::InvalidArgument("arena not initialized".into()));
        }
        let pool_size = self.pool_size.load(Ordering::Relaxed) as u64;

        if offset >= pool_size {
            return Err(Error::InvalidArgument(format!(
                "offset {} out of bounds (pool size {})",
                offset, pool_size
            )));
        }
        let end = offset.checked_add(len as u64).ok_or_else(|| {
            Error::InvalidArgument(format!("offset {} + len {} overflows", offset, len))
        })?;
        if end > pool_size {
            return Err(Error::InvalidArgument(format!(
                "range [{}, {}) out of bounds (pool size {})",
                offset, end, pool_size
            )));
        }

        // SAFETY: offset < pool_size, so the result is inside the mapping.
        Ok(unsafe { base.add(offset as usize) })
    }

    /// Inverse of [`translate_offset`](Self::translate_offset): the offset
    /// of a local address, or `None` if the address is not in this arena.
    pub fn offset_of(&self, addr: *const u8) -> Option<u64> {
        let base = self.base.load(Ordering::Acquire);
        if base.is_null() || addr.is_null() {
            return None;
        }
        let pool_size = self.pool_size.load(Ordering::Relaxed);
        let base = base as usize;
        let addr = addr as usize;
        if addr < base || addr >= base + pool_size {
            return None;
        }
        Some((addr - base) as u64)
    }

    /// Whether `addr` lies within this arena's mapping.
    #[inline]
    pub fn owns(&self, addr: *const u8) -> bool {
        self.offset_of(addr).is_some()
    }

    /// Rewind the cursor to the beginning of the pool.
    ///
    /// Only safe when the caller guarantees no outstanding allocation is
    /// still in use; the arena cannot enforce this.
    pub fn reset(&self) -> Result<()> {
        if self.base.load(Ordering::Acquire).is_null() {
            return Err(Error::InvalidArgument("arena not initialized".into()));
        }
        tracing::warn!(
            arena_id = self.arena_id,
            "resetting arena, outstanding allocations are invalidated"
        );
        self.cursor.store(0, Ordering::Release);
        Ok(())
    }

    /// Snapshot of the arena counters.
    ///
    /// After writers quiesce, `allocated_bytes` equals the cursor and
    /// `peak_allocated >= allocated_bytes`.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            pool_size: self.pool_size.load(Ordering::Relaxed),
            allocated_bytes: self.cursor.load(Ordering::Relaxed),
            peak_allocated: self.peak_allocated.load(Ordering::Relaxed),
            num_allocations: self.num_allocations.load(Ordering::Relaxed),
            num_failed_allocs: self.num_failed_allocs.load(Ordering::Relaxed),
        }
    }

    /// Process-unique arena ID.
    #[inline]
    pub fn id(&self) -> u32 {
        self.arena_id
    }

    /// SHM object name, once initialized or attached.
    pub fn name(&self) -> Option<String> {
        self.lock_state()
            .region
            .as_ref()
            .map(|r| r.name().to_string())
    }

    /// Whether this arena created (and will unlink) its region.
    pub fn is_owner(&self) -> bool {
        self.lock_state()
            .region
            .as_ref()
            .map(SharedRegion::is_owner)
            .unwrap_or(false)
    }

    /// Whether a region has been published.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.base.load(Ordering::Acquire).is_null()
    }

    /// Mapped base address (null while uninitialized).
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.load(Ordering::Acquire)
    }

    /// Pool size in bytes (after large-page rounding).
    #[inline]
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    /// Minimum allocation alignment.
    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment.load(Ordering::Relaxed)
    }

    /// Unmap the region, close the descriptor, and (owner only) unlink
    /// the name. Safe to call multiple times; also runs on drop.
    pub fn teardown(&self) {
        let mut state = self.lock_state();
        if state.region.is_some() {
            self.base.store(std::ptr::null_mut(), Ordering::Release);
            state.region = None;
        }
    }

    /// Poison-tolerant lock: a panicking holder leaves the state usable
    /// for teardown.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Default for ShmArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShmArena {
    fn drop(&mut self) {
        self.teardown();
    }
}
