//! Arena-backed transport adapter.
//!
//! The shim a transfer engine consumes: allocate local memory out of the
//! arena, publish `(arena_name, offset)` with every registered buffer,
//! and relocate `(segment, offset, length)` targets submitted by peers
//! into local addresses for the copy.
//!
//! # Hot path
//!
//! Relocation runs once per transfer request. The first request against a
//! new peer attaches its arena (directory lookup + `shm_open` + `mmap`)
//! under the adapter mutex; every later request resolves through a
//! thread-local `segment → arena` cache and costs one bounds check plus
//! an add. Contending on the process-wide mutex per request would
//! dominate the latency budget at high request rates.

use crate::arena::{
    Allocation, ArenaConfig, ArenaRegistry, ShmArena, DEFAULT_ALIGNMENT, DEFAULT_NAME_PREFIX,
    DEFAULT_POOL_SIZE,
};
use crate::error::{Error, Result};
use crate::transport::descriptor::{BufferDesc, SegmentDirectory};
use crate::transport::direct::DirectAllocator;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Global counter for adapter instance IDs (thread-local cache keying).
static ADAPTER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread `(adapter_id, segment_id) → arena` cache. Entries carry
    /// the adapter generation they were filled under; uninstall bumps the
    /// generation, invalidating stale entries lazily.
    static REMOTE_CACHE: RefCell<HashMap<(u64, u64), (u64, Arc<ShmArena>)>> =
        RefCell::new(HashMap::new());
}

/// Adapter configuration, with the documented defaults: 64 GiB pool,
/// 64-byte alignment, large pages on, prefaulting on.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Local arena pool size in bytes.
    pub pool_size_bytes: usize,
    /// Minimum allocation alignment. Must be a power of two.
    pub alignment_bytes: usize,
    /// Back the pool with 2 MiB huge pages (downgrade is logged).
    pub use_large_pages: bool,
    /// Touch every page at install so foreign DMA never takes a lazy
    /// fault.
    pub prefault_pages: bool,
    /// Use the arena. When false, every buffer gets its own region (the
    /// `DISABLE_ARENA=1` escape hatch).
    pub use_arena: bool,
    /// SHM name prefix for the local arena and direct regions.
    pub shm_name_prefix: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            pool_size_bytes: DEFAULT_POOL_SIZE,
            alignment_bytes: DEFAULT_ALIGNMENT,
            use_large_pages: true,
            prefault_pages: true,
            use_arena: true,
            shm_name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl AdapterConfig {
    /// Defaults, with `DISABLE_ARENA=1` from the environment honoured.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if std::env::var("DISABLE_ARENA").as_deref() == Ok("1") {
            tracing::warn!("DISABLE_ARENA=1: arena bypassed, using per-buffer regions");
            config.use_arena = false;
        }
        config
    }

    fn arena_config(&self) -> ArenaConfig {
        ArenaConfig {
            pool_size: self.pool_size_bytes,
            alignment: self.alignment_bytes,
            shm_name_prefix: self.shm_name_prefix.clone(),
            use_large_pages: self.use_large_pages,
            prefault_pages: self.prefault_pages,
        }
    }
}

/// Direction of a transfer relative to the local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOpcode {
    /// Copy from the target into the local buffer.
    Read,
    /// Copy from the local buffer into the target.
    Write,
}

/// One synchronous copy against a registered remote buffer.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest {
    /// Direction of the copy.
    pub opcode: TransferOpcode,
    /// Local buffer taking part in the copy.
    pub source: *mut u8,
    /// Control-plane identity of the target segment.
    pub target_segment: u64,
    /// Offset of the target within its arena.
    pub target_offset: u64,
    /// Bytes to copy.
    pub length: u64,
}

/// Local allocation backends.
enum Backend {
    /// Bump allocations out of one shared arena.
    Arena(Arc<ShmArena>),
    /// One region per buffer (arena bypassed).
    Direct(DirectAllocator),
}

/// Installed-adapter state, swapped atomically on install/uninstall.
struct AdapterState {
    segment_name: String,
    directory: Arc<dyn SegmentDirectory>,
    backend: Backend,
    /// Remote attachments, keyed by segment ID. Slow path only.
    remote_arenas: Mutex<HashMap<u64, Arc<ShmArena>>>,
    /// Outstanding local allocations, keyed by address, so `free_local`
    /// is well-formed even though the arena cannot reclaim.
    allocations: Mutex<HashMap<u64, Allocation>>,
}

/// The transport adapter.
///
/// One adapter per local segment. Install it with a
/// [`SegmentDirectory`] (the control plane) and an [`AdapterConfig`];
/// then `allocate_local` produces descriptors for the control plane to
/// publish, and `relocate`/`transfer` resolve peer requests.
pub struct ShmAdapter {
    adapter_id: u64,
    /// Bumped on uninstall; thread-local cache entries from older
    /// generations are ignored.
    generation: AtomicU64,
    state: RwLock<Option<Arc<AdapterState>>>,
}

impl ShmAdapter {
    /// Create an uninstalled adapter.
    pub fn new() -> Self {
        Self {
            adapter_id: ADAPTER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            generation: AtomicU64::new(0),
            state: RwLock::new(None),
        }
    }

    /// Bring the adapter up: create the local arena (via the process
    /// registry, keyed by `segment_name`) or the direct allocator.
    pub fn install(
        &self,
        segment_name: &str,
        directory: Arc<dyn SegmentDirectory>,
        config: AdapterConfig,
    ) -> Result<()> {
        let mut slot = self.write_state();
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let backend = if config.use_arena {
            let arena =
                ArenaRegistry::global().get_or_create(segment_name, &config.arena_config())?;
            tracing::info!(
                segment = segment_name,
                pool_size = arena.pool_size(),
                arena = arena.name().as_deref().unwrap_or(""),
                "shm adapter installed with arena backend"
            );
            Backend::Arena(arena)
        } else {
            tracing::info!(
                segment = segment_name,
                "shm adapter installed with direct (per-buffer) backend"
            );
            Backend::Direct(DirectAllocator::new(
                &config.shm_name_prefix,
                config.alignment_bytes,
                config.use_large_pages,
                config.prefault_pages,
            ))
        };

        *slot = Some(Arc::new(AdapterState {
            segment_name: segment_name.to_string(),
            directory,
            backend,
            remote_arenas: Mutex::new(HashMap::new()),
            allocations: Mutex::new(HashMap::new()),
        }));
        Ok(())
    }

    /// Tear the adapter down: drop allocation records, remote
    /// attachments, and the registry reference to the local arena.
    ///
    /// Arena memory itself is not reclaimed; peers that attached the
    /// local arena keep their mappings.
    pub fn uninstall(&self) -> Result<()> {
        let state = {
            let mut slot = self.write_state();
            slot.take()
        };
        let Some(state) = state else {
            return Ok(());
        };

        // Invalidate thread-local cache entries everywhere.
        self.generation.fetch_add(1, Ordering::Relaxed);

        if matches!(state.backend, Backend::Arena(_)) {
            // Drop the registry's reference; the arena lives on while any
            // other handle (including remote attachments by peers) exists.
            let _ = ArenaRegistry::global().remove(&state.segment_name);
        }

        tracing::info!(segment = %state.segment_name, "shm adapter uninstalled");
        Ok(())
    }

    /// Whether the adapter is installed.
    pub fn is_installed(&self) -> bool {
        self.read_state().is_some()
    }

    /// Allocate `size` bytes of local memory and build the descriptor the
    /// control plane publishes for it.
    pub fn allocate_local(&self, size: usize) -> Result<BufferDesc> {
        let state = self.state()?;
        match &state.backend {
            Backend::Arena(arena) => {
                let alloc = arena.allocate(size)?;
                let desc = BufferDesc {
                    addr: alloc.addr as u64,
                    length: alloc.size as u64,
                    arena_name: arena.name().unwrap_or_default(),
                    offset: alloc.offset,
                    region_size: arena.pool_size() as u64,
                };
                state.lock_allocations().insert(desc.addr, alloc);
                tracing::debug!(
                    size,
                    offset = alloc.offset,
                    "allocated local memory from arena"
                );
                Ok(desc)
            }
            Backend::Direct(direct) => direct.allocate(size),
        }
    }

    /// Release the adapter's record of a local allocation.
    ///
    /// Arena-backed memory is not reclaimed (the bump cursor never
    /// rewinds); direct-backed memory is unmapped and unlinked.
    pub fn free_local(&self, addr: u64) -> Result<()> {
        let state = self.state()?;
        match &state.backend {
            Backend::Arena(arena) => match state.lock_allocations().remove(&addr) {
                Some(alloc) => {
                    arena.deallocate(&alloc);
                    Ok(())
                }
                None => Err(Error::InvalidArgument(format!(
                    "address {:#x} was not allocated by this transport",
                    addr
                ))),
            },
            Backend::Direct(direct) => direct.free(addr),
        }
    }

    /// Register a buffer descriptor. Arena-backed buffers need no
    /// per-buffer transport state, so this only validates and logs.
    pub fn add_memory_buffer(&self, desc: &BufferDesc) -> Result<()> {
        let state = self.state()?;
        if let Backend::Arena(arena) = &state.backend {
            if desc.arena_name == arena.name().unwrap_or_default()
                && !arena.owns(desc.addr as *const u8)
            {
                return Err(Error::InvalidArgument(format!(
                    "address {:#x} is not inside arena `{}`",
                    desc.addr, desc.arena_name
                )));
            }
        }
        tracing::debug!(
            arena = %desc.arena_name,
            offset = desc.offset,
            length = desc.length,
            "registered arena-backed buffer"
        );
        Ok(())
    }

    /// Remove a buffer descriptor. A no-op for arena-backed transport.
    pub fn remove_memory_buffer(&self, _desc: &BufferDesc) -> Result<()> {
        self.state().map(|_| ())
    }

    /// Resolve a `(segment, offset, length)` target into a local address.
    ///
    /// Fast path: thread-local cache hit, then one bounds check plus an
    /// add. Slow path (first request per peer per thread): process-wide
    /// map under the adapter mutex; first request per peer overall also
    /// walks the directory and attaches the remote arena through the
    /// registry.
    pub fn relocate(&self, target_segment: u64, offset: u64, length: u64) -> Result<*mut u8> {
        let generation = self.generation.load(Ordering::Relaxed);
        let cache_key = (self.adapter_id, target_segment);

        let cached = REMOTE_CACHE.with(|cache| {
            cache.borrow().get(&cache_key).and_then(|(cache_generation, arena)| {
                (*cache_generation == generation).then(|| Arc::clone(arena))
            })
        });
        if let Some(arena) = cached {
            return arena.translate_offset(offset, length as usize);
        }

        let state = self.state()?;
        let arena = {
            let mut remotes = state.lock_remotes();
            match remotes.get(&target_segment) {
                Some(arena) => Arc::clone(arena),
                None => {
                    let desc = state.directory.segment(target_segment).ok_or_else(|| {
                        Error::NotFound(format!("segment {}", target_segment))
                    })?;
                    let buffer = desc.find_buffer(offset, length).ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "range [{}, {}) of segment {} is not in a registered buffer",
                            offset,
                            offset.saturating_add(length),
                            target_segment
                        ))
                    })?;

                    let arena = ArenaRegistry::global()
                        .attach(&buffer.arena_name, buffer.region_size as usize)?;
                    tracing::info!(
                        segment = target_segment,
                        arena = %buffer.arena_name,
                        "attached remote arena"
                    );
                    remotes.insert(target_segment, Arc::clone(&arena));
                    arena
                }
            }
        };

        REMOTE_CACHE.with(|cache| {
            cache
                .borrow_mut()
                .insert(cache_key, (generation, Arc::clone(&arena)));
        });

        arena.translate_offset(offset, length as usize)
    }

    /// Execute one synchronous DRAM copy against a relocated target.
    ///
    /// Returns the number of bytes transferred.
    ///
    /// # Safety contract
    ///
    /// `request.source` must be valid for `request.length` bytes in the
    /// direction of the copy; the target side is bounds-checked by
    /// [`relocate`](Self::relocate).
    pub fn transfer(&self, request: &TransferRequest) -> Result<u64> {
        let target = self.relocate(
            request.target_segment,
            request.target_offset,
            request.length,
        )?;
        let length = request.length as usize;

        // SAFETY: target spans `length` bytes of the attached mapping
        // (bounds-checked by relocate); source validity is the caller's
        // contract. The ranges never overlap: target lies in a shared
        // mapping, source in the caller's local buffer.
        unsafe {
            match request.opcode {
                TransferOpcode::Read => {
                    std::ptr::copy_nonoverlapping(target, request.source, length)
                }
                TransferOpcode::Write => {
                    std::ptr::copy_nonoverlapping(request.source, target, length)
                }
            }
        }
        Ok(request.length)
    }

    /// Handle to the local arena (arena backend only).
    pub fn local_arena(&self) -> Option<Arc<ShmArena>> {
        let state = self.read_state().clone()?;
        match &state.backend {
            Backend::Arena(arena) => Some(Arc::clone(arena)),
            Backend::Direct(_) => None,
        }
    }

    fn state(&self) -> Result<Arc<AdapterState>> {
        self.read_state()
            .clone()
            .ok_or_else(|| Error::InvalidArgument("adapter not installed".into()))
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<AdapterState>>> {
        self.state.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<AdapterState>>> {
        self.state
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl AdapterState {
    fn lock_allocations(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Allocation>> {
        self.allocations
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn lock_remotes(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<ShmArena>>> {
        self.remote_arenas
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Default for ShmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShmAdapter {
    fn drop(&mut self) {
        let _ = self.uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::descriptor::StaticDirectory;

    const MIB: usize = 1024 * 1024;

    fn test_config() -> AdapterConfig {
        AdapterConfig {
            pool_size_bytes: 16 * MIB,
            use_large_pages: false,
            prefault_pages: false,
            shm_name_prefix: "/carve_test_adapter_".to_string(),
            ..AdapterConfig::default()
        }
    }

    fn unique_segment(tag: &str) -> String {
        use std::sync::atomic::AtomicU32;
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "adapter-test-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_install_uninstall() {
        let adapter = ShmAdapter::new();
        let directory = Arc::new(StaticDirectory::new());
        assert!(!adapter.is_installed());

        adapter
            .install(&unique_segment("install"), directory, test_config())
            .unwrap();
        assert!(adapter.is_installed());
        assert!(adapter.local_arena().is_some());

        adapter.uninstall().unwrap();
        assert!(!adapter.is_installed());
        // Uninstall of an uninstalled adapter is fine.
        adapter.uninstall().unwrap();
    }

    #[test]
    fn test_double_install_fails() {
        let adapter = ShmAdapter::new();
        let directory = Arc::new(StaticDirectory::new());
        adapter
            .install(&unique_segment("double"), Arc::clone(&directory) as Arc<dyn SegmentDirectory>, test_config())
            .unwrap();
        assert!(matches!(
            adapter.install(&unique_segment("double"), directory, test_config()),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_allocate_local_publishes_descriptor() {
        let adapter = ShmAdapter::new();
        adapter
            .install(
                &unique_segment("alloc"),
                Arc::new(StaticDirectory::new()),
                test_config(),
            )
            .unwrap();

        let desc = adapter.allocate_local(4096).unwrap();
        let arena = adapter.local_arena().unwrap();
        assert_eq!(desc.arena_name, arena.name().unwrap());
        assert_eq!(desc.offset, 0);
        assert!(desc.length >= 4096);
        assert_eq!(desc.region_size as usize, arena.pool_size());
        assert!(arena.owns(desc.addr as *const u8));

        adapter.add_memory_buffer(&desc).unwrap();
        adapter.remove_memory_buffer(&desc).unwrap();
    }

    #[test]
    fn test_free_local() {
        let adapter = ShmAdapter::new();
        adapter
            .install(
                &unique_segment("free"),
                Arc::new(StaticDirectory::new()),
                test_config(),
            )
            .unwrap();

        let desc = adapter.allocate_local(1024).unwrap();
        adapter.free_local(desc.addr).unwrap();
        // Double free: the record is gone.
        assert!(matches!(
            adapter.free_local(desc.addr),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_operations_require_install() {
        let adapter = ShmAdapter::new();
        assert!(adapter.allocate_local(64).is_err());
        assert!(adapter.free_local(0).is_err());
        assert!(adapter.relocate(1, 0, 64).is_err());
    }

    #[test]
    fn test_relocate_unknown_segment_fails() {
        let adapter = ShmAdapter::new();
        adapter
            .install(
                &unique_segment("unknown"),
                Arc::new(StaticDirectory::new()),
                test_config(),
            )
            .unwrap();
        assert!(matches!(
            adapter.relocate(99, 0, 64),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_relocate_round_trip() {
        // Owner adapter allocates and publishes; requester adapter
        // relocates the published offset and reads the bytes back.
        let directory = Arc::new(StaticDirectory::new());

        let owner = ShmAdapter::new();
        owner
            .install(
                &unique_segment("owner"),
                Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
                test_config(),
            )
            .unwrap();
        let desc = owner.allocate_local(4096).unwrap();
        // SAFETY: the allocation spans at least 4096 bytes.
        unsafe { std::ptr::write_bytes(desc.addr as *mut u8, 0xCD, 4096) };
        directory.publish_buffer(1, desc.clone());

        let requester = ShmAdapter::new();
        requester
            .install(
                &unique_segment("requester"),
                Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
                test_config(),
            )
            .unwrap();

        let addr = requester.relocate(1, desc.offset, 4096).unwrap();
        // SAFETY: relocate bounds-checked a 4096-byte range.
        let slice = unsafe { std::slice::from_raw_parts(addr, 4096) };
        assert!(slice.iter().all(|&b| b == 0xCD));

        // Second call hits the thread-local cache and resolves identically.
        let again = requester.relocate(1, desc.offset, 4096).unwrap();
        assert_eq!(again, addr);

        // Out-of-region ranges are rejected.
        assert!(requester.relocate(1, desc.region_size, 1).is_err());
    }

    #[test]
    fn test_config_from_env_escape_hatch() {
        std::env::set_var("DISABLE_ARENA", "1");
        assert!(!AdapterConfig::from_env().use_arena);
        std::env::remove_var("DISABLE_ARENA");
        assert!(AdapterConfig::from_env().use_arena);
    }

    #[test]
    fn test_direct_backend() {
        let mut config = test_config();
        config.use_arena = false;

        let adapter = ShmAdapter::new();
        adapter
            .install(
                &unique_segment("direct"),
                Arc::new(StaticDirectory::new()),
                config,
            )
            .unwrap();
        assert!(adapter.local_arena().is_none());

        let desc = adapter.allocate_local(8192).unwrap();
        assert_eq!(desc.offset, 0);
        adapter.free_local(desc.addr).unwrap();
    }
}
