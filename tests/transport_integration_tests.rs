//! Integration tests for the transport adapter.
//!
//! These stand up two adapters in one process — an owner that allocates
//! and publishes, and a requester that relocates and copies — with a
//! StaticDirectory playing the control plane.

use carve::arena::ArenaRegistry;
use carve::transport::{
    AdapterConfig, SegmentDirectory, ShmAdapter, StaticDirectory, TransferOpcode, TransferRequest,
};
use carve::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

const MIB: usize = 1024 * 1024;

fn test_config() -> AdapterConfig {
    AdapterConfig {
        pool_size_bytes: 16 * MIB,
        use_large_pages: false,
        prefault_pages: false,
        shm_name_prefix: "/carve_test_transport_".to_string(),
        ..AdapterConfig::default()
    }
}

fn unique_segment(tag: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "transport-test-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn unique_segment_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1000);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Owner/Requester Round Trips
// ============================================================================

/// Owner writes a pattern, publishes the descriptor, requester attaches
/// by name and reads the same bytes through the relocated address.
#[test]
fn test_owner_publish_requester_read() {
    let directory = Arc::new(StaticDirectory::new());
    let segment_id = unique_segment_id();

    let owner = ShmAdapter::new();
    owner
        .install(
            &unique_segment("owner-pub"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();

    let desc = owner.allocate_local(4096).unwrap();
    // SAFETY: the allocation spans at least 4096 bytes.
    unsafe { std::ptr::write_bytes(desc.addr as *mut u8, 0xCD, 4096) };
    owner.add_memory_buffer(&desc).unwrap();
    directory.publish_buffer(segment_id, desc.clone());

    let requester = ShmAdapter::new();
    requester
        .install(
            &unique_segment("requester-read"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();

    let addr = requester.relocate(segment_id, desc.offset, 4096).unwrap();
    // SAFETY: relocate bounds-checked a 4096-byte range.
    let bytes = unsafe { std::slice::from_raw_parts(addr, 4096) };
    assert!(bytes.iter().all(|&b| b == 0xCD));
}

/// Write transfer pushes local bytes into the remote buffer; read
/// transfer pulls them back.
#[test]
fn test_transfer_write_then_read() {
    let directory = Arc::new(StaticDirectory::new());
    let segment_id = unique_segment_id();

    let owner = ShmAdapter::new();
    owner
        .install(
            &unique_segment("owner-xfer"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();
    let remote = owner.allocate_local(8192).unwrap();
    directory.publish_buffer(segment_id, remote.clone());

    let requester = ShmAdapter::new();
    requester
        .install(
            &unique_segment("requester-xfer"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();

    // Push a local pattern into the remote buffer.
    let mut outbound = vec![0x5Au8; 8192];
    let written = requester
        .transfer(&TransferRequest {
            opcode: TransferOpcode::Write,
            source: outbound.as_mut_ptr(),
            target_segment: segment_id,
            target_offset: remote.offset,
            length: 8192,
        })
        .unwrap();
    assert_eq!(written, 8192);

    // The owner sees the bytes at its own address.
    // SAFETY: the allocation spans 8192 bytes.
    let owner_view = unsafe { std::slice::from_raw_parts(remote.addr as *const u8, 8192) };
    assert!(owner_view.iter().all(|&b| b == 0x5A));

    // Pull them back into a fresh local buffer.
    let mut inbound = vec![0u8; 8192];
    let read = requester
        .transfer(&TransferRequest {
            opcode: TransferOpcode::Read,
            source: inbound.as_mut_ptr(),
            target_segment: segment_id,
            target_offset: remote.offset,
            length: 8192,
        })
        .unwrap();
    assert_eq!(read, 8192);
    assert_eq!(inbound, outbound);
}

/// Several buffers in one segment relocate independently.
#[test]
fn test_multiple_buffers_per_segment() {
    let directory = Arc::new(StaticDirectory::new());
    let segment_id = unique_segment_id();

    let owner = ShmAdapter::new();
    owner
        .install(
            &unique_segment("owner-multi"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();

    let first = owner.allocate_local(4096).unwrap();
    let second = owner.allocate_local(4096).unwrap();
    // SAFETY: each allocation spans 4096 bytes.
    unsafe {
        std::ptr::write_bytes(first.addr as *mut u8, 0x11, 4096);
        std::ptr::write_bytes(second.addr as *mut u8, 0x22, 4096);
    }
    directory.publish_buffer(segment_id, first.clone());
    directory.publish_buffer(segment_id, second.clone());

    let requester = ShmAdapter::new();
    requester
        .install(
            &unique_segment("requester-multi"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();

    let addr_first = requester.relocate(segment_id, first.offset, 4096).unwrap();
    let addr_second = requester.relocate(segment_id, second.offset, 4096).unwrap();
    // SAFETY: both ranges were bounds-checked by relocate.
    unsafe {
        assert_eq!(*addr_first, 0x11);
        assert_eq!(*addr_second, 0x22);
    }
}

/// The relocate fast path holds up across threads: each thread fills its
/// own cache, all resolve to the same mapping.
#[test]
fn test_relocate_from_many_threads() {
    let directory = Arc::new(StaticDirectory::new());
    let segment_id = unique_segment_id();

    let owner = ShmAdapter::new();
    owner
        .install(
            &unique_segment("owner-mt"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();
    let desc = owner.allocate_local(4096).unwrap();
    // SAFETY: the allocation spans 4096 bytes.
    unsafe { std::ptr::write_bytes(desc.addr as *mut u8, 0x77, 4096) };
    directory.publish_buffer(segment_id, desc.clone());

    let requester = Arc::new(ShmAdapter::new());
    requester
        .install(
            &unique_segment("requester-mt"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let requester = Arc::clone(&requester);
            let offset = desc.offset;
            thread::spawn(move || {
                for _ in 0..100 {
                    let addr = requester.relocate(segment_id, offset, 4096).unwrap();
                    // SAFETY: bounds-checked range.
                    let byte = unsafe { std::ptr::read(addr) };
                    assert_eq!(byte, 0x77);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

// ============================================================================
// Direct (Arena-Bypass) Mode
// ============================================================================

/// With the arena bypassed, per-buffer regions flow through the same
/// publish/relocate path.
#[test]
fn test_direct_mode_round_trip() {
    let directory = Arc::new(StaticDirectory::new());
    let segment_id = unique_segment_id();

    let mut owner_config = test_config();
    owner_config.use_arena = false;

    let owner = ShmAdapter::new();
    owner
        .install(
            &unique_segment("owner-direct"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            owner_config,
        )
        .unwrap();
    assert!(owner.local_arena().is_none());

    let desc = owner.allocate_local(4096).unwrap();
    assert_eq!(desc.offset, 0);
    // SAFETY: the region spans at least 4096 bytes.
    unsafe { std::ptr::write_bytes(desc.addr as *mut u8, 0x3C, 4096) };
    directory.publish_buffer(segment_id, desc.clone());

    let requester = ShmAdapter::new();
    requester
        .install(
            &unique_segment("requester-direct"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();

    let addr = requester.relocate(segment_id, 0, 4096).unwrap();
    // SAFETY: bounds-checked range.
    let bytes = unsafe { std::slice::from_raw_parts(addr, 4096) };
    assert!(bytes.iter().all(|&b| b == 0x3C));
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Uninstall drops the registry reference and invalidates the adapter;
/// peers that already attached keep working.
#[test]
fn test_uninstall_releases_registry_reference() {
    let directory = Arc::new(StaticDirectory::new());
    let segment_id = unique_segment_id();
    let segment_name = unique_segment("owner-uninstall");

    let owner = ShmAdapter::new();
    owner
        .install(&segment_name, Arc::clone(&directory) as Arc<dyn SegmentDirectory>, test_config())
        .unwrap();
    let desc = owner.allocate_local(4096).unwrap();
    // SAFETY: the allocation spans 4096 bytes.
    unsafe { std::ptr::write_bytes(desc.addr as *mut u8, 0x99, 4096) };
    directory.publish_buffer(segment_id, desc.clone());

    let requester = ShmAdapter::new();
    requester
        .install(
            &unique_segment("requester-uninstall"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();
    let addr = requester.relocate(segment_id, desc.offset, 4096).unwrap();

    owner.uninstall().unwrap();
    assert!(!owner.is_installed());
    assert!(ArenaRegistry::global().get(&segment_name).is_none());
    assert!(matches!(
        owner.allocate_local(64),
        Err(Error::InvalidArgument(_))
    ));

    // The requester's attachment holds the mapping open.
    // SAFETY: the attached mapping is still alive via the requester.
    let byte = unsafe { std::ptr::read(addr) };
    assert_eq!(byte, 0x99);
}

/// Relocation against an unpublished range fails without touching state.
#[test]
fn test_relocate_unregistered_range_fails() {
    let directory = Arc::new(StaticDirectory::new());
    let segment_id = unique_segment_id();

    let owner = ShmAdapter::new();
    owner
        .install(
            &unique_segment("owner-miss"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();
    let desc = owner.allocate_local(4096).unwrap();
    directory.publish_buffer(segment_id, desc.clone());

    let requester = ShmAdapter::new();
    requester
        .install(
            &unique_segment("requester-miss"),
            Arc::clone(&directory) as Arc<dyn SegmentDirectory>,
            test_config(),
        )
        .unwrap();

    // A range outside every registered buffer never attaches.
    assert!(matches!(
        requester.relocate(segment_id, desc.region_size, 64),
        Err(Error::InvalidArgument(_))
    ));
    // An unknown segment is a directory miss.
    assert!(matches!(
        requester.relocate(segment_id + 100_000, 0, 64),
        Err(Error::NotFound(_))
    ));
}
