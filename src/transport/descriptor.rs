//! Control-plane descriptors for arena-backed buffers.
//!
//! The control plane publishes, for every registered buffer, where it
//! lives: which named arena, at which base offset, and how large the
//! backing region is. Attachers match the arena by name and bounds-check
//! every translation against the published lengths. Descriptors are
//! rkyv-serializable so the control plane can ship them zero-copy.

use std::collections::HashMap;
use std::sync::Mutex;

/// Description of one registered buffer inside a segment.
///
/// # Wire Format
///
/// Serialized with rkyv; the string field makes the record variable
/// length. `region_size` is what an attacher passes to
/// [`ShmArena::attach`](crate::arena::ShmArena::attach) — the rounded
/// pool size, not the buffer length.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct BufferDesc {
    /// Virtual address of the buffer in the owning process.
    ///
    /// Only meaningful to the owner; peers work in offset space.
    pub addr: u64,
    /// Buffer length in bytes.
    pub length: u64,
    /// Name of the arena backing this buffer (host SHM namespace).
    pub arena_name: String,
    /// Base offset of the buffer within the arena.
    pub offset: u64,
    /// Total size of the backing region, for attach-time verification.
    pub region_size: u64,
}

/// Description of one remote segment: its identity plus every buffer the
/// owner registered.
#[derive(Clone, Debug, Default, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct SegmentDesc {
    /// Control-plane identity of the segment.
    pub segment_id: u64,
    /// Registered buffers, in registration order.
    pub buffers: Vec<BufferDesc>,
}

impl SegmentDesc {
    /// Find the buffer whose offset interval contains `[offset,
    /// offset + length)`.
    pub fn find_buffer(&self, offset: u64, length: u64) -> Option<&BufferDesc> {
        let end = offset.checked_add(length)?;
        self.buffers.iter().find(|buffer| {
            offset >= buffer.offset
                && buffer
                    .offset
                    .checked_add(buffer.length)
                    .is_some_and(|buffer_end| end <= buffer_end)
        })
    }
}

/// Source of remote segment descriptors.
///
/// This is the seam to the control plane: the transfer engine's metadata
/// service implements it, and the adapter only ever asks "what buffers
/// does segment N have". Implementations must be cheap enough to call on
/// the relocate slow path (once per peer, not per request).
pub trait SegmentDirectory: Send + Sync {
    /// Descriptor for `segment_id`, or `None` if unknown.
    fn segment(&self, segment_id: u64) -> Option<SegmentDesc>;
}

/// An in-process [`SegmentDirectory`] backed by a mutex-guarded map.
///
/// Suitable for single-host deployments where all peers share a control
/// process, and for tests standing in for the real metadata service.
#[derive(Default)]
pub struct StaticDirectory {
    segments: Mutex<HashMap<u64, SegmentDesc>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a segment descriptor.
    pub fn publish(&self, desc: SegmentDesc) {
        self.lock().insert(desc.segment_id, desc);
    }

    /// Append one buffer to a segment, creating the segment on first use.
    pub fn publish_buffer(&self, segment_id: u64, buffer: BufferDesc) {
        let mut segments = self.lock();
        let desc = segments.entry(segment_id).or_insert_with(|| SegmentDesc {
            segment_id,
            ..SegmentDesc::default()
        });
        desc.buffers.push(buffer);
    }

    /// Remove a segment descriptor.
    pub fn withdraw(&self, segment_id: u64) {
        self.lock().remove(&segment_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SegmentDesc>> {
        self.segments
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl SegmentDirectory for StaticDirectory {
    fn segment(&self, segment_id: u64) -> Option<SegmentDesc> {
        self.lock().get(&segment_id).cloned()
    }
}
