//! Raw POSIX shared-memory region lifecycle.
//!
//! A [`SharedRegion`] is one named SHM object mapped read/write into the
//! current process. It knows nothing about allocation; it only owns the
//! create/open → size → map → unmap/close/unlink sequence and the
//! owner/attacher asymmetry: the creator unlinks the name on drop, an
//! attacher never does.

use crate::arena::config::PAGE_SIZE;
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate, Mode};
use rustix::mm::{madvise, mmap, munmap, Advice, MapFlags, ProtFlags};
use rustix::shm;
use std::ptr::NonNull;

/// `MAP_HUGE_2MB`: huge-page size is encoded in bits 26..31 of the flags.
const MAP_HUGE_2MB_BITS: u32 = 21 << 26;

/// A mapped, named shared-memory region.
///
/// The region is a flat byte array with no in-band header; all metadata
/// lives in process-local memory. Dropping the region unmaps it and closes
/// the descriptor; if this process created the object, the name is also
/// unlinked. Already-attached peers retain their mappings until they
/// themselves unmap.
#[derive(Debug)]
pub(crate) struct SharedRegion {
    /// SHM object name (leading slash, host SHM namespace).
    name: String,
    /// Descriptor, closed on drop.
    #[allow(dead_code)]
    fd: OwnedFd,
    /// Base of the mapping.
    base: NonNull<u8>,
    /// Mapping length in bytes.
    len: usize,
    /// Whether this process created the object (and must unlink it).
    owner: bool,
}

impl SharedRegion {
    /// Create a new region: exclusive `shm_open`, `ftruncate` to `len`,
    /// map read/write.
    ///
    /// `len` must already be rounded to a large-page multiple. When
    /// `use_large_pages` is set the mapping is first attempted with 2 MiB
    /// huge pages and downgraded (with a logged warning) if the host
    /// refuses it. When `prefault` is set the mapping is created with
    /// `MAP_POPULATE` and then walked with an explicit write pass, so
    /// population holds even on hosts that treat `MAP_POPULATE` as a hint.
    pub(crate) fn create(
        name: &str,
        len: usize,
        use_large_pages: bool,
        prefault: bool,
    ) -> Result<Self> {
        let mode = Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::ROTH;
        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            mode,
        )
        .map_err(|source| Error::CreateFailed {
            name: name.to_string(),
            source,
        })?;

        if let Err(source) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = shm::unlink(name);
            return Err(Error::ResizeFailed {
                name: name.to_string(),
                source,
            });
        }

        let mut flags = MapFlags::SHARED;
        if prefault {
            flags |= MapFlags::POPULATE;
        }

        let base = if use_large_pages {
            let huge_flags =
                flags | MapFlags::from_bits_retain(MapFlags::HUGETLB.bits() | MAP_HUGE_2MB_BITS);
            // SAFETY: fresh mapping of a region we just created and sized;
            // no existing memory is aliased.
            match unsafe {
                mmap(
                    std::ptr::null_mut(),
                    len,
                    ProtFlags::READ | ProtFlags::WRITE,
                    huge_flags,
                    &fd,
                    0,
                )
            } {
                Ok(ptr) => Some(ptr),
                Err(errno) => {
                    tracing::warn!(
                        name,
                        %errno,
                        "huge-page mapping refused, downgrading to base pages"
                    );
                    None
                }
            }
        } else {
            None
        };

        let base = match base {
            Some(ptr) => ptr,
            // SAFETY: as above, with base pages.
            None => match unsafe {
                mmap(
                    std::ptr::null_mut(),
                    len,
                    ProtFlags::READ | ProtFlags::WRITE,
                    flags,
                    &fd,
                    0,
                )
            } {
                Ok(ptr) => ptr,
                Err(source) => {
                    drop(fd);
                    let _ = shm::unlink(name);
                    return Err(Error::MapFailed {
                        name: name.to_string(),
                        source,
                    });
                }
            },
        };

        let base = match NonNull::new(base.cast::<u8>()) {
            Some(ptr) => ptr,
            None => {
                drop(fd);
                let _ = shm::unlink(name);
                return Err(Error::MapFailed {
                    name: name.to_string(),
                    source: rustix::io::Errno::FAULT,
                });
            }
        };

        // The mapping must not be duplicated into forked children.
        // SAFETY: advising the mapping we just created.
        if let Err(errno) = unsafe { madvise(base.as_ptr().cast(), len, Advice::LinuxDontFork) } {
            tracing::debug!(name, %errno, "madvise(DONTFORK) not honoured");
        }

        let region = Self {
            name: name.to_string(),
            fd,
            base,
            len,
            owner: true,
        };

        if prefault {
            region.prefault();
        }

        tracing::info!(
            name,
            len,
            base = ?region.base.as_ptr(),
            "created shm region"
        );

        Ok(region)
    }

    /// Open an existing region by name, verify its size, and map it.
    ///
    /// The attacher records `owner = false` and will never unlink the name.
    pub(crate) fn open(name: &str, expected_len: usize) -> Result<Self> {
        let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty()).map_err(|source| {
            if source == rustix::io::Errno::NOENT {
                Error::NotFound(name.to_string())
            } else {
                Error::CreateFailed {
                    name: name.to_string(),
                    source,
                }
            }
        })?;

        let stat = fstat(&fd).map_err(|source| Error::CreateFailed {
            name: name.to_string(),
            source,
        })?;
        if stat.st_size as u64 != expected_len as u64 {
            return Err(Error::InvalidArgument(format!(
                "arena size mismatch for `{}`: expected {}, got {}",
                name, expected_len, stat.st_size
            )));
        }

        // SAFETY: fresh mapping of an existing object whose size was just
        // verified; no existing memory is aliased.
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                expected_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|source| Error::MapFailed {
            name: name.to_string(),
            source,
        })?;

        let base = NonNull::new(base.cast::<u8>()).ok_or_else(|| Error::MapFailed {
            name: name.to_string(),
            source: rustix::io::Errno::FAULT,
        })?;

        tracing::info!(
            name,
            len = expected_len,
            base = ?base.as_ptr(),
            "attached shm region"
        );

        Ok(Self {
            name: name.to_string(),
            fd,
            base,
            len: expected_len,
            owner: false,
        })
    }

    /// Base of the mapping.
    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Mapping length in bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// SHM object name.
    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Whether this process created the object.
    #[inline]
    pub(crate) fn is_owner(&self) -> bool {
        self.owner
    }

    /// Write to the first byte of every page, committing physical memory.
    fn prefault(&self) {
        let ptr = self.base.as_ptr();
        for offset in (0..self.len).step_by(PAGE_SIZE) {
            // SAFETY: offset < len by loop bound; the mapping is read/write.
            unsafe {
                std::ptr::write_volatile(ptr.add(offset), 0);
            }
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in create/open.
        unsafe {
            let _ = munmap(self.base.as_ptr().cast(), self.len);
        }
        if self.owner {
            let _ = shm::unlink(&self.name);
        }
        // fd closed when OwnedFd drops.
    }
}

// SAFETY: SharedRegion is Send + Sync because the mapping is process-wide,
// the fd is kernel-reference-counted, and all mutation of the bytes is the
// caller's responsibility.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

/// Unlink every SHM object whose name starts with `prefix`.
///
/// Out-of-band cleanup for regions orphaned by an owner that crashed
/// before unlinking. Returns the number of names removed. Never call this
/// while arenas under `prefix` are live on this host.
pub fn purge_prefix(prefix: &str) -> Result<usize> {
    let stem = prefix.trim_start_matches('/');
    if stem.is_empty() {
        return Err(Error::InvalidArgument("empty shm name prefix".into()));
    }

    let mut removed = 0;
    let entries = std::fs::read_dir("/dev/shm")
        .map_err(|e| Error::InvalidArgument(format!("cannot scan /dev/shm: {}", e)))?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with(stem) {
            let shm_name = format!("/{}", file_name);
            if shm::unlink(shm_name.as_str()).is_ok() {
                tracing::info!(name = %shm_name, "unlinked orphaned shm region");
                removed += 1;
            }
        }
    }
    Ok(removed)
}
