//! # Memory-Mapped Storage Files
//!
//! This module implements the two memory-mapped [`StorageFile`] backends and
//! the mapping machinery they share. A storage file exposes a growable byte
//! range backed by an OS file mapped into the process address space; callers
//! reach the bytes through short-lived [`ParallelZone`]/[`AtomicZone`]
//! handles or through the copy-based facade (`read`/`write`/`append`).
//!
//! ## Shared Data Model
//!
//! Both backends keep the same state behind their locks:
//!
//! ```text
//! MapHandle
//! ├── file      OS handle (advisory-locked at a well-known byte)
//! ├── path      original path, or None once path operations are disabled
//! ├── writable  access mode fixed at open
//! ├── flags     options recorded at open (NO_LOCK decides unlock-on-close)
//! └── map       Empty | Active(MmapRaw)
//! ```
//!
//! `Map::Empty` is the tagged stand-in for a zero-length mapping: an empty
//! read-only file has nothing to map, and modeling that as a variant rather
//! than a magic pointer keeps every dereference path honest about it.
//!
//! ## Growth Engine
//!
//! The backing allocation grows geometrically and is re-established in
//! three steps shared by both backends:
//!
//! 1. [`grow_plan`] picks the new backing size:
//!    `align_up(max(min_size, map_size * factor, page_size))`.
//! 2. [`extend_file`] materializes the range with a positional one-byte
//!    write at `new_size - 1`, so sparse filesystems allocate lazily and
//!    non-sparse ones zero-fill.
//! 3. [`remap`] drops the old mapping and maps the new length.
//!
//! A failure in step 3 leaves the file with no mapping at all; the owning
//! backend transitions to its poisoned state, where every operation except
//! `close` fails with a precondition error. Step 2 failures are ordinary
//! errors: the old mapping is still intact and the file remains usable.
//!
//! ## Concurrency Disciplines
//!
//! - [`ParallelMapFile`]: logical and backing sizes are atomics; the
//!   per-file lock is taken shared for every dereference window and
//!   exclusive only around remaps. Append reserves its range with a CAS
//!   loop and never blocks other appenders except during growth.
//! - [`AtomicMapFile`]: every operation takes the lock, writers exclusively
//!   for the whole zone lifetime. Slower under write contention, but a
//!   writer zone is a serialization point callers can do multi-step
//!   read-modify-write under.
//!
//! ## Platform Behavior
//!
//! Mapping, remapping and flushing go through `memmap2` (mmap/munmap/msync
//! on POSIX, CreateFileMapping/MapViewOfFile/FlushViewOfFile on Windows).
//! The advisory lock and the positional extension write live in `crate::sys`.

mod atomic;
mod parallel;

pub use atomic::{AtomicMapFile, AtomicZone};
pub use parallel::{ParallelMapFile, ParallelZone};

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use memmap2::{MmapOptions, MmapRaw};

use crate::error::{absorb, Error, Result};
use crate::file::{AllocStrategy, OpenFlags, MAX_MEMORY_SIZE};
use crate::sys;

/// A mapping or its tagged absence.
#[derive(Debug)]
pub(crate) enum Map {
    Empty,
    Active(MmapRaw),
}

impl Map {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match self {
            Map::Empty => NonNull::<u8>::dangling().as_ptr(),
            Map::Active(raw) => raw.as_mut_ptr(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Map::Empty => 0,
            Map::Active(raw) => raw.len(),
        }
    }
}

/// Everything an open storage file owns besides its size bookkeeping.
#[derive(Debug)]
pub(crate) struct MapHandle {
    pub file: File,
    pub path: Option<PathBuf>,
    pub writable: bool,
    pub flags: OpenFlags,
    pub map: Map,
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

/// Base pointer for a zone at `off`.
pub(crate) fn zone_ptr(map: &Map, off: u64) -> *mut u8 {
    // SAFETY: pointer arithmetic stays in bounds because:
    // 1. Writers validated off + len against the backing size, which never
    //    exceeds the mapping length.
    // 2. Readers validated off against the logical size, which is bounded
    //    by the backing size.
    // 3. Empty maps are only reachable with off == 0, and add(0) on the
    //    dangling placeholder pointer is a no-op.
    unsafe { map.as_ptr().add(off as usize) }
}

/// Picks the next backing size for a growth request.
pub(crate) fn grow_plan(map_size: u64, min_size: u64, inc_factor: f64) -> u64 {
    let geometric = (map_size as f64 * inc_factor) as u64;
    let page = sys::page_size();
    align_up(min_size.max(geometric).max(page), page)
}

/// Picks the backing size for an explicit truncation.
pub(crate) fn truncate_plan(size: u64, alloc: &AllocStrategy) -> u64 {
    let page = sys::page_size();
    align_up(size.max(page).max(alloc.init_size), page)
}

fn map_region(file: &File, len: u64, writable: bool) -> Result<Map> {
    if len == 0 {
        return Ok(Map::Empty);
    }
    let mut options = MmapOptions::new();
    options.len(len as usize);
    let raw = if writable {
        options.map_raw(file)
    } else {
        options.map_raw_read_only(file)
    };
    Ok(Map::Active(raw.map_err(|e| Error::system("mmap", e))?))
}

/// Opens the OS file, takes the advisory lock, sizes the backing allocation
/// and establishes the mapping. Returns the handle plus the logical and
/// backing sizes. An early failure drops the partially built handle, which
/// releases the advisory lock and closes the descriptor in reverse order of
/// acquisition.
pub(crate) fn open_handle(
    path: &Path,
    writable: bool,
    flags: OpenFlags,
    alloc: &AllocStrategy,
) -> Result<(MapHandle, u64, u64)> {
    let mut options = fs::OpenOptions::new();
    options.read(true);
    if writable {
        options.write(true);
        options.create(!flags.contains(OpenFlags::NO_CREATE));
        options.truncate(flags.contains(OpenFlags::TRUNCATE));
    }
    let file = options.open(path).map_err(|e| Error::system("open", e))?;

    if !flags.contains(OpenFlags::NO_LOCK) {
        sys::lock_advisory(&file, writable, !flags.contains(OpenFlags::NO_WAIT))
            .map_err(|e| Error::system("lock", e))?;
    }

    let file_size = file
        .metadata()
        .map_err(|e| Error::system("stat", e))?
        .len();
    if file_size > MAX_MEMORY_SIZE {
        return Err(Error::Infeasible("too large file"));
    }

    let map_size = if writable {
        let target = align_up(file_size.max(alloc.init_size), sys::page_size());
        if target != file_size {
            file.set_len(target)
                .map_err(|e| Error::system("ftruncate", e))?;
        }
        target
    } else {
        file_size
    };

    let map = map_region(&file, map_size, writable)?;
    let handle = MapHandle {
        file,
        path: Some(path.to_path_buf()),
        writable,
        flags,
        map,
    };
    Ok((handle, file_size, map_size))
}

/// Releases everything `open_handle` acquired, shedding the geometric
/// over-allocation so the OS file ends at `logical_size`. Cleanup continues
/// past failures; the first one is returned.
pub(crate) fn close_handle(handle: MapHandle, logical_size: u64) -> Result<()> {
    let MapHandle {
        file,
        path: _,
        writable,
        flags,
        map,
    } = handle;
    let mut status: Result<()> = Ok(());
    let hard = writable && flags.contains(OpenFlags::SYNC_HARD);

    if hard {
        if let Map::Active(raw) = &map {
            let len = logical_size.min(raw.len() as u64) as usize;
            if len > 0 {
                absorb(
                    &mut status,
                    raw.flush_range(0, len).map_err(|e| Error::system("msync", e)),
                );
            }
        }
    }
    drop(map);

    if writable {
        absorb(
            &mut status,
            file.set_len(logical_size)
                .map_err(|e| Error::system("ftruncate", e)),
        );
        if hard {
            absorb(
                &mut status,
                file.sync_all().map_err(|e| Error::system("fsync", e)),
            );
        }
    }

    if !flags.contains(OpenFlags::NO_LOCK) {
        absorb(
            &mut status,
            sys::unlock_advisory(&file).map_err(|e| Error::system("unlock", e)),
        );
    }
    drop(file);
    status
}

/// Materializes backing pages up to `new_size` with a positional write.
/// Failures here are recoverable: the current mapping is untouched.
pub(crate) fn extend_file(file: &File, new_size: u64) -> Result<()> {
    sys::write_zero_at(file, new_size - 1).map_err(|e| Error::system("pwrite", e))
}

/// Replaces the mapping with one of `new_size` bytes. The old mapping is
/// dropped first, so a failure leaves the handle unmapped; callers must
/// poison the file when this returns an error.
pub(crate) fn remap(handle: &mut MapHandle, new_size: u64) -> Result<()> {
    handle.map = Map::Empty;
    handle.map = map_region(&handle.file, new_size, handle.writable)?;
    Ok(())
}

/// Shared tail of `synchronize`: shed the over-allocation, then optionally
/// flush the selected subrange of the mapping and the file itself.
pub(crate) fn synchronize_handle(
    handle: &MapHandle,
    logical_size: u64,
    hard: bool,
    off: u64,
    size: u64,
) -> Result<()> {
    let mut status: Result<()> = Ok(());
    absorb(
        &mut status,
        handle
            .file
            .set_len(logical_size)
            .map_err(|e| Error::system("ftruncate", e)),
    );
    if hard {
        if let Map::Active(raw) = &handle.map {
            let end = if size == 0 {
                logical_size
            } else {
                off.saturating_add(size).min(logical_size)
            };
            let begin = off.min(end);
            let begin = begin - begin % sys::page_size();
            if end > begin {
                absorb(
                    &mut status,
                    raw.flush_range(begin as usize, (end - begin) as usize)
                        .map_err(|e| Error::system("msync", e)),
                );
            }
        }
        absorb(
            &mut status,
            handle
                .file
                .sync_all()
                .map_err(|e| Error::system("fsync", e)),
        );
    }
    status
}
