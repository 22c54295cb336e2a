//! # Parallel Map File
//!
//! [`ParallelMapFile`] is the storage backend tuned for many concurrent
//! small accesses. Its contract: data access never takes an exclusive lock,
//! and append serializes only on growth.
//!
//! ## Concurrency Protocol
//!
//! The file keeps three pieces of synchronized state:
//!
//! ```text
//! ParallelMapFile
//! ├── state: RwLock<FileState>   handle + mapping; exclusive only for
//! │                              open/close/remap/truncate/synchronize
//! ├── file_size: AtomicU64       logical size (next append offset)
//! └── map_size: AtomicU64        backing allocation published by remap
//! ```
//!
//! Every dereference of the mapping happens under the shared side of the
//! lock, held for the lifetime of a [`ParallelZone`]. Remap runs under the
//! exclusive side. That pairing is the publication barrier: a reader that
//! holds the shared lock can never observe a half-replaced mapping, and a
//! remap can never pull pages out from under a live zone.
//!
//! ## Lock-Free Append
//!
//! Appenders reserve their range with a CAS loop before touching the map:
//!
//! ```text
//! loop {
//!     old = file_size
//!     end = old + size
//!     ensure map_size >= end        (exclusive lock only if growth needed)
//!     CAS file_size: old -> end     (winner owns [old, end))
//! }
//! ```
//!
//! Two concurrent appenders therefore always receive disjoint ranges, and
//! pure writes to already-backed pages proceed fully in parallel. The
//! exclusive lock is held only inside the growth path, which the geometric
//! allocation policy makes rare.
//!
//! ## What Zones Do Not Provide
//!
//! Zones pin the mapping, not the bytes: two writer zones over overlapping
//! ranges are caller-policed, exactly like two raw pointers into the same
//! buffer. Engines that need per-range exclusion layer it above this file
//! or use `AtomicMapFile`.
//!
//! ## Poisoning
//!
//! A failed remap leaves the file without a mapping. The OS handle is
//! released and the file transitions to a poisoned state in which every
//! operation except `close` fails with a precondition error; the close
//! resets the instance for reuse.

use std::fs;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, error, trace, warn};

use super::{
    close_handle, extend_file, grow_plan, open_handle, remap, synchronize_handle, truncate_plan,
    zone_ptr, MapHandle,
};
use crate::error::{Error, Result};
use crate::file::{AllocStrategy, OpenFlags, StorageFile};
use crate::sys;

#[derive(Debug)]
enum Repr {
    Closed,
    Open(MapHandle),
    Poisoned(String),
}

impl Repr {
    fn open_ref(&self) -> Result<&MapHandle> {
        match self {
            Repr::Open(handle) => Ok(handle),
            Repr::Closed => Err(Error::Precondition("not opened file")),
            Repr::Poisoned(_) => Err(Error::Precondition("poisoned file")),
        }
    }

    fn open_mut(&mut self) -> Result<&mut MapHandle> {
        match self {
            Repr::Open(handle) => Ok(handle),
            Repr::Closed => Err(Error::Precondition("not opened file")),
            Repr::Poisoned(_) => Err(Error::Precondition("poisoned file")),
        }
    }
}

#[derive(Debug)]
struct FileState {
    repr: Repr,
    alloc: AllocStrategy,
}

/// Memory-mapped storage file with lock-free append and shared-lock reads.
#[derive(Debug)]
pub struct ParallelMapFile {
    state: RwLock<FileState>,
    file_size: AtomicU64,
    map_size: AtomicU64,
}

impl Default for ParallelMapFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelMapFile {
    /// Creates a closed instance with the default allocation strategy.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FileState {
                repr: Repr::Closed,
                alloc: AllocStrategy::default(),
            }),
            file_size: AtomicU64::new(0),
            map_size: AtomicU64::new(0),
        }
    }

    /// Returns the backing allocation size. Grows geometrically ahead of the
    /// logical size and is shed by `close`/`synchronize`/`truncate`.
    pub fn map_size(&self) -> Result<u64> {
        let state = self.state.read();
        state.repr.open_ref()?;
        Ok(self.map_size.load(Ordering::Acquire))
    }

    /// Acquires a zone over `[off, off + size)`.
    ///
    /// Writer zones with `off = None` append: the range is reserved at the
    /// logical end and the reservation is disjoint from every concurrent
    /// append. Writer zones with an explicit offset extend the logical size
    /// to cover their end. Reader zones are clamped to the logical end.
    ///
    /// The zone holds the shared remap lock until dropped, so `close`,
    /// `truncate` and growth remaps wait for outstanding zones.
    pub fn make_zone(
        &self,
        writable: bool,
        off: Option<u64>,
        size: usize,
    ) -> Result<ParallelZone<'_>> {
        loop {
            let guard = self.state.read();
            let handle = guard.repr.open_ref()?;
            if writable && !handle.writable {
                return Err(Error::Precondition("not writable file"));
            }

            if !writable {
                let off = match off {
                    Some(off) => off,
                    None => return Err(Error::Precondition("negative offset")),
                };
                let logical = self.file_size.load(Ordering::Acquire);
                if off > logical {
                    return Err(Error::Infeasible("excessive offset"));
                }
                let len = (logical - off).min(size as u64) as usize;
                let ptr = zone_ptr(&handle.map, off);
                return Ok(ParallelZone {
                    ptr,
                    off,
                    len,
                    writable: false,
                    _guard: guard,
                });
            }

            // Writers reserve their range before dereferencing anything.
            let grow_target = match off {
                None => {
                    let mut old = self.file_size.load(Ordering::Acquire);
                    loop {
                        let end = match old.checked_add(size as u64) {
                            Some(end) => end,
                            None => return Err(Error::Infeasible("excessive size")),
                        };
                        if end > self.map_size.load(Ordering::Acquire) {
                            break end;
                        }
                        match self.file_size.compare_exchange_weak(
                            old,
                            end,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                let ptr = zone_ptr(&handle.map, old);
                                return Ok(ParallelZone {
                                    ptr,
                                    off: old,
                                    len: size,
                                    writable: true,
                                    _guard: guard,
                                });
                            }
                            Err(current) => old = current,
                        }
                    }
                }
                Some(off) => {
                    let end = match off.checked_add(size as u64) {
                        Some(end) => end,
                        None => return Err(Error::Infeasible("excessive size")),
                    };
                    if end <= self.map_size.load(Ordering::Acquire) {
                        self.file_size.fetch_max(end, Ordering::AcqRel);
                        let ptr = zone_ptr(&handle.map, off);
                        return Ok(ParallelZone {
                            ptr,
                            off,
                            len: size,
                            writable: true,
                            _guard: guard,
                        });
                    }
                    end
                }
            };

            drop(guard);
            self.grow_to(grow_target)?;
        }
    }

    /// Grows the backing allocation to at least `min_size` under the
    /// exclusive lock, re-checking after acquisition so concurrent growers
    /// coalesce into one remap.
    fn grow_to(&self, min_size: u64) -> Result<()> {
        let mut state = self.state.write();
        if min_size <= self.map_size.load(Ordering::Acquire) {
            return Ok(());
        }
        let inc_factor = state.alloc.inc_factor;
        let handle = state.repr.open_mut()?;
        let old_map = self.map_size.load(Ordering::Relaxed);
        let new_map = grow_plan(old_map, min_size, inc_factor);
        extend_file(&handle.file, new_map)?;
        match remap(handle, new_map) {
            Ok(()) => {
                self.map_size.store(new_map, Ordering::Release);
                trace!(old_map, new_map, "grew parallel map file");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "remap failed during growth, poisoning file");
                state.repr = Repr::Poisoned(err.to_string());
                Err(err)
            }
        }
    }
}

impl StorageFile for ParallelMapFile {
    fn open(&self, path: &Path, writable: bool, flags: OpenFlags) -> Result<()> {
        let mut state = self.state.write();
        if !matches!(state.repr, Repr::Closed) {
            return Err(Error::Precondition("opened file"));
        }
        let (handle, file_size, map_size) = open_handle(path, writable, flags, &state.alloc)?;
        self.file_size.store(file_size, Ordering::Release);
        self.map_size.store(map_size, Ordering::Release);
        debug!(
            path = %path.display(),
            writable,
            file_size,
            map_size,
            "opened parallel map file"
        );
        state.repr = Repr::Open(handle);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        match std::mem::replace(&mut state.repr, Repr::Closed) {
            Repr::Closed => Err(Error::Precondition("not opened file")),
            Repr::Poisoned(_) => {
                self.file_size.store(0, Ordering::Release);
                self.map_size.store(0, Ordering::Release);
                Ok(())
            }
            Repr::Open(handle) => {
                let logical = self.file_size.swap(0, Ordering::AcqRel);
                self.map_size.store(0, Ordering::Release);
                debug!(logical, "closed parallel map file");
                close_handle(handle, logical)
            }
        }
    }

    fn read(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let zone = self.make_zone(false, Some(off), buf.len())?;
        if zone.len() != buf.len() {
            return Err(Error::Infeasible("excessive size"));
        }
        buf.copy_from_slice(zone.as_slice());
        Ok(())
    }

    fn write(&self, off: u64, buf: &[u8]) -> Result<()> {
        let mut zone = self.make_zone(true, Some(off), buf.len())?;
        zone.as_mut_slice().copy_from_slice(buf);
        Ok(())
    }

    fn append(&self, buf: &[u8]) -> Result<u64> {
        let mut zone = self.make_zone(true, None, buf.len())?;
        zone.as_mut_slice().copy_from_slice(buf);
        Ok(zone.offset())
    }

    fn expand(&self, inc_size: usize) -> Result<u64> {
        let zone = self.make_zone(true, None, inc_size)?;
        Ok(zone.offset())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let mut state = self.state.write();
        let alloc = state.alloc;
        let handle = state.repr.open_mut()?;
        if !handle.writable {
            return Err(Error::Precondition("not writable file"));
        }
        let new_map = truncate_plan(size, &alloc);
        handle
            .file
            .set_len(new_map)
            .map_err(|e| Error::system("ftruncate", e))?;
        match remap(handle, new_map) {
            Ok(()) => {
                self.map_size.store(new_map, Ordering::Release);
                self.file_size.store(size, Ordering::Release);
                debug!(size, map_size = new_map, "truncated parallel map file");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "remap failed during truncate, poisoning file");
                state.repr = Repr::Poisoned(err.to_string());
                Err(err)
            }
        }
    }

    fn truncate_fakely(&self, size: u64) -> Result<()> {
        let state = self.state.read();
        state.repr.open_ref()?;
        if size > self.map_size.load(Ordering::Acquire) {
            return Err(Error::Infeasible("unable to increase the file size"));
        }
        self.file_size.store(size, Ordering::Release);
        Ok(())
    }

    fn synchronize(&self, hard: bool, off: u64, size: u64) -> Result<()> {
        let state = self.state.write();
        let handle = state.repr.open_ref()?;
        if !handle.writable {
            return Err(Error::Precondition("not writable file"));
        }
        let logical = self.file_size.load(Ordering::Acquire);
        self.map_size.store(logical, Ordering::Release);
        trace!(hard, logical, "synchronizing parallel map file");
        synchronize_handle(handle, logical, hard, off, size)
    }

    fn get_size(&self) -> Result<u64> {
        let state = self.state.read();
        state.repr.open_ref()?;
        Ok(self.file_size.load(Ordering::Acquire))
    }

    fn set_allocation_strategy(&self, init_size: u64, inc_factor: f64) -> Result<()> {
        if init_size == 0 || inc_factor < 1.0 {
            return Err(Error::Precondition("invalid allocation strategy"));
        }
        let mut state = self.state.write();
        if !matches!(state.repr, Repr::Closed) {
            return Err(Error::Precondition("opened file"));
        }
        state.alloc = AllocStrategy {
            init_size,
            inc_factor,
        };
        Ok(())
    }

    fn copy_properties(&self, other: &dyn StorageFile) -> Result<()> {
        let alloc = self.state.read().alloc;
        other.set_allocation_strategy(alloc.init_size, alloc.inc_factor)
    }

    fn get_path(&self) -> Result<PathBuf> {
        let state = self.state.read();
        let handle = state.repr.open_ref()?;
        handle
            .path
            .clone()
            .ok_or(Error::Precondition("disabled path operation"))
    }

    fn rename(&self, new_path: &Path) -> Result<()> {
        let mut state = self.state.write();
        let handle = state.repr.open_mut()?;
        let current = handle
            .path
            .as_ref()
            .ok_or(Error::Precondition("disabled path operation"))?;
        fs::rename(current, new_path).map_err(|e| Error::system("rename", e))?;
        handle.path = Some(new_path.to_path_buf());
        Ok(())
    }

    fn disable_path_operations(&self) -> Result<()> {
        let mut state = self.state.write();
        let handle = state.repr.open_mut()?;
        handle.path = None;
        Ok(())
    }

    fn lock_memory(&self, size: usize) -> Result<()> {
        let state = self.state.read();
        let handle = state.repr.open_ref()?;
        let len = size.min(handle.map.len());
        sys::lock_pages(handle.map.as_ptr(), len).map_err(|e| Error::system("mlock", e))
    }

    fn is_open(&self) -> bool {
        matches!(self.state.read().repr, Repr::Open(_))
    }

    fn is_writable(&self) -> bool {
        match &self.state.read().repr {
            Repr::Open(handle) => handle.writable,
            _ => false,
        }
    }
}

impl Drop for ParallelMapFile {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                warn!(error = %err, "failed to close parallel map file on drop");
            }
        }
    }
}

/// Scoped access to a contiguous range of a [`ParallelMapFile`].
///
/// The zone holds the file's shared remap lock for its whole lifetime, so
/// the mapping it points into cannot be reseated underneath it. It contains
/// a raw pointer and is therefore neither `Send` nor `Sync`; acquire zones
/// on the thread that uses them.
#[derive(Debug)]
pub struct ParallelZone<'a> {
    ptr: *mut u8,
    off: u64,
    len: usize,
    writable: bool,
    _guard: RwLockReadGuard<'a, FileState>,
}

impl ParallelZone<'_> {
    /// Logical offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.off
    }

    /// Usable length; reader zones may be shorter than requested when the
    /// range was clamped to the logical end.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: from_raw_parts is valid because:
        // 1. The zone holds the shared remap lock, so the mapping stays
        //    alive and in place for the slice's lifetime.
        // 2. offset + len was bounded by the published sizes at acquisition,
        //    which never exceed the mapping length.
        // 3. Empty zones carry a dangling-but-aligned pointer with len 0,
        //    which from_raw_parts permits.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Mutable view of the zone. Ranges of distinct writer zones are not
    /// checked against each other; overlap is the caller's contract.
    ///
    /// # Panics
    ///
    /// Panics when the zone was acquired read-only.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(self.writable, "zone was acquired read-only");
        // SAFETY: same bounds and lifetime argument as as_slice; the
        // mapping was established read-write because the zone is writable.
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}
