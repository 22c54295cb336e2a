//! # Atomic Map File
//!
//! [`AtomicMapFile`] is the strict mutual-exclusion sibling of
//! `ParallelMapFile`. Every operation takes the per-file lock; writer zones
//! hold the exclusive side for their entire lifetime, so a writer zone is a
//! serialization point: callers can read, decide and write back under a
//! single acquisition without any external synchronization.
//!
//! The logical and backing sizes are plain fields guarded by the lock. That
//! is the whole point of this variant: no atomics to reason about, zone
//! acquisition order is the only ordering there is. Throughput under write
//! contention is proportionally lower, which is the documented trade-off.
//!
//! Open/close, the growth engine, poisoning and the copy-based facade
//! behave exactly as in the parallel variant; the two share the mapping
//! machinery in the parent module.

use std::fs;
use std::path::{Path, PathBuf};
use std::slice;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, trace, warn};

use super::{
    close_handle, extend_file, grow_plan, open_handle, remap, synchronize_handle, truncate_plan,
    zone_ptr, MapHandle,
};
use crate::error::{Error, Result};
use crate::file::{AllocStrategy, OpenFlags, StorageFile};
use crate::sys;

#[derive(Debug)]
struct AtomicOpen {
    handle: MapHandle,
    file_size: u64,
    map_size: u64,
}

#[derive(Debug)]
enum Repr {
    Closed,
    Open(AtomicOpen),
    Poisoned(String),
}

impl Repr {
    fn open_ref(&self) -> Result<&AtomicOpen> {
        match self {
            Repr::Open(open) => Ok(open),
            Repr::Closed => Err(Error::Precondition("not opened file")),
            Repr::Poisoned(_) => Err(Error::Precondition("poisoned file")),
        }
    }

    fn open_mut(&mut self) -> Result<&mut AtomicOpen> {
        match self {
            Repr::Open(open) => Ok(open),
            Repr::Closed => Err(Error::Precondition("not opened file")),
            Repr::Poisoned(_) => Err(Error::Precondition("poisoned file")),
        }
    }
}

#[derive(Debug)]
struct AtomicState {
    repr: Repr,
    alloc: AllocStrategy,
}

/// Memory-mapped storage file whose zones are serialization points.
#[derive(Debug)]
pub struct AtomicMapFile {
    state: RwLock<AtomicState>,
}

impl Default for AtomicMapFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Grows the backing allocation to at least `min_size`. Runs under the
/// exclusive lock the caller already holds; a remap failure poisons the
/// state before the error is surfaced.
fn grow_locked(state: &mut AtomicState, min_size: u64) -> Result<()> {
    let inc_factor = state.alloc.inc_factor;
    let open = match &mut state.repr {
        Repr::Open(open) => open,
        Repr::Closed => return Err(Error::Precondition("not opened file")),
        Repr::Poisoned(_) => return Err(Error::Precondition("poisoned file")),
    };
    if min_size <= open.map_size {
        return Ok(());
    }
    let old_map = open.map_size;
    let new_map = grow_plan(old_map, min_size, inc_factor);
    extend_file(&open.handle.file, new_map)?;
    match remap(&mut open.handle, new_map) {
        Ok(()) => {
            open.map_size = new_map;
            trace!(old_map, new_map, "grew atomic map file");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "remap failed during growth, poisoning file");
            state.repr = Repr::Poisoned(err.to_string());
            Err(err)
        }
    }
}

impl AtomicMapFile {
    /// Creates a closed instance with the default allocation strategy.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AtomicState {
                repr: Repr::Closed,
                alloc: AllocStrategy::default(),
            }),
        }
    }

    /// Returns the backing allocation size.
    pub fn map_size(&self) -> Result<u64> {
        Ok(self.state.read().repr.open_ref()?.map_size)
    }

    /// Acquires a zone over `[off, off + size)`.
    ///
    /// Writer zones (`writable = true`) hold the exclusive lock until
    /// dropped and may perform multi-step read-modify-write; `off = None`
    /// appends at the logical end. Reader zones hold the shared lock and
    /// are clamped to the logical end.
    pub fn make_zone(
        &self,
        writable: bool,
        off: Option<u64>,
        size: usize,
    ) -> Result<AtomicZone<'_>> {
        if writable {
            let mut guard = self.state.write();
            let (off, end) = {
                let open = guard.repr.open_ref()?;
                if !open.handle.writable {
                    return Err(Error::Precondition("not writable file"));
                }
                let off = off.unwrap_or(open.file_size);
                let end = match off.checked_add(size as u64) {
                    Some(end) => end,
                    None => return Err(Error::Infeasible("excessive size")),
                };
                (off, end)
            };
            grow_locked(&mut guard, end)?;
            let open = guard.repr.open_mut()?;
            open.file_size = open.file_size.max(end);
            let ptr = zone_ptr(&open.handle.map, off);
            Ok(AtomicZone {
                ptr,
                off,
                len: size,
                writable: true,
                _guard: ZoneGuard::Exclusive(guard),
            })
        } else {
            let guard = self.state.read();
            let open = guard.repr.open_ref()?;
            let off = match off {
                Some(off) => off,
                None => return Err(Error::Precondition("negative offset")),
            };
            if off > open.file_size {
                return Err(Error::Infeasible("excessive offset"));
            }
            let len = (open.file_size - off).min(size as u64) as usize;
            let ptr = zone_ptr(&open.handle.map, off);
            Ok(AtomicZone {
                ptr,
                off,
                len,
                writable: false,
                _guard: ZoneGuard::Shared(guard),
            })
        }
    }
}

impl StorageFile for AtomicMapFile {
    fn open(&self, path: &Path, writable: bool, flags: OpenFlags) -> Result<()> {
        let mut state = self.state.write();
        if !matches!(state.repr, Repr::Closed) {
            return Err(Error::Precondition("opened file"));
        }
        let (handle, file_size, map_size) = open_handle(path, writable, flags, &state.alloc)?;
        debug!(
            path = %path.display(),
            writable,
            file_size,
            map_size,
            "opened atomic map file"
        );
        state.repr = Repr::Open(AtomicOpen {
            handle,
            file_size,
            map_size,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        match std::mem::replace(&mut state.repr, Repr::Closed) {
            Repr::Closed => Err(Error::Precondition("not opened file")),
            Repr::Poisoned(_) => Ok(()),
            Repr::Open(open) => {
                debug!(logical = open.file_size, "closed atomic map file");
                close_handle(open.handle, open.file_size)
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
        let open = match &mut state.repr {
            Repr::Open(open) => open,
            Repr::Closed => return Err(Error::Precondition("not opened file")),
            Repr::Poisoned(_) => return Err(Error::Precondition("poisoned file")),
        };
        if !open.handle.writable {
            return Err(Error::Precondition("not writable file"));
        }
        let new_map = truncate_plan(size, &alloc);
        open.handle
            .file
            .set_len(new_map)
            .map_err(|e| Error::system("ftruncate", e))?;
        match remap(&mut open.handle, new_map) {
            Ok(()) => {
                open.map_size = new_map;
                open.file_size = size;
                debug!(size, map_size = new_map, "truncated atomic map file");
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
        let mut state = self.state.write();
        let open = state.repr.open_mut()?;
        if size > open.map_size {
            return Err(Error::Infeasible("unable to increase the file size"));
        }
        open.file_size = size;
        Ok(())
    }

    fn synchronize(&self, hard: bool, off: u64, size: u64) -> Result<()> {
        let mut state = self.state.write();
        let open = state.repr.open_mut()?;
        if !open.handle.writable {
            return Err(Error::Precondition("not writable file"));
        }
        open.map_size = open.file_size;
        trace!(hard, logical = open.file_size, "synchronizing atomic map file");
        synchronize_handle(&open.handle, open.file_size, hard, off, size)
    }

    fn get_size(&self) -> Result<u64> {
        Ok(self.state.read().repr.open_ref()?.file_size)
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
        let open = state.repr.open_ref()?;
        open.handle
            .path
            .clone()
            .ok_or(Error::Precondition("disabled path operation"))
    }

    fn rename(&self, new_path: &Path) -> Result<()> {
        let mut state = self.state.write();
        let open = state.repr.open_mut()?;
        let current = open
            .handle
            .path
            .as_ref()
            .ok_or(Error::Precondition("disabled path operation"))?;
        fs::rename(current, new_path).map_err(|e| Error::system("rename", e))?;
        open.handle.path = Some(new_path.to_path_buf());
        Ok(())
    }

    fn disable_path_operations(&self) -> Result<()> {
        let mut state = self.state.write();
        let open = state.repr.open_mut()?;
        open.handle.path = None;
        Ok(())
    }

    fn lock_memory(&self, size: usize) -> Result<()> {
        let state = self.state.read();
        let open = state.repr.open_ref()?;
        let len = size.min(open.handle.map.len());
        sys::lock_pages(open.handle.map.as_ptr(), len).map_err(|e| Error::system("mlock", e))
    }

    fn is_open(&self) -> bool {
        matches!(self.state.read().repr, Repr::Open(_))
    }

    fn is_writable(&self) -> bool {
        match &self.state.read().repr {
            Repr::Open(open) => open.handle.writable,
            _ => false,
        }
    }
}

impl Drop for AtomicMapFile {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                warn!(error = %err, "failed to close atomic map file on drop");
            }
        }
    }
}

#[derive(Debug)]
enum ZoneGuard<'a> {
    Shared(RwLockReadGuard<'a, AtomicState>),
    Exclusive(RwLockWriteGuard<'a, AtomicState>),
}

/// Scoped access to a contiguous range of an [`AtomicMapFile`].
///
/// Writer zones own the file's exclusive lock, reader zones a shared one,
/// in both cases until the zone drops. Writer zones are therefore safe for
/// multi-step read-modify-write. Zones contain a raw pointer and are
/// neither `Send` nor `Sync`.
#[derive(Debug)]
pub struct AtomicZone<'a> {
    ptr: *mut u8,
    off: u64,
    len: usize,
    writable: bool,
    _guard: ZoneGuard<'a>,
}

impl AtomicZone<'_> {
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
        // 1. The zone holds the file lock, so the mapping stays alive and
        //    in place for the slice's lifetime.
        // 2. offset + len was bounded by the sizes under that same lock.
        // 3. Empty zones carry a dangling-but-aligned pointer with len 0,
        //    which from_raw_parts permits.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Mutable view of the zone. The exclusive lock makes this the only
    /// live zone on the file.
    ///
    /// # Panics
    ///
    /// Panics when the zone was acquired read-only.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(self.writable, "zone was acquired read-only");
        // SAFETY: same bounds and lifetime argument as as_slice, and the
        // exclusive lock rules out any other zone over this mapping.
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}
