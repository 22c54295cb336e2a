//! # Storage File Contract
//!
//! This module defines the facade that DBM engines program against: the
//! [`StorageFile`] trait, the [`OpenFlags`] option bitset, and the
//! allocation-strategy constants shared by the memory-mapped backends.
//!
//! ## Logical Size vs Backing Size
//!
//! Every storage file tracks two sizes:
//!
//! ```text
//! +--------------------- backing allocation (map_size) ---------------------+
//! |  bytes the caller has reserved (file_size)  |  geometric over-allocation |
//! +---------------------------------------------+----------------------------+
//! ```
//!
//! - The *logical* size is the high-water mark of bytes reserved through
//!   `write`/`append`/`expand`; it is what `get_size` reports.
//! - The *backing* size is the page-aligned allocation behind the memory
//!   mapping, always at least the logical size. Growth is geometric
//!   (default 2x) so the amortized remap cost per appended byte is O(1).
//!
//! The OS file length tracks the backing size while the file is open; the
//! over-allocation is shed on `close`, `truncate`, and `synchronize`, so a
//! closed file's length always equals its logical size.
//!
//! ## Choosing a Backend
//!
//! | Backend               | Zone locking                  | Best for                      |
//! |-----------------------|-------------------------------|-------------------------------|
//! | `ParallelMapFile`     | shared, lock-free append      | many small concurrent records |
//! | `AtomicMapFile`       | exclusive for writers         | multi-step read-modify-write  |
//!
//! Zone acquisition (`make_zone`) is an inherent method on each concrete
//! type rather than part of this trait: zones are lifetime-bound borrows of
//! the file and cannot be expressed object-safely.

use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::error::Result;

/// Upper bound on the size of a file this crate will map into memory.
pub const MAX_MEMORY_SIZE: u64 = 1 << 40;

/// Default initial backing allocation for writable files.
pub const DEFAULT_ALLOC_INIT_SIZE: u64 = 1 << 20;

/// Default geometric growth factor for the backing allocation.
pub const DEFAULT_ALLOC_INC_FACTOR: f64 = 2.0;

/// Size of a virtual memory page on this system.
pub fn page_size() -> u64 {
    crate::sys::page_size()
}

bitflags! {
    /// Options accepted by [`StorageFile::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Truncate the file to zero length on open (writable only).
        const TRUNCATE = 1 << 0;
        /// Do not create the file when it does not exist.
        const NO_CREATE = 1 << 1;
        /// Fail immediately when the advisory lock is contended.
        const NO_WAIT = 1 << 2;
        /// Skip the OS advisory lock entirely.
        const NO_LOCK = 1 << 3;
        /// Flush data durably to the device as part of `close`.
        const SYNC_HARD = 1 << 4;
    }
}

/// Growth policy parameters, configurable while the file is closed and
/// retained across open/close cycles.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocStrategy {
    pub init_size: u64,
    pub inc_factor: f64,
}

impl Default for AllocStrategy {
    fn default() -> Self {
        Self {
            init_size: DEFAULT_ALLOC_INIT_SIZE,
            inc_factor: DEFAULT_ALLOC_INC_FACTOR,
        }
    }
}

/// Byte-addressable, growable storage file.
///
/// All operations take `&self`; each implementation carries its own interior
/// synchronization so a single instance can be shared across threads. The
/// trait is object safe: engines hold `Box<dyn StorageFile>` and select the
/// concurrency discipline at construction time.
pub trait StorageFile: Send + Sync {
    /// Opens the file at `path`. Fails with a precondition error when the
    /// instance is already open.
    fn open(&self, path: &Path, writable: bool, flags: OpenFlags) -> Result<()>;

    /// Closes the file, shedding the geometric over-allocation so the OS
    /// file length equals the logical size. Cleanup continues past errors;
    /// the first failure is returned.
    fn close(&self) -> Result<()>;

    /// Reads exactly `buf.len()` bytes at `off`. Fails with an infeasible
    /// error when the range extends past the logical end.
    fn read(&self, off: u64, buf: &mut [u8]) -> Result<()>;

    /// Reads `size` bytes at `off`, returning an empty vector on any error
    /// or short read.
    fn read_simple(&self, off: u64, size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        match self.read(off, &mut buf) {
            Ok(()) => buf,
            Err(_) => Vec::new(),
        }
    }

    /// Writes `buf` at `off`, extending the logical size as needed.
    fn write(&self, off: u64, buf: &[u8]) -> Result<()>;

    /// Appends `buf` at the logical end and returns the offset the data
    /// landed at. Concurrent appends receive disjoint offsets.
    fn append(&self, buf: &[u8]) -> Result<u64>;

    /// Reserves `inc_size` bytes at the logical end without writing them and
    /// returns the offset of the reservation.
    fn expand(&self, inc_size: usize) -> Result<u64>;

    /// Sets the logical size to `size` and rebuilds the backing allocation
    /// around it. The OS file is truncated to the new backing size.
    fn truncate(&self, size: u64) -> Result<()>;

    /// Shrinks only the logical size, leaving the OS file and the mapping
    /// untouched. Fails with an infeasible error when `size` exceeds the
    /// backing allocation.
    fn truncate_fakely(&self, size: u64) -> Result<()>;

    /// Sheds the over-allocation so the OS file length equals the logical
    /// size, then, when `hard` is set, flushes the mapping and the file
    /// durably. `off`/`size` select the subrange to flush; a zero `size`
    /// means everything up to the logical end.
    fn synchronize(&self, hard: bool, off: u64, size: u64) -> Result<()>;

    /// Returns the logical size.
    fn get_size(&self) -> Result<u64>;

    /// Updates the growth policy. Fails while the file is open.
    fn set_allocation_strategy(&self, init_size: u64, inc_factor: f64) -> Result<()>;

    /// Forwards this file's growth policy to `other`.
    fn copy_properties(&self, other: &dyn StorageFile) -> Result<()>;

    /// Returns the path the file was opened at. Fails when closed or when
    /// path operations have been disabled.
    fn get_path(&self) -> Result<PathBuf>;

    /// Renames the underlying OS file, updating the stored path only when
    /// the OS call succeeds.
    fn rename(&self, new_path: &Path) -> Result<()>;

    /// Forgets the stored path. Subsequent `get_path`/`rename` calls fail;
    /// I/O remains fully usable.
    fn disable_path_operations(&self) -> Result<()>;

    /// Best-effort pinning of the first `size` mapped bytes into RAM. A
    /// no-op on platforms without support.
    fn lock_memory(&self, size: usize) -> Result<()>;

    /// Whether the file is currently open.
    fn is_open(&self) -> bool;

    /// Whether the file was opened for writing.
    fn is_writable(&self) -> bool;
}
