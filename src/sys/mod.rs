//! # Platform Seam
//!
//! The one place where OS-conditional code lives. Everything else in the
//! crate goes through std and `memmap2`, which are already portable; the
//! four primitives here are the ones they do not cover:
//!
//! - Advisory byte-range locking at a well-known offset (`fcntl` on POSIX,
//!   `LockFileEx` on Windows).
//! - The positional one-byte write the growth engine uses to materialize
//!   sparse pages before remapping.
//! - The system page size.
//! - Best-effort page pinning (`mlock` / `VirtualLock`).
//!
//! The advisory lock covers a single byte at offset `i32::MAX`, a high
//! offset chosen to stay clear of user byte-range locks on the same file.
//! Files locked by older revisions of this backend use the same offset, so
//! it must not change.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::{lock_advisory, lock_pages, page_size, unlock_advisory, write_zero_at};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::{lock_advisory, lock_pages, page_size, unlock_advisory, write_zero_at};

/// Offset of the advisory lock byte. Kept stable for compatibility with
/// files locked by earlier revisions of this backend.
pub(crate) const LOCK_BYTE_OFFSET: u64 = i32::MAX as u64;
