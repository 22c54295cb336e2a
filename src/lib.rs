//! # mapfile - Memory-Mapped Storage Files
//!
//! This crate provides the file layer embedded database engines build on: a
//! byte-addressable, growable OS file exposed as a concurrently accessed
//! memory region. Hash tables, B-trees and log-structured stores layer
//! their formats on top; this crate only promises fast, safe access to the
//! bytes.
//!
//! ## Two Concurrency Disciplines
//!
//! The same data model ships with two locking strategies:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                DBM engines (hash, tree, log)              │
//! ├───────────────────────────────────────────────────────────┤
//! │           StorageFile facade (read/write/append)          │
//! ├─────────────────────────────┬─────────────────────────────┤
//! │   ParallelMapFile           │   AtomicMapFile             │
//! │   atomics + shared lock     │   everything under the lock │
//! │   lock-free CAS append      │   writer zones exclusive    │
//! ├─────────────────────────────┴─────────────────────────────┤
//! │       growth engine: geometric remap under excl. lock     │
//! ├───────────────────────────────────────────────────────────┤
//! │   platform seam: advisory lock, positional write, mlock   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`ParallelMapFile`]: many concurrent small accesses. Appends reserve
//!   disjoint ranges with a CAS loop and only serialize while the mapping
//!   is being grown.
//! - [`AtomicMapFile`]: writer zones hold the file lock exclusively for
//!   their lifetime, giving callers multi-step read-modify-write without
//!   external synchronization.
//!
//! Both hand out scoped **zones**: lifetime-bound borrows of a contiguous
//! byte range that pin the mapping in place while they are alive. `close`
//! takes the exclusive side of the same lock, so it waits for every
//! outstanding zone to drop before tearing the mapping down; quiesce zones
//! before closing, or a thread closing over its own zone will deadlock.
//!
//! ## Sizes
//!
//! The *logical* size (what `get_size` reports, where `append` lands) is
//! decoupled from the *backing* allocation, which grows geometrically so
//! the amortized remap cost per appended byte is constant. The
//! over-allocation is shed on `close`, `truncate` and `synchronize`; a
//! cleanly closed file's OS length always equals its logical size.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mapfile::{OpenFlags, ParallelMapFile, StorageFile};
//!
//! # fn main() -> mapfile::Result<()> {
//! let file = ParallelMapFile::new();
//! file.open("data.bin".as_ref(), true, OpenFlags::default())?;
//!
//! let off = file.append(b"first record")?;
//! let mut buf = [0u8; 12];
//! file.read(off, &mut buf)?;
//! assert_eq!(&buf, b"first record");
//!
//! file.synchronize(true, 0, 0)?;
//! file.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Durability
//!
//! Plain writes land in the page cache; `synchronize(hard = true, ..)` is
//! the durability barrier (msync + fsync). `OpenFlags::SYNC_HARD` folds a
//! hard synchronize into `close`.
//!
//! ## Module Overview
//!
//! - [`error`]: closed error taxonomy shared with consumer layers
//! - [`file`]: the [`StorageFile`] trait, open flags, allocation constants
//! - [`mmap`]: the two memory-mapped backends and their zones

pub mod error;
pub mod file;
pub mod mmap;

mod sys;

pub use error::{Error, Result};
pub use file::{
    page_size, OpenFlags, StorageFile, DEFAULT_ALLOC_INC_FACTOR, DEFAULT_ALLOC_INIT_SIZE,
    MAX_MEMORY_SIZE,
};
pub use mmap::{AtomicMapFile, AtomicZone, ParallelMapFile, ParallelZone};
