//! Win32 implementations of the platform seam.
//!
//! Region locks go through `LockFileEx`/`UnlockFileEx` on the same single
//! byte the POSIX side uses. `LockFileEx` locks are mandatory only for
//! other lockers; plain reads and writes through the mapping are unaffected,
//! which matches the advisory semantics this crate documents.

use std::fs::File;
use std::io;
use std::os::windows::fs::FileExt;
use std::os::windows::io::AsRawHandle;
use std::ptr;
use std::sync::OnceLock;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Storage::FileSystem::{
    LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
};
use windows_sys::Win32::System::Memory::VirtualLock;
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::IO::{OVERLAPPED, OVERLAPPED_0, OVERLAPPED_0_0};

use super::LOCK_BYTE_OFFSET;

fn overlapped_at_lock_byte() -> OVERLAPPED {
    OVERLAPPED {
        Internal: 0,
        InternalHigh: 0,
        Anonymous: OVERLAPPED_0 {
            Anonymous: OVERLAPPED_0_0 {
                Offset: LOCK_BYTE_OFFSET as u32,
                OffsetHigh: 0,
            },
        },
        hEvent: ptr::null_mut(),
    }
}

/// Acquires the advisory lock byte: shared for readers, exclusive for
/// writers. With `wait` unset, contention surfaces as an OS error the
/// caller reports verbatim.
pub(crate) fn lock_advisory(file: &File, exclusive: bool, wait: bool) -> io::Result<()> {
    let mut flags = 0;
    if exclusive {
        flags |= LOCKFILE_EXCLUSIVE_LOCK;
    }
    if !wait {
        flags |= LOCKFILE_FAIL_IMMEDIATELY;
    }
    let mut overlapped = overlapped_at_lock_byte();
    // SAFETY: the handle is valid for the lifetime of `file`, and the
    // OVERLAPPED struct outlives the call (synchronous handles complete
    // LockFileEx before returning).
    let ok = unsafe {
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            flags,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn unlock_advisory(file: &File) -> io::Result<()> {
    let mut overlapped = overlapped_at_lock_byte();
    // SAFETY: same handle/OVERLAPPED validity argument as lock_advisory.
    let ok = unsafe { UnlockFileEx(file.as_raw_handle() as HANDLE, 0, 1, 0, &mut overlapped) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Writes a single zero byte at `off`, extending the file up to and
/// including that offset.
pub(crate) fn write_zero_at(file: &File, off: u64) -> io::Result<()> {
    let n = file.seek_write(&[0u8], off)?;
    if n != 1 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short positional write while extending file",
        ));
    }
    Ok(())
}

pub(crate) fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: GetSystemInfo writes the full SYSTEM_INFO struct and has
        // no failure mode.
        let info = unsafe {
            let mut info = std::mem::zeroed::<SYSTEM_INFO>();
            GetSystemInfo(&mut info);
            info
        };
        u64::from(info.dwPageSize)
    })
}

/// Best-effort pinning. Working-set refusals are expected and tolerated;
/// the operation never fails the caller.
pub(crate) fn lock_pages(ptr: *const u8, len: usize) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    // SAFETY: the caller guarantees [ptr, ptr + len) lies within a live
    // mapping owned by the same file instance.
    unsafe {
        VirtualLock(ptr as _, len);
    }
    Ok(())
}
