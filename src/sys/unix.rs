//! POSIX implementations of the platform seam.
//!
//! Locking uses open-file-description (OFD) `fcntl` locks on Linux so two
//! handles to the same file conflict even within a single process; classic
//! POSIX locks are per-process and would silently merge. OFD commands are a
//! Linux extension, so every other Unix (macOS included) falls back to
//! `F_SETLK`, which keeps cross-process exclusion but not intra-process
//! exclusion.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::OnceLock;

use super::LOCK_BYTE_OFFSET;

#[cfg(target_os = "linux")]
const CMD_SETLK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const CMD_SETLKW: libc::c_int = libc::F_OFD_SETLKW;

#[cfg(not(target_os = "linux"))]
const CMD_SETLK: libc::c_int = libc::F_SETLK;
#[cfg(not(target_os = "linux"))]
const CMD_SETLKW: libc::c_int = libc::F_SETLKW;

fn flock_at_lock_byte(lock_type: libc::c_int) -> libc::flock {
    // SAFETY: libc::flock is a plain C struct; the all-zero bit pattern is a
    // valid value for every field, and OFD locks require l_pid == 0.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = LOCK_BYTE_OFFSET as libc::off_t;
    fl.l_len = 1;
    fl
}

fn fcntl_lock(file: &File, lock_type: libc::c_int, wait: bool) -> io::Result<()> {
    let fl = flock_at_lock_byte(lock_type);
    let cmd = if wait { CMD_SETLKW } else { CMD_SETLK };
    loop {
        // SAFETY: the fd is valid for the lifetime of `file`, and `fl` is a
        // properly initialized flock struct that fcntl only reads.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if wait && err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// Acquires the advisory lock byte: shared for readers, exclusive for
/// writers. With `wait` unset, contention surfaces as `WouldBlock`.
pub(crate) fn lock_advisory(file: &File, exclusive: bool, wait: bool) -> io::Result<()> {
    // The lock-type constants are c_short on some platforms and c_int on
    // others; normalize before building the flock struct.
    let lock_type = if exclusive {
        libc::F_WRLCK as libc::c_int
    } else {
        libc::F_RDLCK as libc::c_int
    };
    fcntl_lock(file, lock_type, wait)
}

pub(crate) fn unlock_advisory(file: &File) -> io::Result<()> {
    fcntl_lock(file, libc::F_UNLCK as libc::c_int, false)
}

/// Writes a single zero byte at `off`, materializing sparse pages up to and
/// including that offset.
pub(crate) fn write_zero_at(file: &File, off: u64) -> io::Result<()> {
    let n = file.write_at(&[0u8], off)?;
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
        // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions and never fails
        // on the platforms this crate targets.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    })
}

/// Best-effort pinning of `[ptr, ptr + len)` into RAM. Resource-limit
/// refusals (ENOMEM, EPERM) are tolerated; other failures surface.
pub(crate) fn lock_pages(ptr: *const u8, len: usize) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    // SAFETY: the caller guarantees [ptr, ptr + len) lies within a live
    // mapping owned by the same file instance; mlock does not dereference
    // beyond that range.
    let rc = unsafe { libc::mlock(ptr.cast(), len) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOMEM) | Some(libc::EPERM) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn shared_locks_coexist() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"lock target").unwrap();
        let a = File::open(tmp.path()).unwrap();
        let b = File::open(tmp.path()).unwrap();

        lock_advisory(&a, false, false).unwrap();
        lock_advisory(&b, false, false).unwrap();
        unlock_advisory(&a).unwrap();
        unlock_advisory(&b).unwrap();
    }

    // OFD semantics only: classic POSIX locks would merge across two fds
    // of the same process and never conflict here.
    #[cfg(target_os = "linux")]
    #[test]
    fn exclusive_lock_conflicts_without_waiting() {
        use std::fs::OpenOptions;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let a = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        let b = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();

        lock_advisory(&a, true, false).unwrap();
        let err = lock_advisory(&b, true, false).unwrap_err();
        assert!(
            matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::PermissionDenied),
            "unexpected error kind: {err:?}"
        );
        unlock_advisory(&a).unwrap();
        lock_advisory(&b, true, false).unwrap();
    }

    #[test]
    fn write_zero_at_extends_the_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = tmp.reopen().unwrap();
        write_zero_at(&file, 8191).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);
    }
}
