//! # Error Taxonomy
//!
//! All fallible operations in this crate return [`Result`] with a closed
//! error set. The variants are deliberately coarse: consumers (DBM engines,
//! caches, WAL layers) dispatch on the *category* of a failure, not on the
//! precise OS condition, so the category is the stable contract and the
//! message carries the detail.
//!
//! ## Categories
//!
//! - [`Error::Precondition`]: the caller violated an API invariant (file not
//!   open, already open, not writable, path operations disabled). These are
//!   returned before any side effect takes place.
//! - [`Error::Infeasible`]: the request is well-formed but cannot be
//!   satisfied with the current file state (read past the logical end,
//!   logical truncation beyond the backing allocation, file too large to
//!   map).
//! - [`Error::System`]: an OS call failed. The variant names the call and
//!   wraps the `io::Error` so the OS-level code survives for diagnostics.
//! - [`Error::Io`]: payload-level I/O failure. The file backends report OS
//!   failures as `System`; this variant exists for consumer layers that
//!   share the taxonomy.
//! - [`Error::NotImplemented`]: an optional capability this backend does not
//!   provide.
//!
//! ## Cleanup accumulation
//!
//! Close and synchronize run multi-step cleanup sequences that must attempt
//! every step even when an early one fails. [`absorb`] implements the
//! keep-first composition those paths use: the first failure is retained and
//! returned, later failures are dropped after their work has been attempted.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller violated an API invariant. No side effects took place.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),

    /// The request cannot be satisfied with the current file state.
    #[error("infeasible request: {0}")]
    Infeasible(&'static str),

    /// An OS call failed; `call` names the primitive that reported it.
    #[error("{call} failed: {source}")]
    System {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Payload-level I/O failure, reserved for consumer layers.
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),

    /// An optional capability this backend does not provide.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl Error {
    pub(crate) fn system(call: &'static str, source: io::Error) -> Self {
        Error::System { call, source }
    }
}

/// Keep-first error accumulation for cleanup sequences that run to
/// completion regardless of intermediate failures.
pub(crate) fn absorb(acc: &mut Result<()>, next: Result<()>) {
    if acc.is_ok() {
        *acc = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failed_call() {
        let err = Error::system("mmap", io::Error::from_raw_os_error(12));
        let text = err.to_string();
        assert!(text.starts_with("mmap failed:"), "unexpected display: {text}");
    }

    #[test]
    fn precondition_display_carries_message() {
        let err = Error::Precondition("not opened file");
        assert_eq!(err.to_string(), "precondition violated: not opened file");
    }

    #[test]
    fn absorb_keeps_the_first_failure() {
        let mut acc: Result<()> = Ok(());
        absorb(&mut acc, Ok(()));
        assert!(acc.is_ok());

        absorb(&mut acc, Err(Error::Precondition("first")));
        absorb(&mut acc, Err(Error::Precondition("second")));
        match acc {
            Err(Error::Precondition(msg)) => assert_eq!(msg, "first"),
            other => panic!("expected first precondition error, got {other:?}"),
        }
    }

    #[test]
    fn system_error_preserves_the_os_code() {
        let err = Error::system("fcntl", io::Error::from_raw_os_error(11));
        match err {
            Error::System { call, source } => {
                assert_eq!(call, "fcntl");
                assert_eq!(source.raw_os_error(), Some(11));
            }
            other => panic!("expected system error, got {other:?}"),
        }
    }
}
