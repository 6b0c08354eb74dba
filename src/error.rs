//! Error taxonomy.
//!
//! Mirrors the semantic kinds `libexfat` distinguishes (see `exfat_error` /
//! `exfat_bug` in the original C implementation) rather than exposing raw
//! `std::io::Error`s everywhere: callers that bridge to a POSIX-style facade
//! need to know whether to report ENOSPC, EIO, ENOENT, ... and the `Bug`
//! variant is never meant to be handled, only logged and aborted on.

use std::sync::atomic::{AtomicUsize, Ordering};

/// All non-bug errors increment this counter, mirroring `exfat_errors` in
/// `libexfat/log.c`. Useful for post-run auditing of long-lived mounts.
static ERROR_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn error_count() -> usize {
    ERROR_COUNT.load(Ordering::Relaxed)
}

pub(crate) fn bump_error_count() {
    ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Allocator exhaustion (ENOSPC).
    #[error("no free space left on device")]
    NoSpace,

    /// An on-disk invariant was violated: bad cluster index, checksum
    /// mismatch, impossible size, unexpected entry kind (EIO).
    #[error("filesystem corruption: {0}")]
    IoFormat(String),

    /// The underlying block device read or write failed (EIO).
    #[error("device I/O error: {0}")]
    IoDevice(#[from] std::io::Error),

    /// End of directory reached while looking for an entry (ENOENT).
    #[error("no such entry")]
    NotFound,

    /// Expected a directory, found something else (ENOTDIR).
    #[error("not a directory")]
    NotDir,

    /// Expected a non-directory, found a directory (EISDIR).
    #[error("is a directory")]
    IsDir,

    /// `rmdir` on a directory that still has children (ENOTEMPTY).
    #[error("directory not empty")]
    NotEmpty,

    /// Node or buffer allocation failed (ENOMEM).
    #[error("out of memory")]
    OutOfMemory,

    /// The volume (or a mount option) forbids the attempted mutation.
    #[error("filesystem mounted read-only")]
    ReadOnly,

    /// An internal invariant was violated on a code path that cannot admit
    /// it: invalid cluster where one cannot occur, reference counter gone
    /// negative, a type mismatch on write-back. Fatal: the caller is
    /// expected to log and abort, see [`crate::log::bug`].
    #[error("internal bug: {0}")]
    Bug(String),
}

impl Error {
    /// Negative-errno convention used by the original C implementation and
    /// expected by any POSIX-style facade built atop this core.
    pub fn into_errno(&self) -> i32 {
        match self {
            Error::NoSpace => -libc_enospc(),
            Error::IoFormat(_) | Error::IoDevice(_) => -libc_eio(),
            Error::NotFound => -libc_enoent(),
            Error::NotDir => -libc_enotdir(),
            Error::IsDir => -libc_eisdir(),
            Error::NotEmpty => -libc_enotempty(),
            Error::OutOfMemory => -libc_enomem(),
            Error::ReadOnly => -libc_erofs(),
            Error::Bug(_) => i32::MIN,
        }
    }

    /// Build an `IoFormat` error, logging it at error level first (mirrors
    /// `exfat_error(...); return -EIO;` call sites in the original source).
    pub(crate) fn format(msg: impl Into<String>) -> Error {
        let msg = msg.into();
        crate::log::error(&msg);
        Error::IoFormat(msg)
    }

    /// Build a `NoSpace` error, logging the exhaustion condition first
    /// (mirrors `exfat_error("no free space left")` in `cluster.c`).
    pub(crate) fn no_space() -> Error {
        crate::log::error("no free space left");
        Error::NoSpace
    }
}

/// The crate intentionally avoids a dependency on the `libc` crate (a
/// single-purpose lookup table of the handful of errno values this taxonomy
/// needs isn't worth it); these mirror the platform's standard values.
fn libc_enospc() -> i32 { 28 }
fn libc_eio() -> i32 { 5 }
fn libc_enoent() -> i32 { 2 }
fn libc_enotdir() -> i32 { 20 }
fn libc_eisdir() -> i32 { 21 }
fn libc_enotempty() -> i32 { 39 }
fn libc_enomem() -> i32 { 12 }
fn libc_erofs() -> i32 { 30 }

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::ErrorKind> for Error {
    fn from(kind: std::io::ErrorKind) -> Self {
        Error::IoDevice(std::io::Error::from(kind))
    }
}
