//! Injectable logging sink, four levels, matching `libexfat/log.c`.
//!
//! The C implementation writes to stderr and, when not attached to a
//! terminal, also to syslog/Android log. We delegate the "where do these
//! lines end up" question to the `log` crate so a host application can wire
//! up `env_logger`, `syslog`, or anything else that implements `log::Log`;
//! this module only carries the severity discipline, which is the part the
//! core actually depends on (`bug` must abort, the others must not).

use crate::error::bump_error_count;

/// An internal invariant was violated on a path that cannot admit it.
/// Fatal: logs at the highest level and aborts the process, exactly as
/// `exfat_bug` does in the original implementation.
#[cold]
pub fn bug(msg: impl std::fmt::Display) -> ! {
    eprintln!("BUG: {msg}");
    log::error!("BUG: {msg}");
    std::process::abort();
}

/// Something is wrong with the on-disk file system; the current operation
/// is failing but the process continues.
pub fn error(msg: impl std::fmt::Display) {
    bump_error_count();
    log::error!("{msg}");
}

/// Unexpected but survivable: e.g. a pinned node found non-zero references
/// at unmount.
pub fn warn(msg: impl std::fmt::Display) {
    log::warn!("{msg}");
}

/// Disabled by default (the `log` crate's usual level filtering applies).
pub fn debug(msg: impl std::fmt::Display) {
    log::debug!("{msg}");
}
