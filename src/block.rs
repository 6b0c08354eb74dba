//! Block device contract (§6).
//!
//! The core never talks to a file or device handle directly; it is generic
//! over anything that can `read_at`/`write_at`, exactly like the teacher
//! crate's own `io_at::{ReadAt, WriteAt}` dependency. `Vec<u8>` and
//! `std::fs::File` already implement both traits (via `io-at`'s own
//! blanket impls and OS adaptors), so an in-memory scratch image and a real
//! block device opened through `io-block` both satisfy `BlockDevice`
//! without any glue code.
//!
//! `read_raw`/`write_raw` are required to transfer the full buffer; a short
//! transfer is promoted to a [`crate::log::bug`] here rather than bubbled
//! up, matching the source's treatment of short reads/writes as fatal.

use io_at::{ReadAt, WriteAt};

pub trait BlockDevice: ReadAt + WriteAt {}
impl<T: ReadAt + WriteAt + ?Sized> BlockDevice for T {}

pub fn read_raw<D: BlockDevice + ?Sized>(dev: &D, buf: &mut [u8], offset: u64) {
    match dev.read_at(buf, offset) {
        Ok(n) if n == buf.len() => {}
        Ok(n) => crate::log::bug(format!(
            "short read at offset {offset}: got {n} of {} bytes",
            buf.len()
        )),
        Err(e) => crate::log::bug(format!("read at offset {offset} failed: {e}")),
    }
}

pub fn write_raw<D: BlockDevice + ?Sized>(dev: &mut D, buf: &[u8], offset: u64) {
    if let Err(e) = dev.write_all_at(buf, offset) {
        crate::log::bug(format!("write at offset {offset} failed: {e}"));
    }
}
