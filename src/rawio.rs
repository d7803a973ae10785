//! Minimal raw `read(2)`/`write(2)` wrappers returning `nix::Errno` so call
//! sites can match on `EAGAIN`/`EINTR`/`EPIPE` the same way regardless of which
//! `nix` version's `unistd::read`/`write` signature is in the lockfile.
//!
//! Grounded in the same spirit as `wormhole/src/bin/wormhole-attach/signals.rs`,
//! which drops to raw `libc::read` directly rather than going through a higher
//! wrapper for a single, performance/semantics-sensitive call site — `pump.rs`'s
//! `PumpPair::copy` is this crate's analogous hot, `RawFd`-keyed call site.

use std::os::fd::RawFd;

use nix::errno::Errno;

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(Errno::last())
    } else {
        Ok(n as usize)
    }
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(Errno::last())
    } else {
        Ok(n as usize)
    }
}
