//! Barrier: a one-shot pipe-based rendezvous between a parent and a child.
//!
//! Grounded on `wshd.c`'s inline barrier pipes (opened before `clone`, signaled
//! and waited on across the phase-0/1/2 handshake). Two barriers exist in
//! practice — parent-to-child and child-to-parent — each its own `Barrier`.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::unistd::{self, read, write};

use crate::fdutil::set_cloexec;

pub struct Barrier {
    read: OwnedFd,
    write: OwnedFd,
}

impl Barrier {
    /// Opens a fresh pipe. Re-signaling after the first `signal()` is
    /// undefined — each barrier is one-shot per direction.
    pub fn open() -> Result<Self> {
        let (read, write) = unistd::pipe().context("opening barrier pipe")?;
        Ok(Barrier { read, write })
    }

    /// Writes exactly one byte to the write end.
    pub fn signal(&self) -> Result<()> {
        let n = write(&self.write, &[1u8]).context("signaling barrier")?;
        if n != 1 {
            anyhow::bail!("short write signaling barrier");
        }
        Ok(())
    }

    /// Reads exactly one byte from the read end, blocking until the peer signals.
    pub fn wait(&self) -> Result<()> {
        let mut buf = [0u8; 1];
        let n = read(self.read.as_raw_fd(), &mut buf).context("waiting on barrier")?;
        if n != 1 {
            anyhow::bail!("barrier peer closed without signaling");
        }
        Ok(())
    }

    /// Marks both ends close-on-exec. Call after the handshake that needed
    /// this barrier to survive an `execve` has completed, so the fds do not
    /// leak into the next image's descriptor table.
    pub fn set_cloexec(&self) -> Result<()> {
        set_cloexec(&self.read)?;
        set_cloexec(&self.write)?;
        Ok(())
    }

    pub fn read_fd(&self) -> &OwnedFd {
        &self.read
    }

    pub fn write_fd(&self) -> &OwnedFd {
        &self.write
    }
}

/// Writes exactly one byte to a raw barrier write-fd.
///
/// For use across a `clone(2)` boundary, where the child closure cannot
/// borrow an owned [`Barrier`] (it must be `'static`-movable into a
/// freestanding stack). `clone` duplicates the fd table, so the raw fd number
/// stays valid for the child independently of the parent's `Barrier` value
/// that produced it — mirroring `fdutil::set_cloexec_raw`'s precedent for the
/// same boundary.
pub fn signal_raw(fd: RawFd) -> Result<()> {
    let n = write(fd, &[1u8]).context("signaling barrier (raw fd)")?;
    if n != 1 {
        anyhow::bail!("short write signaling barrier");
    }
    Ok(())
}

/// Reads exactly one byte from a raw barrier read-fd. See [`signal_raw`].
pub fn wait_raw(fd: RawFd) -> Result<()> {
    let mut buf = [0u8; 1];
    let n = read(fd, &mut buf).context("waiting on barrier (raw fd)")?;
    if n != 1 {
        anyhow::bail!("barrier peer closed without signaling");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_wait_completes() {
        let b = Barrier::open().unwrap();
        b.signal().unwrap();
        b.wait().unwrap();
    }

    #[test]
    fn raw_signal_then_wait_completes() {
        let b = Barrier::open().unwrap();
        signal_raw(b.write_fd().as_raw_fd()).unwrap();
        wait_raw(b.read_fd().as_raw_fd()).unwrap();
    }
}
