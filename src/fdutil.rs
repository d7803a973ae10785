//! Close-on-exec helpers shared by the supervisor, client, and nstar bridge.
//!
//! Grounded on the `set_cloexec`/`unset_cloexec` helpers `wormhole` keeps at its
//! crate root and reaches for throughout its fd-passing and spawn code.

use std::os::fd::{AsFd, AsRawFd, RawFd};

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FdFlag, FcntlArg};

pub fn set_cloexec<F: AsFd>(fd: &F) -> Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFD).context("fcntl(F_GETFD)")?;
    let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
    fcntl(raw, FcntlArg::F_SETFD(flags)).context("fcntl(F_SETFD) setting FD_CLOEXEC")?;
    Ok(())
}

pub fn unset_cloexec<F: AsFd>(fd: &F) -> Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFD).context("fcntl(F_GETFD)")?;
    let flags = FdFlag::from_bits_truncate(flags) & !FdFlag::FD_CLOEXEC;
    fcntl(raw, FcntlArg::F_SETFD(flags)).context("fcntl(F_SETFD) clearing FD_CLOEXEC")?;
    Ok(())
}

pub fn set_cloexec_raw(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).context("fcntl(F_GETFD)")?;
    let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).context("fcntl(F_SETFD) setting FD_CLOEXEC")?;
    Ok(())
}

pub fn unset_cloexec_raw(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).context("fcntl(F_GETFD)")?;
    let flags = FdFlag::from_bits_truncate(flags) & !FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).context("fcntl(F_SETFD) clearing FD_CLOEXEC")?;
    Ok(())
}
