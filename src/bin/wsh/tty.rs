//! Interactive terminal setup: raw mode and `SIGWINCH` forwarding.
//!
//! Grounded on `wsh.c`'s `tty_raw`/`tty_winsz`/`tty__sigwinch`, which stash
//! `(termios, winsize, pty-fd)` in file-scope statics because a POSIX signal
//! handler has no other way to reach them. Per the design notes, this scopes
//! that same state to a single struct instead: raw-mode save/restore lives in
//! [`RawMode`] (restored on `Drop`, replacing the original's `atexit`), and
//! window-size forwarding reads a blocked `SIGWINCH` off a signalfd on a
//! dedicated thread rather than an async-signal-unsafe handler — no process
//! statics anywhere in this module.

use std::os::fd::{BorrowedFd, RawFd};

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};

/// Puts `local_fd` (the client's stdin) into raw mode, restoring the saved
/// termios state when dropped.
pub struct RawMode {
    local_fd: RawFd,
    saved: Termios,
}

impl RawMode {
    pub fn enter(local_fd: RawFd) -> Result<Self> {
        let fd = borrowed(local_fd);
        let saved = tcgetattr(fd).context("tcgetattr")?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(fd, SetArg::TCSANOW, &raw).context("tcsetattr (raw mode)")?;
        Ok(RawMode { local_fd, saved })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = tcsetattr(borrowed(self.local_fd), SetArg::TCSANOW, &self.saved);
    }
}

fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// Reads `local_fd`'s current window size and applies it to `remote_fd` (the
/// PTY master). Matches `tty_gwinsz`/`tty_swinsz`.
fn sync_winsize(local_fd: RawFd, remote_fd: RawFd) -> Result<()> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    wshd::err(unsafe { libc::ioctl(local_fd, libc::TIOCGWINSZ, &mut ws as *mut libc::winsize) })
        .context("ioctl(TIOCGWINSZ)")?;
    wshd::err(unsafe { libc::ioctl(remote_fd, libc::TIOCSWINSZ, &ws as *const libc::winsize) })
        .context("ioctl(TIOCSWINSZ)")?;
    Ok(())
}

/// Performs the initial size sync, then spawns a thread that blocks on a
/// `SIGWINCH` signalfd and re-syncs on every delivery for the life of the
/// process. `local_fd`/`remote_fd` must stay open for as long as the pump
/// loop runs; both are plain fds borrowed from the caller's longer-lived
/// owners, not duplicated here.
pub fn spawn_winch_forwarder(local_fd: RawFd, remote_fd: RawFd) -> Result<()> {
    sync_winsize(local_fd, remote_fd)?;

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGWINCH);
    mask.thread_block().context("blocking SIGWINCH")?;
    let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)
        .context("opening signalfd for SIGWINCH")?;

    std::thread::spawn(move || loop {
        match signal_fd.read_signal() {
            Ok(Some(_)) => {
                let _ = sync_winsize(local_fd, remote_fd);
            }
            Ok(None) => continue,
            Err(_) => break,
        }
    });

    Ok(())
}
