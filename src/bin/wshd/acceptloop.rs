//! The accept loop: the supervisor's entire post-`--continue` lifetime.
//!
//! Grounded on `wshd.c`'s `child_loop`/`child_accept`/`child_handle_signal`/
//! `child_handle_sigchld`, translated from its raw `select(2)` + blocking
//! `signalfd` read into `nix::sys::select`/`nix::sys::signalfd`.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixListener;

use anyhow::{Context, Result};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use wshd::childtable::{ChildTable, ExitOutcome};
use wshd::wire::{self, WireMessage};
use wshd::{fdutil, unixmsg};

use crate::spawn;

/// Blocks `SIGCHLD` in this process's mask and opens a signal-fd that
/// becomes readable whenever one is pending, replacing the usual async
/// signal-handler dance with an ordinary `select`-able fd.
pub fn block_sigchld_and_open_signalfd() -> Result<SignalFd> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block().context("blocking SIGCHLD")?;
    SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC).context("opening signalfd for SIGCHLD")
}

pub fn run(listener: UnixListener, signal_fd: SignalFd) -> Result<()> {
    let mut table = ChildTable::new();
    let listener_raw = listener.as_raw_fd();
    let signal_raw = signal_fd.as_fd().as_raw_fd();

    loop {
        let mut read_fds = FdSet::new();
        read_fds.insert(borrowed(listener_raw));
        read_fds.insert(borrowed(signal_raw));

        match select(None, &mut read_fds, None, None, None) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("select on accept loop"),
        }

        if read_fds.contains(borrowed(listener_raw)) {
            if let Err(e) = accept_one(&listener, &mut table) {
                tracing::warn!("error handling connection: {e:#}");
            }
        }

        if read_fds.contains(borrowed(signal_raw)) {
            // Drain the signalfd (one `siginfo` per pending delivery;
            // coalesced SIGCHLDs still only mean "check for more exits").
            let _ = signal_fd.read_signal();
            reap_children(&mut table)?;
        }
    }
}

fn reap_children(table: &mut ChildTable) -> Result<()> {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                table.complete(pid, ExitOutcome::Exited(code))?;
            }
            Ok(WaitStatus::Signaled(pid, _, _)) => {
                table.complete(pid, ExitOutcome::Signaled)?;
            }
            Ok(WaitStatus::StillAlive) => return Ok(()),
            Ok(_) => {} // stopped/continued: not a terminal state, keep draining
            Err(nix::errno::Errno::ECHILD) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("waitpid"),
        }
    }
}

fn accept_one(listener: &UnixListener, table: &mut ChildTable) -> Result<()> {
    let (stream, _) = listener.accept().context("accept")?;
    fdutil::set_cloexec(&stream)?;
    let stream_fd = unixmsg::stream_raw_fd(&stream);

    let mut buf = [0u8; wire::REQUEST_SIZE];
    let (n, _fds) = unixmsg::recv(stream_fd, &mut buf)?;
    let message = wire::decode(&buf, n)?;

    match message {
        WireMessage::Signal(sig) => {
            let _ = nix::sys::signal::kill(
                Pid::from_raw(sig.pid),
                Signal::try_from(sig.signal).ok(),
            );
            Ok(())
        }
        WireMessage::Request(req) if req.is_bind_mount() => {
            perform_bind_mount(&req)?;
            Ok(())
        }
        WireMessage::Request(req) if req.tty => {
            let spawned = spawn::spawn_interactive(&req)?;
            let fds: [RawFd; 3] = [
                spawned.pty_master.as_raw_fd(),
                spawned.exit_status_read.as_raw_fd(),
                spawned.pid_read.as_raw_fd(),
            ];
            unixmsg::send(stream_fd, &wire::response_bytes(), &fds)?;
            table.insert(spawned.child_pid, spawned.exit_status_write);
            Ok(())
        }
        WireMessage::Request(req) => {
            let spawned = spawn::spawn_noninteractive(&req)?;
            let fds: [RawFd; 5] = [
                spawned.stdin_write.as_raw_fd(),
                spawned.stdout_read.as_raw_fd(),
                spawned.stderr_read.as_raw_fd(),
                spawned.exit_status_read.as_raw_fd(),
                spawned.pid_read.as_raw_fd(),
            ];
            unixmsg::send(stream_fd, &wire::response_bytes(), &fds)?;
            table.insert(spawned.child_pid, spawned.exit_status_write);
            Ok(())
        }
    }
}

fn perform_bind_mount(req: &wire::Request) -> Result<()> {
    let source = req.bind_mount_source.as_deref().expect("checked by is_bind_mount");
    let destination = req.bind_mount_destination.as_deref().expect("checked by is_bind_mount");
    nix::mount::mount(
        Some(source),
        destination,
        None::<&str>,
        nix::mount::MsFlags::MS_BIND | nix::mount::MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("bind-mounting {source} onto {destination}"))
}

/// `FdSet` stores `BorrowedFd<'_>`; the listener and signalfd outlive the
/// whole loop, so borrowing them as `'static` for each iteration is sound.
fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}
