//! Phase 2: the container-side child, both images.
//!
//! `pivot_and_continue` runs in the first image (the one `clone`'s callback
//! enters directly): it performs the pivot and re-execs itself with
//! `--continue`. `continue_phase` runs in the second image and never returns
//! under normal operation — it hands control to the accept loop.
//!
//! Grounded on `wshd.c`'s `child_run` (pivot) and `child_continue` (post-exec
//! setup), with the handover carried via [`wshd::handover::Handover`] instead
//! of the original's SysV shared-memory segment.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;

use anyhow::{Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd;

use wshd::handover::Handover;
use wshd::{barrier, fdutil, hook};

use crate::acceptloop;

/// `/dev/ptmx` must be a symlink to `/dev/pts/ptmx` inside the container for
/// Unix98 pty allocation to work. The original's condition for retrying
/// (`rv == -1 || errno == EEXIST`) is dead code once you read it closely —
/// `errno` is stale on success, and the `-1` branch already covers every
/// failure, including `EEXIST`. This reimplements the evident intent: retry
/// once, after clearing whatever is in the way, on any failure.
fn ensure_ptmx_symlink() -> Result<()> {
    const TARGET: &str = "/dev/pts/ptmx";
    const LINK: &str = "/dev/ptmx";
    if std::os::unix::fs::symlink(TARGET, LINK).is_ok() {
        return Ok(());
    }
    let _ = std::fs::remove_file(LINK);
    std::os::unix::fs::symlink(TARGET, LINK).context("symlinking /dev/ptmx -> /dev/pts/ptmx")
}

/// Entered as the `clone(2)` child callback. Waits for the parent's barrier,
/// runs the pivot sequence, and re-execs itself with `--continue`. Returns
/// only on error (the success path never returns: `execv` replaces the
/// process image).
pub fn pivot_and_continue(
    root_path: &str,
    lib_path: &str,
    title: Option<String>,
    socket_fd: i32,
    barrier_parent_wait_fd: i32,
    barrier_parent_unused_fd: i32,
    barrier_child_signal_fd: i32,
    barrier_child_unused_fd: i32,
) -> Result<()> {
    // `barrier_parent`'s write end and `barrier_child`'s read end are only
    // ever touched by the host parent; this image inherited copies of both
    // purely as a side effect of `clone` duplicating the whole fd table.
    // Close them now so they can't leak into the container's exec'd
    // processes (invariant #2).
    let _ = unistd::close(barrier_parent_unused_fd);
    let _ = unistd::close(barrier_child_unused_fd);

    barrier::wait_raw(barrier_parent_wait_fd).context("waiting on barrier_parent")?;
    let _ = unistd::close(barrier_parent_wait_fd);

    hook::run(Path::new(lib_path), "child-before-pivot")?;

    // lib_path is only resolvable against the host's view of the filesystem;
    // it must be canonicalized before the pivot below replaces that view.
    let lib_abs = std::fs::canonicalize(lib_path)
        .with_context(|| format!("resolving {lib_path} before pivot"))?;
    let pivoted_lib_path = format!("/tmp/garden-host{}", lib_abs.display());

    mount(Some(root_path), root_path, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)
        .with_context(|| format!("bind-mounting {root_path} onto itself"))?;
    unistd::chdir(root_path).with_context(|| format!("chdir {root_path}"))?;
    std::fs::set_permissions("tmp", std::fs::Permissions::from_mode(0o1777))
        .context("chmod 01777 tmp")?;
    match std::fs::create_dir("tmp/garden-host") {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e).context("mkdir tmp/garden-host"),
    }
    nix::unistd::pivot_root(".", "tmp/garden-host").context("pivot_root")?;
    unistd::chdir("/").context("chdir / after pivot_root")?;

    ensure_ptmx_symlink()?;

    unistd::setuid(unistd::Uid::from_raw(0)).context("setuid(0)")?;
    unistd::setgid(unistd::Gid::from_raw(0)).context("setgid(0)")?;

    hook::run(Path::new(&pivoted_lib_path), "child-after-pivot")?;

    let handover = Handover {
        lib_path: pivoted_lib_path,
        title,
        socket_fd,
        barrier_child_write_fd: barrier_child_signal_fd,
    };
    let payload = handover.to_arg()?;

    // `UnixListener::bind` sets `SOCK_CLOEXEC` (see unixmsg::listen's doc
    // comment), and `barrier_child`'s write end was never cloexec to begin
    // with, but either way both must survive into the `--continue` image —
    // clear cloexec on both right before the exec that needs them, matching
    // `wshd.c::child_continue`'s `fcntl_mix_cloexec` dance in reverse.
    fdutil::unset_cloexec_raw(socket_fd).context("clearing cloexec on control socket before exec")?;
    fdutil::unset_cloexec_raw(barrier_child_signal_fd)
        .context("clearing cloexec on barrier_child before exec")?;

    let exe = std::env::current_exe().context("resolving current executable")?;
    let exe_c = std::ffi::CString::new(exe.to_string_lossy().into_owned())
        .context("executable path contains NUL")?;
    let continue_flag = std::ffi::CString::new("--continue").unwrap();
    let payload_c = std::ffi::CString::new(payload).context("handover payload contains NUL")?;

    nix::unistd::execv(&exe_c, &[exe_c.clone(), continue_flag, payload_c])
        .context("execv --continue")?;
    unreachable!("execv does not return on success");
}

/// Entered as `wshd --continue <payload>`. Never returns under normal
/// operation — control passes to the accept loop.
pub fn continue_phase(payload: &str) -> Result<()> {
    let handover = Handover::from_arg(payload)?;

    // SAFETY: these fds were left open (not close-on-exec) across the exec
    // that produced this image specifically so they could be recovered here;
    // their numeric values are the handover's contract with the first image.
    let listener = unsafe { UnixListener::from_raw_fd(handover.socket_fd) };
    let barrier_child_write = unsafe { OwnedFd::from_raw_fd(handover.barrier_child_write_fd) };
    fdutil::set_cloexec(&listener)?;
    fdutil::set_cloexec(&barrier_child_write)?;

    if let Some(title) = &handover.title {
        wshd::proctitle::set_title(title).context("setting process title")?;
    }

    umount2("/tmp/garden-host", MntFlags::MNT_DETACH).context("umount2 /tmp/garden-host")?;

    unistd::setsid().context("setsid")?;

    barrier::signal_raw(barrier_child_write.as_raw_fd()).context("signaling barrier_child")?;
    drop(barrier_child_write);

    for fd in [0, 1, 2] {
        let _ = unistd::close(fd);
    }

    let signal_fd = acceptloop::block_sigchld_and_open_signalfd()?;
    acceptloop::run(listener, signal_fd)
}
