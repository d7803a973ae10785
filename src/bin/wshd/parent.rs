//! Phase 0 and Phase 1: the host-side process that sets up the control
//! socket and barriers, raises rlimits, clones the container's first
//! process, and exits once the child has signaled readiness.
//!
//! Grounded on `wshd.c`'s `parent_run`/`main`: flag validation, barrier
//! open, rlimit raise, `clone`, `PID` export, barrier handshake, exit.

use std::os::fd::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sched::{clone, CloneFlags};

use wshd::barrier::Barrier;
use wshd::{hook, rlimit, unixmsg};

use crate::child;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

pub fn run(run_dir: &str, lib_dir: &str, root_dir: &str, title: Option<String>, userns: bool) -> Result<()> {
    for (flag, path) in [("--run", run_dir), ("--lib", lib_dir), ("--root", root_dir)] {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("{flag} path {path:?} does not exist"))?;
        anyhow::ensure!(meta.is_dir(), "{flag} path {path:?} is not a directory");
    }

    let socket_path = Path::new(run_dir).join("wshd.sock");
    let listener = unixmsg::listen(&socket_path)?;

    let barrier_parent = Barrier::open()?;
    let barrier_child = Barrier::open()?;

    nix::sched::unshare(CloneFlags::CLONE_NEWNS).context("unshare(CLONE_NEWNS)")?;

    hook::run(Path::new(lib_dir), "parent-before-clone")?;

    rlimit::set_hard_rlimits()?;

    let mut flags = CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS;
    if userns {
        flags |= CloneFlags::CLONE_NEWUSER;
    }

    // The clone callback must be 'static: it runs in a child whose only
    // connection back to this stack frame is the fd table, which `clone`
    // (unlike `CLONE_FILES`-sharing threads) duplicates rather than aliases.
    // So only raw fd numbers — valid independently on both sides — cross
    // this boundary, never the owning `Barrier`/`UnixListener` values.
    //
    // `clone` copies the *whole* fd table, not just the fds named below:
    // the child also inherits `barrier_parent`'s write end and
    // `barrier_child`'s read end, even though it never uses either. Those
    // two raw numbers are passed through as well so `pivot_and_continue`
    // can close its unused copies instead of leaking them into the
    // container's exec'd processes.
    let listener_raw = listener.as_raw_fd();
    let barrier_parent_wait_fd = barrier_parent.read_fd().as_raw_fd();
    let barrier_parent_unused_fd = barrier_parent.write_fd().as_raw_fd();
    let barrier_child_signal_fd = barrier_child.write_fd().as_raw_fd();
    let barrier_child_unused_fd = barrier_child.read_fd().as_raw_fd();
    let root_dir_owned = root_dir.to_string();
    let lib_dir_owned = lib_dir.to_string();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let child_pid = unsafe {
        clone(
            Box::new(move || -> isize {
                match child::pivot_and_continue(
                    &root_dir_owned,
                    &lib_dir_owned,
                    title.clone(),
                    listener_raw,
                    barrier_parent_wait_fd,
                    barrier_parent_unused_fd,
                    barrier_child_signal_fd,
                    barrier_child_unused_fd,
                ) {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("wshd: container init failed: {e:#}");
                        1
                    }
                }
            }),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
        .context("clone")?
    };

    std::env::set_var("PID", child_pid.as_raw().to_string());

    hook::run(Path::new(lib_dir), "parent-after-clone")?;

    barrier_parent.signal().context("signaling barrier_parent")?;
    barrier_child.wait().context("waiting on barrier_child")?;

    Ok(())
}
