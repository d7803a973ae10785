//! Child-process spawning: PTY/pipe setup, fork, and the common post-fork
//! sequence shared by the interactive and non-interactive paths.
//!
//! Grounded on `wshd.c`'s `child_handle_interactive`/`child_handle_noninteractive`
//! (fd layout and dup2 ordering) and `child_fork`/`child_setup_environment`
//! (the common sequence: user resolution, rlimits, identity drop, chdir,
//! environment, signal mask, exec).

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{Context, Result};
use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::SigSet;
use nix::unistd::{self, ForkResult, Pid, User};

use wshd::wire::Request;
use wshd::{env, fdutil, rlimit};

pub struct InteractiveSpawn {
    pub pty_master: OwnedFd,
    pub exit_status_read: OwnedFd,
    pub exit_status_write: OwnedFd,
    pub pid_read: OwnedFd,
    pub child_pid: Pid,
}

pub struct NonInteractiveSpawn {
    pub stdin_write: OwnedFd,
    pub stdout_read: OwnedFd,
    pub stderr_read: OwnedFd,
    pub exit_status_read: OwnedFd,
    pub exit_status_write: OwnedFd,
    pub pid_read: OwnedFd,
    pub child_pid: Pid,
}

fn write_pid(pid_write: &OwnedFd, pid: Pid) {
    let _ = unistd::write(pid_write, &(pid.as_raw() as u32).to_ne_bytes());
}

/// PTY pair + exit-status pipe + pid pipe, fork, claim the controlling
/// terminal in the child, then the common spawn sequence.
pub fn spawn_interactive(req: &Request) -> Result<InteractiveSpawn> {
    let OpenptyResult { master, slave } = openpty(None, None).context("openpty")?;
    fdutil::set_cloexec(&master)?;
    fdutil::set_cloexec(&slave)?;

    let (exit_read, exit_write) = unistd::pipe().context("exit-status pipe")?;
    fdutil::set_cloexec(&exit_read)?;
    fdutil::set_cloexec(&exit_write)?;

    let (pid_read, pid_write) = unistd::pipe().context("pid pipe")?;
    fdutil::set_cloexec(&pid_read)?;
    fdutil::set_cloexec(&pid_write)?;

    match unsafe { unistd::fork() }.context("fork")? {
        ForkResult::Child => {
            let slave_raw = slave.as_raw_fd();
            for target in [0, 1, 2] {
                if nix::unistd::dup2(slave_raw, target).is_err() {
                    std::process::exit(255);
                }
            }
            if unistd::setsid().is_err() {
                std::process::exit(255);
            }
            // SAFETY: fd 0 is now the PTY slave (just dup2'd above); claiming
            // it as the controlling terminal requires the raw ioctl, which
            // `nix`'s "ioctl" feature does not wrap directly for TIOCSCTTY.
            if unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) } != 0 {
                std::process::exit(255);
            }
            run_common_spawn(req);
        }
        ForkResult::Parent { child } => {
            write_pid(&pid_write, child);
            Ok(InteractiveSpawn {
                pty_master: master,
                exit_status_read: exit_read,
                exit_status_write: exit_write,
                pid_read,
                child_pid: child,
            })
        }
    }
}

/// Five pipe pairs (stdin/stdout/stderr/exit-status/pid), fork, dup2 the
/// three stdio pipes, then the common spawn sequence.
pub fn spawn_noninteractive(req: &Request) -> Result<NonInteractiveSpawn> {
    let (stdin_read, stdin_write) = unistd::pipe().context("stdin pipe")?;
    let (stdout_read, stdout_write) = unistd::pipe().context("stdout pipe")?;
    let (stderr_read, stderr_write) = unistd::pipe().context("stderr pipe")?;
    let (exit_read, exit_write) = unistd::pipe().context("exit-status pipe")?;
    let (pid_read, pid_write) = unistd::pipe().context("pid pipe")?;

    for fd in [
        &stdin_read,
        &stdin_write,
        &stdout_read,
        &stdout_write,
        &stderr_read,
        &stderr_write,
        &exit_read,
        &exit_write,
        &pid_read,
        &pid_write,
    ] {
        fdutil::set_cloexec(fd)?;
    }

    match unsafe { unistd::fork() }.context("fork")? {
        ForkResult::Child => {
            let dups = [(stdin_read.as_raw_fd(), 0), (stdout_write.as_raw_fd(), 1), (stderr_write.as_raw_fd(), 2)];
            for (src, target) in dups {
                if nix::unistd::dup2(src, target).is_err() {
                    std::process::exit(255);
                }
            }
            if unistd::setsid().is_err() {
                std::process::exit(255);
            }
            run_common_spawn(req);
        }
        ForkResult::Parent { child } => {
            write_pid(&pid_write, child);
            Ok(NonInteractiveSpawn {
                stdin_write,
                stdout_read,
                stderr_read,
                exit_status_read: exit_read,
                exit_status_write: exit_write,
                pid_read,
                child_pid: child,
            })
        }
    }
}

fn resolve_argv(user: &User, req_arg: &[String]) -> Vec<String> {
    if !req_arg.is_empty() {
        req_arg.to_vec()
    } else {
        let shell = user.shell.to_string_lossy();
        if !shell.is_empty() {
            vec![shell.into_owned()]
        } else {
            vec!["/bin/sh".to_string()]
        }
    }
}

fn resolve_user(name: &str) -> Result<User> {
    let lookup_name = if name.is_empty() { "root" } else { name };
    User::from_name(lookup_name)
        .with_context(|| format!("looking up user {lookup_name:?}"))?
        .with_context(|| format!("no such user {lookup_name:?}"))
}

/// The common spawn sequence (steps 1-9 post-dup2, pre-exec). On success this
/// does not return — `execvpe` replaces the process image. On any failure it
/// returns `Err`; the caller (`run_common_spawn`) turns that into `exit(255)`.
fn common_spawn_sequence(req: &Request) -> Result<Infallible> {
    let user = resolve_user(&req.user)?;
    let argv = resolve_argv(&user, &req.arg);

    rlimit::apply_rlimits(&req.rlim)?;

    let user_name_c = CString::new(user.name.as_str()).context("user name contains NUL")?;
    unistd::initgroups(&user_name_c, user.gid).context("initgroups")?;
    unistd::setgid(user.gid).context("setgid")?;
    unistd::setuid(user.uid).context("setuid")?;

    unistd::chdir(&user.dir).with_context(|| format!("chdir {:?}", user.dir))?;
    if !req.dir.is_empty() {
        unistd::chdir(req.dir.as_str()).with_context(|| format!("chdir {:?}", req.dir))?;
    }

    let envp = env::build(&req.env, &user.dir.to_string_lossy(), &user.name, user.uid.as_raw());

    SigSet::empty().thread_set_mask().context("restoring signal mask")?;

    let argv_c: Vec<CString> = argv
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("argv contains embedded NUL")?;
    let envp_c: Vec<CString> = envp
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("environment contains embedded NUL")?;

    unistd::execvpe(&argv_c[0], &argv_c, &envp_c)
        .map_err(anyhow::Error::from)
        .context("execvpe")
}

fn run_common_spawn(req: &Request) -> ! {
    if let Err(e) = common_spawn_sequence(req) {
        eprintln!("wshd: {e:#}");
    }
    std::process::exit(255);
}
