//! `wsh`: the control-socket client.
//!
//! Grounded on `wsh.c::main`/`loop_interactive`/`loop_noninteractive`: parse
//! flags, connect, build and send a request, then either the interactive
//! (PTY) or non-interactive (pipe) pump loop, reporting the remote exit code
//! as this process's own.

mod cli;
mod tty;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use wshd::wire::{self, Request};
use wshd::{rlimit, unixmsg};

const DEFAULT_SOCKET_PATH: &str = "run/wshd.sock";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    init_tracing();

    // Matches wsh.c's unconditional SIGPIPE ignore: a dead pump pair reports
    // EPIPE through a normal write() error instead of killing the client.
    // SAFETY: SigIgn is a trivial, always-valid handler.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    let argv: Vec<String> = std::env::args().collect();
    let prog = argv.first().cloned().unwrap_or_else(|| "wsh".to_string());

    let args = match cli::parse(&argv[1..]) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print!("{}", cli::usage(&prog));
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{prog}: {e}");
            eprint!("{}", cli::usage(&prog));
            std::process::exit(1);
        }
    };

    std::process::exit(run(args));
}

fn run(args: cli::WshArgs) -> i32 {
    match run_inner(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("wsh: {e:#}");
            255
        }
    }
}

fn run_inner(args: cli::WshArgs) -> Result<i32> {
    let socket_path = if args.socket_path.is_empty() {
        DEFAULT_SOCKET_PATH.to_string()
    } else {
        args.socket_path.clone()
    };

    let stream = unixmsg::connect(Path::new(&socket_path))?;
    let fd = unixmsg::stream_raw_fd(&stream);

    if args.bind_mount_source.is_some() && args.bind_mount_destination.is_some() {
        let req = Request {
            bind_mount_source: args.bind_mount_source,
            bind_mount_destination: args.bind_mount_destination,
            ..Default::default()
        };
        let bytes = req.to_bytes().context("encoding bind-mount request")?;
        unixmsg::send(fd, &bytes, &[]).context("sending bind-mount request")?;
        return Ok(0);
    }

    // SAFETY: isatty(2) is a plain, non-mutating syscall wrapper; fd 0 is
    // always a valid (if possibly closed) descriptor number to pass it.
    let tty = unsafe { libc::isatty(0) } != 0;
    let req = Request {
        tty,
        arg: args.argv,
        env: args.env,
        rlim: rlimit::export_rlimits().context("exporting rlimits")?,
        user: args.user.unwrap_or_default(),
        dir: args.dir.unwrap_or_default(),
        bind_mount_source: None,
        bind_mount_destination: None,
    };
    let bytes = req.to_bytes().context("encoding request")?;
    unixmsg::send(fd, &bytes, &[]).context("sending request")?;

    if tty {
        loop_interactive(&stream)
    } else {
        loop_noninteractive(&stream)
    }
}

/// Reads the informational container-PID the accept path sends alongside
/// the spawn response; logged, not otherwise used by this client.
fn drain_pid(pid_read: &OwnedFd) -> Option<u32> {
    let mut buf = [0u8; 4];
    match nix::unistd::read(pid_read.as_raw_fd(), &mut buf) {
        Ok(4) => Some(u32::from_ne_bytes(buf)),
        _ => None,
    }
}

/// `dup(2)` via raw `libc`, matching this crate's convention of dropping to
/// the raw syscall for fd-duplication rather than chasing whichever `nix`
/// signature (`RawFd`-based vs. `AsFd`-generic) a given version exposes.
fn dup_owned(fd: i32) -> Result<OwnedFd> {
    let raw = wshd::err(unsafe { libc::dup(fd) }).with_context(|| format!("dup({fd})"))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn loop_interactive(stream: &UnixStream) -> Result<i32> {
    let fd = unixmsg::stream_raw_fd(stream);
    let (buf, mut fds) = unixmsg::recv_exact::<{ wire::RESPONSE_SIZE }>(fd)?;
    wire::decode_response(&buf, buf.len())?;
    anyhow::ensure!(fds.len() == 3, "expected 3 fds for an interactive response, got {}", fds.len());

    let pid_read = fds.pop().unwrap();
    let exit_status_read = fds.pop().unwrap();
    let pty_master = fds.pop().unwrap();

    if let Some(pid) = drain_pid(&pid_read) {
        tracing::debug!(pid, "container process started");
    }

    let pty_master_raw = pty_master.as_raw_fd();
    let _raw_mode = tty::RawMode::enter(0).context("entering raw tty mode")?;
    tty::spawn_winch_forwarder(0, pty_master_raw).context("starting SIGWINCH forwarder")?;

    // Duplicates decouple stdin->pty and pty->stdout so each pump pair owns
    // distinct fds, matching wsh.c's loop_interactive.
    let pairs = vec![
        wshd::pump::PumpPair::new(dup_owned(0)?, dup_owned(pty_master_raw)?),
        wshd::pump::PumpPair::new(dup_owned(pty_master_raw)?, dup_owned(1)?),
    ];

    let code = wshd::pump::run(pairs, exit_status_read.as_raw_fd())?;
    drop(pty_master);
    Ok(code)
}

fn loop_noninteractive(stream: &UnixStream) -> Result<i32> {
    let fd = unixmsg::stream_raw_fd(stream);
    let (buf, mut fds) = unixmsg::recv_exact::<{ wire::RESPONSE_SIZE }>(fd)?;
    wire::decode_response(&buf, buf.len())?;
    anyhow::ensure!(fds.len() == 5, "expected 5 fds for a non-interactive response, got {}", fds.len());

    let pid_read = fds.remove(4);
    let exit_status_read = fds.remove(3);
    let stderr_read = fds.remove(2);
    let stdout_read = fds.remove(1);
    let stdin_write = fds.remove(0);

    if let Some(pid) = drain_pid(&pid_read) {
        tracing::debug!(pid, "container process started");
    }

    let pairs = vec![
        wshd::pump::PumpPair::new(dup_owned(0)?, stdin_write),
        wshd::pump::PumpPair::new(stdout_read, dup_owned(1)?),
        wshd::pump::PumpPair::new(stderr_read, dup_owned(2)?),
    ];

    wshd::pump::run(pairs, exit_status_read.as_raw_fd())
}
