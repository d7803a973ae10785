//! PumpLoop: multi-pair byte shuttling with an exit-status sentinel.
//!
//! Grounded on `original_source/.../wsh/wsh.c::pump_loop` — build a readiness
//! set covering every pair plus the sentinel fd, `select`, copy bytes for each
//! ready pair, and on sentinel-ready do one more copy pass before reporting the
//! delivered exit code (or 255 on EOF, i.e. death by signal).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;

use crate::rawio::{read, write};

const BUF_SIZE: usize = 16 * 1024;

/// A `(source, sink)` descriptor pair with its own in-flight buffer. Either end
/// may be `None` once EOF/EPIPE makes it dead; the pair is dropped once both
/// ends are gone.
pub struct PumpPair {
    source: Option<OwnedFd>,
    sink: Option<OwnedFd>,
    buf: Vec<u8>,
    len: usize,
}

impl PumpPair {
    pub fn new(source: OwnedFd, sink: OwnedFd) -> Self {
        PumpPair { source: Some(source), sink: Some(sink), buf: vec![0u8; BUF_SIZE], len: 0 }
    }

    fn is_dead(&self) -> bool {
        self.source.is_none() && self.sink.is_none()
    }

    /// Attempts one read (if source is readable and there's buffer room) and
    /// one write (if sink is writable and there are pending bytes). Called once
    /// per pair per loop iteration, and once more after the sentinel fires.
    fn copy(&mut self, readable: &FdSet, writable: &FdSet) -> Result<()> {
        if let Some(source) = &self.source {
            if self.len < self.buf.len() && readable.contains(source.as_raw_fd()) {
                match read(source.as_raw_fd(), &mut self.buf[self.len..]) {
                    Ok(0) => self.source = None, // EOF
                    Ok(n) => self.len += n,
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                    Err(e) => return Err(e).context("reading pump source"),
                }
            }
        }

        if let Some(sink) = &self.sink {
            if self.len > 0 && writable.contains(sink.as_raw_fd()) {
                match write(sink.as_raw_fd(), &self.buf[..self.len]) {
                    Ok(n) => {
                        self.buf.copy_within(n..self.len, 0);
                        self.len -= n;
                    }
                    Err(Errno::EPIPE) => self.sink = None,
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                    Err(e) => return Err(e).context("writing pump sink"),
                }
            }
        }

        if self.source.is_none() && self.len == 0 {
            self.sink = None;
        }

        Ok(())
    }

    fn want_read(&self) -> Option<RawFd> {
        self.source
            .as_ref()
            .filter(|_| self.len < self.buf.len())
            .map(|fd| fd.as_raw_fd())
    }

    fn want_write(&self) -> Option<RawFd> {
        self.sink.as_ref().filter(|_| self.len > 0).map(|fd| fd.as_raw_fd())
    }
}

/// Death-by-signal sentinel exit code: the exit-status fd hit EOF without ever
/// delivering a 32-bit status.
pub const SIGNALED_EXIT_CODE: i32 = 255;

/// Drives `pairs` to completion, returning the exit code to report once the
/// sentinel fires (either the delivered status, or [`SIGNALED_EXIT_CODE`] on
/// EOF). Restart-on-EINTR; no other suspension points.
pub fn run(mut pairs: Vec<PumpPair>, exit_status_fd: RawFd) -> Result<i32> {
    loop {
        let mut readfds = FdSet::new();
        let mut writefds = FdSet::new();
        let mut maxfd = exit_status_fd;
        readfds.insert(exit_status_fd);

        for pair in &pairs {
            if let Some(fd) = pair.want_read() {
                readfds.insert(fd);
                maxfd = maxfd.max(fd);
            }
            if let Some(fd) = pair.want_write() {
                writefds.insert(fd);
                maxfd = maxfd.max(fd);
            }
        }

        let nready = loop {
            match select(Some(maxfd + 1), Some(&mut readfds), Some(&mut writefds), None, None) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("select in pump loop"),
            }
        };
        let _ = nready;

        for pair in &mut pairs {
            pair.copy(&readfds, &writefds)?;
        }
        pairs.retain(|p| !p.is_dead());

        if readfds.contains(exit_status_fd) {
            let mut status_buf = [0u8; 4];
            let n = read(exit_status_fd, &mut status_buf).context("reading exit-status sentinel")?;

            // One more pass before reporting the exit code, so a source's
            // last bytes — still sitting in its kernel buffer rather than
            // copied into ours during this same iteration — aren't
            // truncated. This has to poll source readiness too, not just
            // flush already-buffered writes, so build a fresh readable/
            // writable set and check it with a zero-timeout select before
            // copying.
            let mut flush_readfds = FdSet::new();
            let mut flush_writefds = FdSet::new();
            let mut flush_maxfd = None;
            for pair in &pairs {
                if let Some(fd) = pair.want_read() {
                    flush_readfds.insert(fd);
                    flush_maxfd = Some(flush_maxfd.map_or(fd, |m: RawFd| m.max(fd)));
                }
                if let Some(fd) = pair.want_write() {
                    flush_writefds.insert(fd);
                    flush_maxfd = Some(flush_maxfd.map_or(fd, |m: RawFd| m.max(fd)));
                }
            }
            if let Some(flush_maxfd) = flush_maxfd {
                let mut zero_timeout = TimeVal::new(0, 0);
                match select(
                    Some(flush_maxfd + 1),
                    Some(&mut flush_readfds),
                    Some(&mut flush_writefds),
                    None,
                    Some(&mut zero_timeout),
                ) {
                    Ok(_) => {}
                    // A zero-timeout select has nothing useful to retry: treat
                    // any failure as "nothing ready" rather than risk a
                    // blocking read/write below on fds select didn't vouch for.
                    Err(_) => {
                        flush_readfds = FdSet::new();
                        flush_writefds = FdSet::new();
                    }
                }
            }
            for pair in &mut pairs {
                pair.copy(&flush_readfds, &flush_writefds)?;
            }

            return match n {
                0 => Ok(SIGNALED_EXIT_CODE),
                4 => Ok(i32::from_ne_bytes(status_buf)),
                other => anyhow::bail!("short read of exit status sentinel: {other} bytes"),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    // Shadows the `crate::rawio::{read, write}` brought in by `use super::*`:
    // tests read/write through plain `OwnedFd` references, not raw fds.
    use nix::unistd::{pipe, read, write};
    use std::os::fd::AsRawFd;

    #[test]
    fn pumps_bytes_and_reports_exit_status() {
        let (src_r, src_w) = pipe().unwrap();
        let (sink_r, sink_w) = pipe().unwrap();
        let (status_r, status_w) = pipe().unwrap();

        write(&src_w, b"hello").unwrap();
        drop(src_w); // EOF on source after this single write

        write(&status_w, &42i32.to_ne_bytes()).unwrap();
        drop(status_w);

        let pairs = vec![PumpPair::new(src_r, sink_w)];
        let code = run(pairs, status_r.as_raw_fd()).unwrap();
        assert_eq!(code, 42);

        let mut out = [0u8; 5];
        read(&sink_r, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn eof_without_status_reports_signaled() {
        let (status_r, status_w) = pipe().unwrap();
        drop(status_w);
        let code = run(Vec::new(), status_r.as_raw_fd()).unwrap();
        assert_eq!(code, SIGNALED_EXIT_CODE);
    }
}
