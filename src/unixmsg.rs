//! UnixMsg: framed control-socket I/O with ancillary fd passing.
//!
//! Grounded on `wormhole/src/bin/server/main.rs::recv_rpc_client`, which receives
//! two fds over a stream socket via `recvmsg` + `cmsg_space!`/`ControlMessageOwned`.
//! This generalizes that one-shot pattern into the four UnixMsg operations the
//! supervisor and client both need: `listen`, `connect`, `send`, `recv`.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// No caller in this protocol ever exchanges more than 5 ancillary fds (the
/// non-interactive spawn response). Sized generously but fixed, since
/// `nix::cmsg_space!` needs a compile-time array length.
const MAX_ANCILLARY_FDS: usize = 5;

/// Binds a listening stream socket at `path`, unlinking any stale socket file
/// first. The returned listener's fd is close-on-exec (set by `std` on Linux).
pub fn listen(path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).with_context(|| format!("binding control socket at {path:?}"))
}

/// Connects to the control socket at `path`.
pub fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path).with_context(|| format!("connecting to control socket {path:?}"))
}

/// Sends `buf` as a single atomic payload, plus `fds` as ancillary data.
///
/// A single `send` must correspond to a single `recv` of the same size on the
/// peer; callers must not split `buf` across multiple `send` calls.
pub fn send(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> Result<usize> {
    let iov = [IoSlice::new(buf)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)
        .context("sendmsg on control socket")
}

/// Receives into `buf`, returning the number of bytes read and any fds the
/// peer passed as ancillary data (already duplicated into this process and
/// marked close-on-exec). Any ancillary fds beyond `buf`'s pairing capacity are
/// dropped (closed) rather than leaked.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_ANCILLARY_FDS]);
    let mut iov = [IoSliceMut::new(buf)];

    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::MSG_CMSG_CLOEXEC)
        .context("recvmsg on control socket")?;

    if msg.flags.contains(nix::sys::socket::MsgFlags::MSG_CTRUNC) {
        bail!("control message truncated: peer sent more ancillary data than expected");
    }

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().context("decoding control messages")? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received.into_iter().map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }));
        }
    }

    Ok((msg.bytes, fds))
}

/// Convenience: receive a fixed-size record into a caller-sized buffer, failing
/// if the peer sent a different number of bytes than `N` (a protocol
/// violation per the control-socket invariant).
pub fn recv_exact<const N: usize>(fd: RawFd) -> Result<([u8; N], Vec<OwnedFd>)> {
    let mut buf = [0u8; N];
    let (n, fds) = recv(fd, &mut buf)?;
    if n != N {
        bail!("expected exactly {N} bytes, got {n}");
    }
    Ok((buf, fds))
}

pub fn listener_raw_fd(listener: &UnixListener) -> RawFd {
    listener.as_raw_fd()
}

pub fn stream_raw_fd(stream: &UnixStream) -> RawFd {
    stream.as_raw_fd()
}
