//! Fixed-size wire records for the control socket, matching the original `msg.h`
//! layout (plus the `bind_mount_source`/`bind_mount_destination` fields spec'd in
//! the data model but not present in this source tree's filtered `msg.h` snapshot).
//!
//! The wire shape is a single fixed-size record per connection: a `Request` is sent
//! as exactly [`REQUEST_SIZE`] bytes, a `Signal` as exactly [`SIGNAL_SIZE`] bytes.
//! Both share the same two-field header (`version`, `type`), mirroring the C
//! union's common prefix, but are modeled here as an exhaustive Rust enum instead
//! of an untagged union.

use std::mem::size_of;

use anyhow::{anyhow, bail, Result};

pub const VERSION: i32 = 1;

/// Matches `msg__array_s.buf`.
pub const ARG_BUF_LEN: usize = 8 * 1024;
/// Matches `msg__user_s.name`.
pub const USER_NAME_LEN: usize = 32;
/// Matches `msg__dir_s.path`.
pub const DIR_PATH_LEN: usize = 1024;

/// Resource kinds carried over the wire. Not every kernel rlimit constant is
/// portably exposed by `libc`/`nix` (there is no stable `RLIMIT_NLIMITS`), so this
/// is an explicit, fixed list rather than "all of them" — it covers every limit
/// `setrlimit(2)` on Linux accepts through `nix::sys::resource::Resource`.
pub const MAX_RLIMITS: usize = 15;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Request = 0,
    Signal = 1,
}

impl MsgType {
    fn from_raw(v: i32) -> Result<Self> {
        match v {
            0 => Ok(MsgType::Request),
            1 => Ok(MsgType::Signal),
            other => bail!("unknown message type {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RlimitEntry {
    pub resource: i32,
    pub soft: u64,
    pub hard: u64,
}

/// A `(resource, soft, hard)` request. Fields default to "leave unset" semantics
/// via an empty `Vec` — only rlimits actually present in the request are applied.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub tty: bool,
    pub arg: Vec<String>,
    pub env: Vec<String>,
    pub rlim: Vec<RlimitEntry>,
    pub user: String,
    pub dir: String,
    pub bind_mount_source: Option<String>,
    pub bind_mount_destination: Option<String>,
}

impl Request {
    /// A request carrying `bind_mount_*` is a distinct mode and must not also
    /// carry argv/env (data model invariant).
    pub fn is_bind_mount(&self) -> bool {
        self.bind_mount_source.is_some() && self.bind_mount_destination.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Signal {
    pub signal: i32,
    pub pid: i32,
}

#[derive(Debug, Clone)]
pub enum WireMessage {
    Request(Request),
    Signal(Signal),
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawArray {
    count: i32,
    buf: [u8; ARG_BUF_LEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawRlimits {
    count: i32,
    entries: [RawRlimitEntry; MAX_RLIMITS],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawRlimitEntry {
    resource: i32,
    soft: u64,
    hard: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawUser {
    name: [u8; USER_NAME_LEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawDir {
    path: [u8; DIR_PATH_LEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawRequest {
    version: i32,
    msg_type: i32,
    tty: i32,
    arg: RawArray,
    env: RawArray,
    rlim: RawRlimits,
    user: RawUser,
    dir: RawDir,
    bind_mount_source: RawDir,
    bind_mount_destination: RawDir,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawSignal {
    version: i32,
    msg_type: i32,
    signal: i32,
    pid: i32,
}

pub const REQUEST_SIZE: usize = size_of::<RawRequest>();
pub const SIGNAL_SIZE: usize = size_of::<RawSignal>();

/// Packs `strings` as NUL-separated entries into `buf`, returning the count.
/// Rejects (does not truncate) input that would not fit.
fn pack_strings(strings: &[String], buf: &mut [u8; ARG_BUF_LEN]) -> Result<i32> {
    buf.fill(0);
    let mut offset = 0usize;
    for s in strings {
        if s.as_bytes().contains(&0) {
            bail!("string contains embedded NUL");
        }
        let needed = s.len() + 1;
        if offset + needed > buf.len() {
            bail!("too much data for packed argument/environment buffer");
        }
        buf[offset..offset + s.len()].copy_from_slice(s.as_bytes());
        offset += needed; // NUL terminator left as the zero byte already in place
    }
    Ok(strings.len() as i32)
}

fn unpack_strings(count: i32, buf: &[u8; ARG_BUF_LEN]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(count.max(0) as usize);
    let mut offset = 0usize;
    for _ in 0..count {
        let end = buf[offset..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| anyhow!("packed buffer missing NUL terminator"))?;
        let s = std::str::from_utf8(&buf[offset..offset + end])
            .map_err(|_| anyhow!("packed string is not valid UTF-8"))?
            .to_owned();
        offset += end + 1;
        out.push(s);
    }
    Ok(out)
}

fn pack_bounded(s: &str, buf: &mut [u8]) -> Result<()> {
    buf.fill(0);
    if s.as_bytes().contains(&0) {
        bail!("string contains embedded NUL");
    }
    if s.len() + 1 > buf.len() {
        bail!("string of {} bytes exceeds bounded field of {}", s.len(), buf.len() - 1);
    }
    buf[..s.len()].copy_from_slice(s.as_bytes());
    Ok(())
}

fn unpack_bounded(buf: &[u8]) -> Result<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(std::str::from_utf8(&buf[..end])
        .map_err(|_| anyhow!("bounded field is not valid UTF-8"))?
        .to_owned())
}

impl Request {
    pub fn to_bytes(&self) -> Result<[u8; REQUEST_SIZE]> {
        if self.is_bind_mount() && (!self.arg.is_empty() || !self.env.is_empty()) {
            bail!("a bind-mount request must not also carry argv/env");
        }
        if self.rlim.len() > MAX_RLIMITS {
            bail!("too many rlimit entries");
        }

        // Zero the whole struct (including any compiler-inserted padding) up front
        // so the byte-array transmute below never exposes uninitialized bytes.
        // SAFETY: RawRequest is entirely plain-old-data; the all-zero bit pattern
        // is a valid value for every field.
        let mut raw: RawRequest = unsafe { std::mem::zeroed() };
        raw.version = VERSION;
        raw.msg_type = MsgType::Request as i32;
        raw.tty = self.tty as i32;
        raw.rlim.count = self.rlim.len() as i32;

        raw.arg.count = pack_strings(&self.arg, &mut raw.arg.buf)?;
        raw.env.count = pack_strings(&self.env, &mut raw.env.buf)?;
        for (i, entry) in self.rlim.iter().enumerate() {
            raw.rlim.entries[i] = RawRlimitEntry {
                resource: entry.resource,
                soft: entry.soft,
                hard: entry.hard,
            };
        }
        pack_bounded(&self.user, &mut raw.user.name)?;
        pack_bounded(&self.dir, &mut raw.dir.path)?;
        if let Some(src) = &self.bind_mount_source {
            pack_bounded(src, &mut raw.bind_mount_source.path)?;
        }
        if let Some(dst) = &self.bind_mount_destination {
            pack_bounded(dst, &mut raw.bind_mount_destination.path)?;
        }

        // SAFETY: RawRequest is a repr(C) struct of plain-old-data fields
        // (i32/u64/fixed byte arrays); every bit pattern is valid, so reinterpreting
        // it as a byte array is sound.
        Ok(unsafe { std::mem::transmute::<RawRequest, [u8; REQUEST_SIZE]>(raw) })
    }

    fn from_raw(raw: &RawRequest) -> Result<Self> {
        if raw.version != VERSION {
            bail!("unsupported request version {}", raw.version);
        }
        if MsgType::from_raw(raw.msg_type)? != MsgType::Request {
            bail!("expected REQUEST message type");
        }
        let bind_src = unpack_bounded(&raw.bind_mount_source.path)?;
        let bind_dst = unpack_bounded(&raw.bind_mount_destination.path)?;
        Ok(Request {
            tty: raw.tty != 0,
            arg: unpack_strings(raw.arg.count, &raw.arg.buf)?,
            env: unpack_strings(raw.env.count, &raw.env.buf)?,
            rlim: raw.rlim.entries[..raw.rlim.count.max(0) as usize]
                .iter()
                .map(|e| RlimitEntry { resource: e.resource, soft: e.soft, hard: e.hard })
                .collect(),
            user: unpack_bounded(&raw.user.name)?,
            dir: unpack_bounded(&raw.dir.path)?,
            bind_mount_source: (!bind_src.is_empty()).then_some(bind_src),
            bind_mount_destination: (!bind_dst.is_empty()).then_some(bind_dst),
        })
    }
}

impl Signal {
    pub fn to_bytes(&self) -> [u8; SIGNAL_SIZE] {
        // SAFETY: see Request::to_bytes — zeroed first to avoid transmuting
        // uninitialized padding.
        let mut raw: RawSignal = unsafe { std::mem::zeroed() };
        raw.version = VERSION;
        raw.msg_type = MsgType::Signal as i32;
        raw.signal = self.signal;
        raw.pid = self.pid;
        unsafe { std::mem::transmute::<RawSignal, [u8; SIGNAL_SIZE]>(raw) }
    }

    fn from_raw(raw: &RawSignal) -> Result<Self> {
        if raw.version != VERSION {
            bail!("unsupported signal version {}", raw.version);
        }
        if MsgType::from_raw(raw.msg_type)? != MsgType::Signal {
            bail!("expected SIGNAL message type");
        }
        Ok(Signal { signal: raw.signal, pid: raw.pid })
    }
}

/// The fixed 4-byte payload sent alongside fd-carrying responses (the
/// interactive/non-interactive spawn acks). Matches `msg_response_s` — a bare
/// version stamp; the client doesn't need anything else, since the fds
/// themselves (or their absence, on error) are the actual response.
pub const RESPONSE_SIZE: usize = size_of::<i32>();

pub fn response_bytes() -> [u8; RESPONSE_SIZE] {
    VERSION.to_ne_bytes()
}

pub fn decode_response(buf: &[u8], n: usize) -> Result<()> {
    if n != RESPONSE_SIZE {
        bail!("response of {n} bytes does not match expected size {RESPONSE_SIZE}");
    }
    let version = i32::from_ne_bytes(buf[..RESPONSE_SIZE].try_into().unwrap());
    if version != VERSION {
        bail!("unsupported response version {version}");
    }
    Ok(())
}

/// Decodes a datagram of exactly `n` bytes read from the control socket into a
/// [`WireMessage`]. Per the control-socket invariant, any length other than
/// [`REQUEST_SIZE`] or [`SIGNAL_SIZE`] is a protocol violation.
pub fn decode(buf: &[u8], n: usize) -> Result<WireMessage> {
    if n == REQUEST_SIZE {
        let mut raw = std::mem::MaybeUninit::<RawRequest>::uninit();
        // SAFETY: `buf[..n]` is exactly `size_of::<RawRequest>()` bytes and
        // RawRequest has no padding-sensitive invariants beyond plain data.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), raw.as_mut_ptr() as *mut u8, n);
            Ok(WireMessage::Request(Request::from_raw(&raw.assume_init())?))
        }
    } else if n == SIGNAL_SIZE {
        let mut raw = std::mem::MaybeUninit::<RawSignal>::uninit();
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), raw.as_mut_ptr() as *mut u8, n);
            Ok(WireMessage::Signal(Signal::from_raw(&raw.assume_init())?))
        }
    } else {
        bail!("datagram of {n} bytes does not match request ({REQUEST_SIZE}) or signal ({SIGNAL_SIZE}) size");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_every_field() {
        let req = Request {
            tty: true,
            arg: vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            env: vec!["FOO=bar".to_string()],
            rlim: vec![RlimitEntry { resource: 7, soft: 256, hard: 1024 }],
            user: "vcap".to_string(),
            dir: "/home/vcap".to_string(),
            bind_mount_source: None,
            bind_mount_destination: None,
        };
        let bytes = req.to_bytes().unwrap();
        let decoded = decode(&bytes, bytes.len()).unwrap();
        match decoded {
            WireMessage::Request(got) => {
                assert_eq!(got.tty, req.tty);
                assert_eq!(got.arg, req.arg);
                assert_eq!(got.env, req.env);
                assert_eq!(got.rlim.len(), 1);
                assert_eq!(got.rlim[0].soft, 256);
                assert_eq!(got.user, req.user);
                assert_eq!(got.dir, req.dir);
                assert!(!got.is_bind_mount());
            }
            WireMessage::Signal(_) => panic!("expected request"),
        }
    }

    #[test]
    fn bind_mount_request_round_trips() {
        let req = Request {
            bind_mount_source: Some("/host/x".to_string()),
            bind_mount_destination: Some("/c/x".to_string()),
            ..Default::default()
        };
        let bytes = req.to_bytes().unwrap();
        let decoded = decode(&bytes, bytes.len()).unwrap();
        match decoded {
            WireMessage::Request(got) => assert!(got.is_bind_mount()),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn bind_mount_with_argv_is_rejected() {
        let req = Request {
            arg: vec!["x".to_string()],
            bind_mount_source: Some("/host/x".to_string()),
            bind_mount_destination: Some("/c/x".to_string()),
            ..Default::default()
        };
        assert!(req.to_bytes().is_err());
    }

    #[test]
    fn oversize_string_is_rejected_not_truncated() {
        let req = Request { user: "x".repeat(USER_NAME_LEN), ..Default::default() };
        assert!(req.to_bytes().is_err());
    }

    #[test]
    fn signal_round_trips() {
        let sig = Signal { signal: 15, pid: 4242 };
        let bytes = sig.to_bytes();
        match decode(&bytes, bytes.len()).unwrap() {
            WireMessage::Signal(got) => {
                assert_eq!(got.signal, 15);
                assert_eq!(got.pid, 4242);
            }
            _ => panic!("expected signal"),
        }
    }

    #[test]
    fn short_datagram_is_rejected() {
        let buf = [0u8; 4];
        assert!(decode(&buf, buf.len()).is_err());
    }

    #[test]
    fn response_round_trips() {
        let bytes = response_bytes();
        assert!(decode_response(&bytes, bytes.len()).is_ok());
    }

    #[test]
    fn response_rejects_wrong_version() {
        let bytes = 99i32.to_ne_bytes();
        assert!(decode_response(&bytes, bytes.len()).is_err());
    }
}
