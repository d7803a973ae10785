//! The state block carried across the phase-2 `execve` boundary.
//!
//! Grounded on `wormhole`'s `model.rs`/`wormhole-attach::parse_config` split:
//! a JSON-encoded configuration passed as an argv element, plus raw fds left
//! open (not close-on-exec) across the `execve` and recovered by number. This
//! replaces the original's SysV shared-memory segment at a fixed key — see
//! DESIGN.md and SPEC_FULL.md §3/§9 for why.

use std::os::fd::RawFd;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Written once by the phase-2 first image immediately before `execve`, read
/// and consumed exactly once by the `--continue` image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handover {
    /// Host-side hook library path, already resolved to its pivoted form
    /// (`/tmp/garden-host/<original path>`) so hooks run after `--continue`
    /// can still find it.
    pub lib_path: String,
    /// Process title to apply after `--continue`, if `--title` was given.
    pub title: Option<String>,
    /// The listening control-socket fd, inherited (not cloexec) across exec.
    pub socket_fd: RawFd,
    /// The write end of `barrier_child`, inherited across exec so the
    /// `--continue` image can still signal the host parent.
    pub barrier_child_write_fd: RawFd,
}

impl Handover {
    /// Serializes this block to a single argv-safe string.
    pub fn to_arg(&self) -> Result<String> {
        serde_json::to_string(self).context("encoding handover block")
    }

    /// Parses the block back out of the `--continue` argv element.
    pub fn from_arg(arg: &str) -> Result<Self> {
        serde_json::from_str(arg).context("decoding handover block")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let h = Handover {
            lib_path: "/tmp/garden-host/var/vcap/hooks".to_string(),
            title: Some("wshd: container-123".to_string()),
            socket_fd: 7,
            barrier_child_write_fd: 9,
        };
        let arg = h.to_arg().unwrap();
        let back = Handover::from_arg(&arg).unwrap();
        assert_eq!(back.lib_path, h.lib_path);
        assert_eq!(back.title, h.title);
        assert_eq!(back.socket_fd, 7);
        assert_eq!(back.barrier_child_write_fd, 9);
    }

    #[test]
    fn title_is_optional() {
        let h = Handover {
            lib_path: "/x".to_string(),
            title: None,
            socket_fd: 3,
            barrier_child_write_fd: 4,
        };
        let arg = h.to_arg().unwrap();
        assert!(!arg.contains("title") || arg.contains("null"));
        let back = Handover::from_arg(&arg).unwrap();
        assert_eq!(back.title, None);
    }

    #[test]
    fn rejects_garbage_input() {
        assert!(Handover::from_arg("not json").is_err());
    }
}
