//! ChildTable: container-PID to exit-status-channel map.
//!
//! Grounded on `wshd.c::child_pid_to_fd_add`/`child_pid_to_fd_remove` (a flat
//! array of `(pid, fd)` pairs, mutated only from the single accept-loop
//! process), generalized from `wormhole-attach/subreaper.rs::run`'s
//! single-tracked-pid callback into a real multi-entry table, and from the
//! design notes' suggestion to replace "EOF-means-signaled" bookkeeping with
//! an explicit tagged outcome.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use anyhow::{Context, Result};
use nix::unistd::{write, Pid};

/// How a reaped child terminated, communicated down its exit-status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled,
}

/// Maps container PIDs to the write end of their exit-status pipe. Entries
/// are created when a child is forked and removed when its SIGCHLD is
/// reaped; a SIGCHLD for a PID with no entry (a reparented grandchild) is
/// simply not found and ignored by the caller.
#[derive(Default)]
pub struct ChildTable {
    entries: HashMap<Pid, OwnedFd>,
}

impl ChildTable {
    pub fn new() -> Self {
        ChildTable::default()
    }

    /// Records `pid`'s exit-status channel. The table takes ownership of
    /// `fd`; callers that also need their own copy must dup before calling.
    pub fn insert(&mut self, pid: Pid, fd: OwnedFd) {
        self.entries.insert(pid, fd);
    }

    /// Removes and completes `pid`'s exit-status channel per its outcome:
    /// `Exited` writes the 32-bit status before the fd is dropped (closed);
    /// `Signaled` just drops it, so the client reads EOF without a value.
    /// Returns `false` if no entry existed for `pid` (reparented grandchild).
    pub fn complete(&mut self, pid: Pid, outcome: ExitOutcome) -> Result<bool> {
        let Some(fd) = self.entries.remove(&pid) else {
            return Ok(false);
        };
        if let ExitOutcome::Exited(code) = outcome {
            let n = write(&fd, &code.to_ne_bytes()).context("writing exit status to client")?;
            if n != 4 {
                anyhow::bail!("short write of exit status to client");
            }
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, read};

    #[test]
    fn exited_writes_status_then_removes_entry() {
        let mut table = ChildTable::new();
        let (r, w) = pipe().unwrap();
        let pid = Pid::from_raw(4242);
        table.insert(pid, w);

        assert!(table.complete(pid, ExitOutcome::Exited(3)).unwrap());
        assert_eq!(table.len(), 0);

        let mut buf = [0u8; 4];
        read(&r, &mut buf).unwrap();
        assert_eq!(i32::from_ne_bytes(buf), 3);
    }

    #[test]
    fn signaled_closes_without_writing() {
        let mut table = ChildTable::new();
        let (r, w) = pipe().unwrap();
        let pid = Pid::from_raw(99);
        table.insert(pid, w);

        assert!(table.complete(pid, ExitOutcome::Signaled).unwrap());

        let mut buf = [0u8; 4];
        let n = read(&r, &mut buf).unwrap();
        assert_eq!(n, 0); // EOF: death by signal
    }

    #[test]
    fn unknown_pid_is_reported_as_absent() {
        let mut table = ChildTable::new();
        assert!(!table.complete(Pid::from_raw(1), ExitOutcome::Signaled).unwrap());
    }
}
