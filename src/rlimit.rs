//! rlimit wire<->kernel conversion, and the hard-rlimit raise performed once
//! at supervisor startup.
//!
//! Grounded on `wshd.c::set_hard_rlimit(s)`/`max_nr_open` — including the
//! latter's "short read is fatal" behavior (see DESIGN.md Open Questions).

use std::io::Read;

use anyhow::{bail, Context, Result};
use libc::RLIM_INFINITY;
use nix::sys::resource::{getrlimit, setrlimit, Resource};

use crate::wire::RlimitEntry;

const NR_OPEN_PATH: &str = "/proc/sys/fs/nr_open";

/// Every rlimit `set_hard_rlimits` raises to "infinity", in the order the
/// original raises them. `RLIMIT_NOFILE` is handled separately below, since it
/// is raised to `max_nr_open()` rather than infinity.
const INFINITE_HARD_RLIMITS: &[(&str, Resource)] = &[
    ("RLIMIT_AS", Resource::RLIMIT_AS),
    ("RLIMIT_CORE", Resource::RLIMIT_CORE),
    ("RLIMIT_CPU", Resource::RLIMIT_CPU),
    ("RLIMIT_DATA", Resource::RLIMIT_DATA),
    ("RLIMIT_FSIZE", Resource::RLIMIT_FSIZE),
    ("RLIMIT_LOCKS", Resource::RLIMIT_LOCKS),
    ("RLIMIT_MEMLOCK", Resource::RLIMIT_MEMLOCK),
    ("RLIMIT_MSGQUEUE", Resource::RLIMIT_MSGQUEUE),
    ("RLIMIT_NICE", Resource::RLIMIT_NICE),
    ("RLIMIT_NPROC", Resource::RLIMIT_NPROC),
    ("RLIMIT_RSS", Resource::RLIMIT_RSS),
    ("RLIMIT_RTPRIO", Resource::RLIMIT_RTPRIO),
    ("RLIMIT_SIGPENDING", Resource::RLIMIT_SIGPENDING),
    ("RLIMIT_STACK", Resource::RLIMIT_STACK),
];

/// Reads `/proc/sys/fs/nr_open` into a fixed 32-byte buffer and parses it as
/// the kernel's maximum allowed open-file count.
///
/// A short read (0 bytes) is fatal, matching `wshd.c::max_nr_open`'s
/// `fread`+abort. This port additionally treats a read that fills the entire
/// buffer as fatal rather than parsing whatever numeric prefix happened to
/// land inside it — the original reads the raw bytes into a stack buffer with
/// no bounds check past that point, which would silently parse a truncated
/// value for any contents longer than 32 bytes. We'd rather abort than trust
/// a truncated number.
pub fn max_nr_open() -> Result<u64> {
    let mut buf = [0u8; 32];
    let mut f =
        std::fs::File::open(NR_OPEN_PATH).with_context(|| format!("opening {NR_OPEN_PATH}"))?;
    let n = f
        .read(&mut buf)
        .with_context(|| format!("reading {NR_OPEN_PATH}"))?;
    if n == 0 {
        bail!("short read (0 bytes) from {NR_OPEN_PATH}");
    }
    if n == buf.len() {
        bail!(
            "{NR_OPEN_PATH} contents did not fit in a {}-byte buffer; refusing to parse a truncated numeric prefix",
            buf.len()
        );
    }
    let text = std::str::from_utf8(&buf[..n])
        .with_context(|| format!("{NR_OPEN_PATH} is not valid UTF-8"))?
        .trim();
    text.parse::<u64>()
        .with_context(|| format!("could not parse {NR_OPEN_PATH} contents {text:?}"))
}

fn raise_hard_limit(name: &str, resource: Resource, hard: u64) -> Result<()> {
    let (soft, _) = getrlimit(resource).with_context(|| format!("getrlimit({name})"))?;
    setrlimit(resource, soft, hard).with_context(|| format!("setrlimit({name}, .., {hard})"))
}

/// Raises every hard rlimit to its maximum kernel-permitted value, so that
/// a later, unprivileged `setrlimit` inside the container can set soft (and
/// hard) limits to anything up to the kernel ceiling.
pub fn set_hard_rlimits() -> Result<()> {
    for (name, resource) in INFINITE_HARD_RLIMITS {
        raise_hard_limit(name, *resource, RLIM_INFINITY as u64)?;
    }
    let nofile_max = max_nr_open()?;
    raise_hard_limit("RLIMIT_NOFILE", Resource::RLIMIT_NOFILE, nofile_max)
}

/// Maps a wire `resource` id (a raw kernel `RLIMIT_*` constant, passed
/// through unchanged by the client) to the matching `nix` `Resource`. `as
/// u32` comparisons sidestep the fact that `libc`'s `RLIMIT_*` constants are
/// not uniformly typed across the constants it exports.
pub fn resource_from_wire_id(id: i32) -> Option<Resource> {
    let id = id as u32;
    let table: &[(i32, Resource)] = &[
        (libc::RLIMIT_AS, Resource::RLIMIT_AS),
        (libc::RLIMIT_CORE, Resource::RLIMIT_CORE),
        (libc::RLIMIT_CPU, Resource::RLIMIT_CPU),
        (libc::RLIMIT_DATA, Resource::RLIMIT_DATA),
        (libc::RLIMIT_FSIZE, Resource::RLIMIT_FSIZE),
        (libc::RLIMIT_LOCKS, Resource::RLIMIT_LOCKS),
        (libc::RLIMIT_MEMLOCK, Resource::RLIMIT_MEMLOCK),
        (libc::RLIMIT_MSGQUEUE, Resource::RLIMIT_MSGQUEUE),
        (libc::RLIMIT_NICE, Resource::RLIMIT_NICE),
        (libc::RLIMIT_NOFILE, Resource::RLIMIT_NOFILE),
        (libc::RLIMIT_NPROC, Resource::RLIMIT_NPROC),
        (libc::RLIMIT_RSS, Resource::RLIMIT_RSS),
        (libc::RLIMIT_RTPRIO, Resource::RLIMIT_RTPRIO),
        (libc::RLIMIT_SIGPENDING, Resource::RLIMIT_SIGPENDING),
        (libc::RLIMIT_STACK, Resource::RLIMIT_STACK),
    ];
    table
        .iter()
        .find(|(raw, _)| *raw as u32 == id)
        .map(|(_, r)| *r)
}

/// Snapshots every supported rlimit from *this* process, for the client side
/// of the wire: `wsh` forwards its own current limits so the spawned process
/// starts with the same ones. Mirrors `msg_rlimit_import` as called from
/// `wsh.c::main`, which reads the client's own `getrlimit` values rather than
/// any configuration file.
pub fn export_rlimits() -> Result<Vec<RlimitEntry>> {
    const WIRE_IDS: &[i32] = &[
        libc::RLIMIT_AS,
        libc::RLIMIT_CORE,
        libc::RLIMIT_CPU,
        libc::RLIMIT_DATA,
        libc::RLIMIT_FSIZE,
        libc::RLIMIT_LOCKS,
        libc::RLIMIT_MEMLOCK,
        libc::RLIMIT_MSGQUEUE,
        libc::RLIMIT_NICE,
        libc::RLIMIT_NOFILE,
        libc::RLIMIT_NPROC,
        libc::RLIMIT_RSS,
        libc::RLIMIT_RTPRIO,
        libc::RLIMIT_SIGPENDING,
        libc::RLIMIT_STACK,
    ];

    let mut entries = Vec::with_capacity(WIRE_IDS.len());
    for &id in WIRE_IDS {
        let resource = resource_from_wire_id(id).expect("WIRE_IDS only lists mapped resources");
        let (soft, hard) = getrlimit(resource).with_context(|| format!("getrlimit({resource:?})"))?;
        entries.push(RlimitEntry { resource: id, soft, hard });
    }
    Ok(entries)
}

/// Applies every `(resource, soft, hard)` entry a request carries, in order.
pub fn apply_rlimits(entries: &[RlimitEntry]) -> Result<()> {
    for entry in entries {
        let resource = resource_from_wire_id(entry.resource)
            .with_context(|| format!("unsupported rlimit resource id {}", entry.resource))?;
        setrlimit(resource, entry.soft, entry.hard)
            .with_context(|| format!("setrlimit({resource:?}, {}, {})", entry.soft, entry.hard))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ids_round_trip_through_libc_constants() {
        assert_eq!(
            resource_from_wire_id(libc::RLIMIT_NOFILE as i32),
            Some(Resource::RLIMIT_NOFILE)
        );
        assert_eq!(
            resource_from_wire_id(libc::RLIMIT_STACK as i32),
            Some(Resource::RLIMIT_STACK)
        );
    }

    #[test]
    fn unknown_resource_id_is_none() {
        assert_eq!(resource_from_wire_id(-1), None);
    }

    #[test]
    fn export_rlimits_covers_every_supported_resource() {
        let entries = export_rlimits().unwrap();
        assert_eq!(entries.len(), crate::wire::MAX_RLIMITS);
        for entry in &entries {
            assert!(resource_from_wire_id(entry.resource).is_some());
        }
    }
}
