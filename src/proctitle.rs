//! `setproctitle(3)`-equivalent: overwrite the `ps`-visible argv region, not
//! just the 15-byte `/proc/pid/comm` name.
//!
//! Grounded on `wormhole-attach/proc.rs::set_cmdline_name`, which uses
//! `PR_SET_MM_ARG_START`/`PR_SET_MM_ARG_END` over a freshly `mmap`'d region.
//! `nix::sys::prctl::set_name` alone would only rename `comm`, which `ps -ef`
//! does not display — the original's `setproctitle` replaces argv itself, so
//! this crate needs the same mechanism to match its externally visible
//! behavior.

use std::ffi::{c_char, CString};
use std::ptr::null_mut;

use anyhow::Result;
use nix::errno::Errno;

use crate::err;

/// Sets both `/proc/pid/comm` and the argv region `ps` reads.
pub fn set_title(name: &str) -> Result<()> {
    let cstr = CString::new(name)?;
    nix::sys::prctl::set_name(&cstr)?;

    // SAFETY: a fresh anonymous private mapping, sized to hold the
    // NUL-terminated name, with no other references.
    let argv_start = unsafe {
        libc::mmap(
            null_mut(),
            name.len() + 1,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if argv_start == libc::MAP_FAILED {
        return Err(Errno::last().into());
    }
    let argv_start = argv_start as *mut c_char;

    // SAFETY: argv_start points at a just-allocated mapping of exactly
    // name.len() + 1 bytes; copy_nonoverlapping writes within that bound.
    unsafe {
        std::ptr::copy_nonoverlapping(cstr.as_ptr(), argv_start, name.len() + 1);

        let argv_end = argv_start.add(name.len() + 1);
        // The kernel rejects an ARG_START past the current ARG_END, so on
        // first use we must set END first; this is reflected by which call
        // fails, matching the source function's retry shape.
        if err(libc::prctl(libc::PR_SET_MM, libc::PR_SET_MM_ARG_START, argv_start, 0, 0)).is_err()
        {
            err(libc::prctl(libc::PR_SET_MM, libc::PR_SET_MM_ARG_END, argv_end, 0, 0))?;
            err(libc::prctl(libc::PR_SET_MM, libc::PR_SET_MM_ARG_START, argv_start, 0, 0))?;
        } else {
            err(libc::prctl(libc::PR_SET_MM, libc::PR_SET_MM_ARG_END, argv_end, 0, 0))?;
        }
    }

    Ok(())
}
