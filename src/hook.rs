//! Synchronous lifecycle-hook invocation.
//!
//! Grounded on `wshd.c::hook()` (not retained in the filtered source tree,
//! but named and called at all four lifecycle points in `parent_run`/
//! `child_run`): run `${lib_path}/hook <name>` to completion and abort the
//! phase on non-zero exit.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Invokes `${lib_path}/hook <name>`, waiting for it to finish. Per spec
/// §7 ("Hook failure" -> "Fatal abort of the relevant phase"), a missing hook
/// script or a non-zero exit status is an error the caller should propagate
/// up to whatever `abort()`-equivalent covers that phase.
pub fn run(lib_path: &Path, name: &str) -> Result<()> {
    let hook_path = lib_path.join("hook");
    debug!(hook = %hook_path.display(), name, "invoking lifecycle hook");

    let status = Command::new(&hook_path)
        .arg(name)
        .status()
        .with_context(|| format!("running hook {:?} {name}", hook_path))?;

    if !status.success() {
        bail!("hook {:?} {name} exited with {status}", hook_path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_hook(dir: &Path, body: &str) {
        let path = dir.join("hook");
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn successful_hook_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "#!/bin/sh\nexit 0\n");
        run(dir.path(), "parent-before-clone").unwrap();
    }

    #[test]
    fn failing_hook_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "#!/bin/sh\nexit 1\n");
        assert!(run(dir.path(), "child-before-pivot").is_err());
    }
}
