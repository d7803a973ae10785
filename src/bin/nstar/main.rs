//! `nstar`: namespace-traversing tar bridge.
//!
//! Grounded in both versions of `nstar.c` (old: uid-keyed, recursive
//! `mkdir_p_as`/`mkdir_as` with create-only chown; new: user-namespace-aware,
//! `getpwnam`-by-name, single-shot `mkdir_p_as`). This follows the new
//! version's namespace/user-lookup flow but keeps the old version's
//! create-only-chown semantics for `mkdir_p_as` (a pre-existing directory's
//! ownership must survive the walk), and resolves the final-component
//! `chown(tmp, uid, uid)` typo the newer `nstar.c` has by using the resolved
//! gid there too (see DESIGN.md Open Questions).

use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, fchdir, setgid, setuid, Gid, Uid, User};

#[derive(Parser, Debug)]
#[command(
    name = "nstar",
    about = "Stream a tar archive into (or out of) a container's filesystem, as a given container user"
)]
struct Args {
    /// PID of the target wshd/container-init process.
    wshd_pid: i32,

    /// Container user to resolve the destination owner and tar identity from.
    user: String,

    /// Destination directory (inside the container's mount namespace).
    destination: String,

    /// If given, tar these paths to stdout (`tar cf -`) instead of
    /// extracting stdin into `destination` (`tar xf -`).
    files: Vec<String>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    init_tracing();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("nstar: {e:#}");
        std::process::exit(1);
    }

    // The only way past `run` returning `Ok` is `execve` succeeding, in
    // which case this process image is already gone. Reaching here means
    // `execve` returned without error, which POSIX does not allow.
    eprintln!("nstar: unreachable: execve returned success");
    std::process::exit(2);
}

fn open_ro_dir(path: &str) -> Result<OwnedFd> {
    let raw = open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("opening {path}"))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn borrowed(fd: &OwnedFd) -> BorrowedFd<'_> {
    unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) }
}

fn run(args: &Args) -> Result<()> {
    let mnt_ns_path = format!("/proc/{}/ns/mnt", args.wshd_pid);
    let user_ns_path = format!("/proc/{}/ns/user", args.wshd_pid);

    let mnt_ns_fd = open_ro_dir_or_file(&mnt_ns_path)?;
    let user_ns_fd = open_ro_dir_or_file(&user_ns_path)?;
    let host_root_fd = open_ro_dir("/")?;

    setns(borrowed(&mnt_ns_fd), CloneFlags::CLONE_NEWNS)
        .with_context(|| format!("setns(CLONE_NEWNS) into {mnt_ns_path}"))?;
    drop(mnt_ns_fd);

    // Best-effort: a container started without `--userns 1` has no user
    // namespace of its own, and this setns is expected to fail. Uid/gid
    // resolution then proceeds against the shared host user database, which
    // is what the container's own view would have resolved to anyway.
    let _ = setns(borrowed(&user_ns_fd), CloneFlags::CLONE_NEWUSER);
    drop(user_ns_fd);

    let pw = User::from_name(&args.user)
        .with_context(|| format!("looking up user {:?}", args.user))?
        .with_context(|| format!("no such user {:?}", args.user))?;

    chdir(pw.dir.as_path()).with_context(|| format!("chdir {:?}", pw.dir))?;
    setgid(Gid::from_raw(0)).context("setgid(0)")?;
    setuid(Uid::from_raw(0)).context("setuid(0)")?;

    mkdir_p_as(Path::new(&args.destination), pw.uid, pw.gid)
        .with_context(|| {
            format!(
                "creating {:?} owned by {}:{}",
                args.destination,
                pw.uid.as_raw(),
                pw.gid.as_raw()
            )
        })?;

    let container_dest_fd = open_ro_dir(&args.destination)
        .with_context(|| format!("opening created destination {:?}", args.destination))?;

    fchdir(host_root_fd.as_raw_fd()).context("fchdir to host rootfs")?;
    chroot(".").context("chroot to host rootfs")?;
    drop(host_root_fd);

    fchdir(container_dest_fd.as_raw_fd()).context("fchdir to container destination")?;
    drop(container_dest_fd);

    setgid(pw.gid).with_context(|| format!("setgid({})", pw.gid.as_raw()))?;
    setuid(pw.uid).with_context(|| format!("setuid({})", pw.uid.as_raw()))?;

    exec_tar(&args.files)
}

/// `/proc/<pid>/ns/mnt` and `/proc/<pid>/ns/user` are bind-mount-like magic
/// symlinks, not directories; opening them with `O_DIRECTORY` would fail.
fn open_ro_dir_or_file(path: &str) -> Result<OwnedFd> {
    let raw = open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("opening {path}"))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Recursively creates `dest` (every path component) with mode 0755. A
/// component that already exists keeps its prior ownership; a freshly
/// created one (intermediate or final) is chowned `(uid, gid)` — unlike the
/// newer `nstar.c`, which hardcodes `(uid, uid)` for the final component
/// only (see DESIGN.md).
fn mkdir_p_as(dest: &Path, uid: Uid, gid: Gid) -> Result<()> {
    let mut current = PathBuf::new();
    for component in dest.components() {
        current.push(component);
        if current.as_os_str() == "/" {
            continue;
        }
        mkdir_as(&current, uid, gid)?;
    }
    Ok(())
}

fn mkdir_as(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    match nix::unistd::mkdir(path, Mode::from_bits_truncate(0o755)) {
        Ok(()) => {
            nix::unistd::chown(path, Some(uid), Some(gid)).with_context(|| {
                format!("chown {path:?} to {}:{}", uid.as_raw(), gid.as_raw())
            })?;
            Ok(())
        }
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("mkdir {path:?}")),
    }
}

/// `tar cf - <files...>` when asked to create an archive from the current
/// directory, `tar xf -` to extract one into it otherwise. Handed off via
/// `execv`, matching the original's "pass through to the host's tar" design
/// — the container image may not carry `tar` itself.
fn exec_tar(files: &[String]) -> Result<()> {
    let tar_path = CString::new("/bin/tar").unwrap();
    let mut argv = vec![CString::new("tar").unwrap()];
    if files.is_empty() {
        argv.push(CString::new("xf").unwrap());
        argv.push(CString::new("-").unwrap());
    } else {
        argv.push(CString::new("cf").unwrap());
        argv.push(CString::new("-").unwrap());
        for f in files {
            argv.push(CString::new(f.as_str()).with_context(|| format!("file name {f:?} contains NUL"))?);
        }
    }

    nix::unistd::execv(&tar_path, &argv).context("execv /bin/tar")?;
    unreachable!("execv does not return on success");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    #[test]
    fn mkdir_p_as_creates_intermediate_and_final_with_requested_owner() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/c");
        let uid = Uid::from_raw(nix::unistd::getuid().as_raw());
        let gid = Gid::from_raw(nix::unistd::getgid().as_raw());

        mkdir_p_as(&dest, uid, gid).unwrap();

        assert!(dest.is_dir());
        for p in [dir.path().join("a"), dir.path().join("a/b"), dest.clone()] {
            let meta = std::fs::metadata(&p).unwrap();
            assert_eq!(meta.uid(), uid.as_raw());
            assert_eq!(meta.gid(), gid.as_raw());
            assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        }
    }

    #[test]
    fn mkdir_p_as_leaves_preexisting_component_ownership_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("preexisting");
        std::fs::create_dir(&existing).unwrap();
        std::fs::set_permissions(&existing, std::fs::Permissions::from_mode(0o700)).unwrap();

        let uid = Uid::from_raw(nix::unistd::getuid().as_raw());
        let gid = Gid::from_raw(nix::unistd::getgid().as_raw());
        mkdir_p_as(&existing.join("inner"), uid, gid).unwrap();

        let meta = std::fs::metadata(&existing).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn mkdir_p_as_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x/y");
        let uid = Uid::from_raw(nix::unistd::getuid().as_raw());
        let gid = Gid::from_raw(nix::unistd::getgid().as_raw());

        mkdir_p_as(&dest, uid, gid).unwrap();
        mkdir_p_as(&dest, uid, gid).unwrap();
        assert!(dest.is_dir());
    }
}
