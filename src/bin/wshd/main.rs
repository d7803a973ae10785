//! `wshd`: the container-init supervisor.
//!
//! Grounded on `wshd.c::main`, split into `parent` (Phase 0/1, host-side)
//! and `child` (Phase 2, container-side, both pre- and post-`--continue`
//! images).

mod acceptloop;
mod child;
mod parent;
mod spawn;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "wshd", about = "Container-init supervisor")]
struct Args {
    /// Directory containing the control socket (wshd.sock).
    #[arg(long)]
    run: Option<String>,

    /// Directory of lifecycle hook scripts.
    #[arg(long)]
    lib: Option<String>,

    /// Prepared container root filesystem.
    #[arg(long)]
    root: Option<String>,

    /// Process title to apply to the supervisor after re-exec.
    #[arg(long)]
    title: Option<String>,

    /// "1" to enable a user namespace, "disabled" (the default) to omit it.
    #[arg(long)]
    userns: Option<String>,

    /// Internal re-entry point; not for interactive use.
    #[arg(long = "continue", hide = true)]
    continue_: bool,

    /// The handover payload, present only alongside `--continue`.
    payload: Option<String>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    if args.continue_ {
        let payload = args
            .payload
            .context("--continue requires a handover payload")?;
        return child::continue_phase(&payload);
    }

    let run = args.run.context("--run is required")?;
    let lib = args.lib.context("--lib is required")?;
    let root = args.root.context("--root is required")?;
    let userns = match args.userns.as_deref() {
        Some("1") => true,
        Some("disabled") | None => false,
        Some(other) => bail!("invalid --userns value {other:?} (expected \"1\" or \"disabled\")"),
    };

    parent::run(&run, &lib, &root, args.title, userns)
}
