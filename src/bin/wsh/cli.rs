//! Hand-rolled option parsing for `wsh`.
//!
//! Grounded on `wsh.c::wsh__getopt`: a flag loop that stops at the first
//! non-dash argument (the start of the remote `argv`), plus a nested `--rsh`
//! sub-grammar that consumes and discards `rsh(1)`-compatible flags. Kept as
//! a hand-rolled parser (not `clap`) because that sub-grammar — a variable
//! number of leading dashed tokens, one of which (`-l`) takes a value, then a
//! mandatory trailing host token to skip — doesn't map onto `clap`'s
//! declarative model. The original's duplicate `--dir` arm (two identical
//! `else if` branches, the second unreachable) is collapsed to one.

use anyhow::{bail, Result};

#[derive(Debug, Default)]
pub struct WshArgs {
    pub socket_path: String,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub dir: Option<String>,
    pub bind_mount_source: Option<String>,
    pub bind_mount_destination: Option<String>,
    pub argv: Vec<String>,
}

pub fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} OPTION...\n\n\
         \x20 --socket PATH   Path to socket\n\
         \x20 --user USER     User to change to\n\
         \x20 --env KEY=VALUE Environment variables to set for the command. \
           You can specify multiple --env arguments\n\
         \x20 --dir PATH      Working directory for the running process\n\
         \x20 --rsh           RSH compatibility mode\n\
         \x20 --bind-mount-source PATH      Source directory to bind-mount in to the container\n\
         \x20 --bind-mount-destination PATH Destination directory to bind-mount in to the container\n\
         \x20 -- argv...      Command (and arguments) to run in the container\n"
    )
}

/// Parses `args` (excluding argv[0]). Returns `Ok(None)` for `-h`/`--help`
/// (caller should print usage and exit 0); `Err` for a malformed option list
/// (caller should print usage and exit 1).
pub fn parse(args: &[String]) -> Result<Option<WshArgs>> {
    let mut w = WshArgs::default();
    let mut i = 0;

    while i < args.len() {
        let arg = args[i].as_str();
        if !arg.starts_with('-') {
            break;
        }

        match arg {
            "-h" | "--help" => return Ok(None),
            "--socket" => {
                w.socket_path = take_value(args, &mut i, arg)?;
            }
            "--user" => {
                w.user = Some(take_value(args, &mut i, arg)?);
            }
            "--dir" => {
                w.dir = Some(take_value(args, &mut i, arg)?);
            }
            "--bind-mount-source" => {
                w.bind_mount_source = Some(take_value(args, &mut i, arg)?);
            }
            "--bind-mount-destination" => {
                w.bind_mount_destination = Some(take_value(args, &mut i, arg)?);
            }
            "--env" => {
                w.env.push(take_value(args, &mut i, arg)?);
            }
            "--rsh" => {
                i += 1;
                parse_rsh(args, &mut i, &mut w)?;
            }
            "--" => {
                i += 1;
                break;
            }
            other => bail!("invalid option -- {other}"),
        }
    }

    w.argv = args[i..].to_vec();
    Ok(Some(w))
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    let value = args
        .get(*i + 1)
        .ok_or_else(|| anyhow::anyhow!("{flag} requires an argument"))?
        .clone();
    *i += 2;
    Ok(value)
}

/// `rsh [-46dn] [-l username] [-t timeout] host [command]`. `-4 -6 -d -n`
/// and `-t <timeout>` are accepted and ignored; `-l <user>` sets the user;
/// the mandatory host token that follows is skipped.
fn parse_rsh(args: &[String], i: &mut usize, w: &mut WshArgs) -> Result<()> {
    while *i < args.len() {
        let arg = args[*i].as_str();
        if !arg.starts_with('-') {
            break;
        }

        let bytes = arg.as_bytes();
        if bytes.len() == 2 && matches!(bytes[1], b'4' | b'6' | b'd' | b'n') {
            *i += 1;
        } else if bytes.len() == 2 && bytes[1] == b'l' {
            w.user = Some(take_value(args, i, arg)?);
        } else if bytes.len() == 2 && bytes[1] == b't' {
            let _ = take_value(args, i, arg)?;
        } else {
            bail!("invalid option -- {arg}");
        }
    }

    if *i >= args.len() {
        bail!("--rsh expects a host argument");
    }
    *i += 1; // skip over host
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_basic_flags_and_trailing_argv() {
        let args = v(&["--socket", "/r/wshd.sock", "--user", "vcap", "--", "/bin/sh", "-c", "echo hi"]);
        let w = parse(&args).unwrap().unwrap();
        assert_eq!(w.socket_path, "/r/wshd.sock");
        assert_eq!(w.user.as_deref(), Some("vcap"));
        assert_eq!(w.argv, v(&["/bin/sh", "-c", "echo hi"]));
    }

    #[test]
    fn collects_multiple_env_flags() {
        let args = v(&["--env", "A=1", "--env", "B=2", "--", "true"]);
        let w = parse(&args).unwrap().unwrap();
        assert_eq!(w.env, v(&["A=1", "B=2"]));
    }

    #[test]
    fn help_returns_none() {
        assert!(parse(&v(&["--help"])).unwrap().is_none());
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(parse(&v(&["--bogus"])).is_err());
    }

    #[test]
    fn rsh_mode_sets_user_and_skips_host_and_command() {
        let args = v(&["--rsh", "-l", "vcap", "-t", "30", "remotehost", "echo", "hi"]);
        let w = parse(&args).unwrap().unwrap();
        assert_eq!(w.user.as_deref(), Some("vcap"));
        assert_eq!(w.argv, v(&["echo", "hi"]));
    }

    #[test]
    fn rsh_mode_ignores_bare_connection_flags() {
        let args = v(&["--rsh", "-4", "-n", "remotehost"]);
        let w = parse(&args).unwrap().unwrap();
        assert!(w.argv.is_empty());
    }

    #[test]
    fn bind_mount_flags_are_captured() {
        let args = v(&["--bind-mount-source", "/host/x", "--bind-mount-destination", "/c/x"]);
        let w = parse(&args).unwrap().unwrap();
        assert_eq!(w.bind_mount_source.as_deref(), Some("/host/x"));
        assert_eq!(w.bind_mount_destination.as_deref(), Some("/c/x"));
    }

    #[test]
    fn dash_dash_argv_can_itself_start_with_a_dash() {
        let args = v(&["--user", "vcap", "--", "-v"]);
        let w = parse(&args).unwrap().unwrap();
        assert_eq!(w.argv, v(&["-v"]));
    }
}
