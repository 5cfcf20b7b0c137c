//! Once-per-image startup. Runs as a library constructor, before `main` of
//! the traced program.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Mutex;

use anyhow::Context;
use tracebuf::TraceBuffer;
use tracefmt::Event;

use crate::log::shim_debug;
use crate::state;

#[cfg(not(test))]
#[ctor::ctor]
fn capfs_init() {
    if let Err(err) = init() {
        // a half-initialised tracer would silently drop events; refuse to run
        eprintln!("capfs: fatal: {err:#}");
        std::process::exit(1);
    }
}

fn init() -> anyhow::Result<()> {
    // no CFS_ID means this process is not part of a monitored build; the
    // shims stay in pass-through mode
    let Some(id_var) = std::env::var_os("CFS_ID") else {
        return Ok(());
    };

    if let Ok(level) = std::env::var("CFS_DEBUG") {
        state::set_debug_level(level.parse().unwrap_or(0));
    }
    if let Some(path) = std::env::var_os("CFS_LOG_FILE") {
        if let Ok(path) = CString::new(path.into_vec()) {
            state::set_log_file(path);
        }
    }

    let cwd = nix::unistd::getcwd().context("couldn't determine the working directory")?;
    let exe = fs::read_link("/proc/self/exe")
        .context("couldn't resolve the running executable")?;
    let cmdline =
        fs::read("/proc/self/cmdline").context("couldn't read the command line")?;
    let args = rebuild_argv(exe.as_os_str().as_bytes(), cmdline);
    let env = split_env(fs::read("/proc/self/environ").context("couldn't read the environment")?);

    let id: i32 = id_var
        .to_str()
        .and_then(|s| s.parse().ok())
        .context("CFS_ID is not a number")?;
    let buffer = TraceBuffer::attach(id).context("couldn't attach to the trace buffer")?;

    let parent = std::env::var("CFS_PARENT_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let ld_preload = std::env::var_os("LD_PRELOAD")
        .context("LD_PRELOAD disappeared from the environment")?;
    let mut preload = b"LD_PRELOAD=".to_vec();
    preload.extend_from_slice(ld_preload.as_bytes());
    let ld_preload = CString::new(preload).context("LD_PRELOAD contains a NUL")?;

    let cwd_c = CString::new(cwd.as_os_str().as_bytes().to_vec())
        .context("working directory contains a NUL")?;

    let process_number = {
        let mut guard = buffer
            .lock()
            .context("couldn't lock the trace buffer")?;
        let number = guard.next_process_number();
        guard
            .write_event(&Event::NewProgram {
                process: number,
                parent,
                cwd: cwd_c,
                args,
                env,
            })
            .context("couldn't announce the new program")?;
        number
    };

    state::install(state::Shim {
        buffer,
        process_number,
        parent_number: parent,
        cwd: Mutex::new(cwd),
        ld_preload,
    });
    shim_debug!(1, "tracing as process {process_number} (parent {parent})");
    Ok(())
}

/// Turn the raw `/proc/self/cmdline` bytes into one `CString` per argument,
/// with the first argument replaced by the absolute executable path (argv[0]
/// as handed to exec is usually a bare or relative command name).
///
/// The kernel usually NUL-terminates the final argument but is not required
/// to; normalize so there is exactly one terminator per argument.
fn rebuild_argv(exe: &[u8], mut raw: Vec<u8>) -> Vec<CString> {
    let exe = CString::new(exe.to_vec()).unwrap_or_default();
    if raw.is_empty() {
        return vec![exe];
    }
    if raw.last() != Some(&0) {
        raw.push(0);
    }
    let mut args: Vec<CString> = raw[..raw.len() - 1]
        .split(|&b| b == 0)
        .map(|arg| CString::new(arg.to_vec()).expect("split on NUL"))
        .collect();
    if args.is_empty() {
        args.push(exe);
    } else {
        args[0] = exe;
    }
    args
}

/// Split the raw `/proc/self/environ` bytes into entries. Empty entries are
/// dropped: an empty string is the trace format's end-of-environment marker.
fn split_env(mut raw: Vec<u8>) -> Vec<CString> {
    if raw.is_empty() {
        return Vec::new();
    }
    if raw.last() != Some(&0) {
        raw.push(0);
    }
    raw[..raw.len() - 1]
        .split(|&b| b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| CString::new(entry.to_vec()).expect("split on NUL"))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn strings(args: &[CString]) -> Vec<&str> {
        args.iter().map(|a| a.to_str().unwrap()).collect()
    }

    #[test]
    fn argv0_becomes_the_absolute_executable() {
        let args = rebuild_argv(b"/usr/bin/cc", b"cc\0-c\0main.c\0".to_vec());
        assert_eq!(strings(&args), ["/usr/bin/cc", "-c", "main.c"]);
    }

    #[test]
    fn missing_trailing_nul_is_tolerated() {
        let args = rebuild_argv(b"/bin/echo", b"echo\0hi".to_vec());
        assert_eq!(strings(&args), ["/bin/echo", "hi"]);
    }

    #[test]
    fn empty_arguments_survive() {
        let args = rebuild_argv(b"/bin/x", b"x\0\0last\0".to_vec());
        assert_eq!(strings(&args), ["/bin/x", "", "last"]);
    }

    #[test]
    fn empty_cmdline_falls_back_to_the_executable() {
        let args = rebuild_argv(b"/bin/x", Vec::new());
        assert_eq!(strings(&args), ["/bin/x"]);
    }

    #[test]
    fn environ_splits_and_drops_empties() {
        let env = split_env(b"A=1\0B=two\0\0C=3\0".to_vec());
        assert_eq!(strings(&env), ["A=1", "B=two", "C=3"]);
        assert!(split_env(Vec::new()).is_empty());
        assert_eq!(strings(&split_env(b"A=1".to_vec())), ["A=1"]);
    }
}
