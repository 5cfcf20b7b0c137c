//! The capture driver.
//!
//! Creates the shared trace buffer, launches the traced command with the
//! tracer library preloaded, and drains the buffer into a compressed trace
//! file until the command exits.

use std::env;
use std::ffi::{CString, OsString};
use std::fs::File;
use std::io::Write;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use clap::Parser;
use flate2::write::GzEncoder;
use flate2::Compression;
use nix::sys::wait::waitpid;
use nix::unistd::{execvp, fork, ForkResult};
use tracebuf::{DrainStatus, TraceBuffer};
use tracing::{debug, error, info, Level};

mod scan;

/// Run a command under the capture tracer: every file and directory access
/// made by the command and all of its descendants lands in a compressed
/// trace file for the build analyzer.
#[derive(Parser, Debug)]
#[command(name = "capfs")]
struct Opts {
    /// Trace output file
    #[arg(short = 'o', value_name = "FILE", default_value = "cfs.trace")]
    trace_file: PathBuf,

    /// Debug log file, shared by all traced processes
    #[arg(short = 'l', value_name = "FILE", default_value = "cfs.log")]
    log_file: PathBuf,

    /// Debug verbosity
    #[arg(short = 'd', value_name = "LEVEL", default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=2))]
    debug: u8,

    /// Register the pre-existing source tree before the command runs
    #[arg(short = 'r')]
    register_sources: bool,

    /// Command to trace (your login shell when omitted)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn main() {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_max_level(match opts.debug {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .init();

    if let Err(err) = run(opts) {
        error!("{err:#}");
        process::exit(-1);
    }
}

fn run(opts: Opts) -> anyhow::Result<()> {
    // a traced process starting another driver would corrupt the outer trace
    if env::var_os("CFS_ID").is_some() {
        bail!("already running under a capture session (CFS_ID is set)");
    }
    let home = env::var_os("CAPFS_HOME")
        .context("CAPFS_HOME is not set; it locates the tracer library")?;
    let shim = Path::new(&home).join("lib").join("libcapfs_shim.so");

    let command = command_line(&opts)?;

    let trace = File::create(&opts.trace_file).with_context(|| {
        format!("unable to create trace file {}", opts.trace_file.display())
    })?;
    let mut trace = GzEncoder::new(trace, Compression::default());
    tracefmt::write_header(&mut trace).context("writing the trace header")?;

    // surface an unwritable log here, once, rather than from every traced
    // process
    File::create(&opts.log_file).with_context(|| {
        format!("unable to create log file {}", opts.log_file.display())
    })?;

    env::set_var("LD_PRELOAD", &shim);

    let buffer = TraceBuffer::create().context("couldn't create the trace buffer")?;

    match unsafe { fork() }.context("couldn't fork the traced command")? {
        ForkResult::Child => run_child(&buffer, &opts, &command),
        ForkResult::Parent { child } => {
            drain(&buffer, &mut trace)?;
            trace.finish().context("couldn't finish the trace file")?;
            let _ = waitpid(child, None);
            Ok(())
        }
    }
}

fn command_line(opts: &Opts) -> anyhow::Result<Vec<CString>> {
    let raw: Vec<OsString> = if opts.command.is_empty() {
        let shell =
            env::var_os("SHELL").context("no command given and SHELL is not set")?;
        info!("starting an interactive shell under the tracer");
        vec![shell]
    } else {
        opts.command.clone()
    };
    raw.into_iter()
        .map(|arg| CString::new(arg.into_vec()).context("command argument contains a NUL"))
        .collect()
}

/// The traced side of the fork. Scans the source tree if requested, exports
/// the tracing environment and becomes the user's command.
fn run_child(buffer: &TraceBuffer, opts: &Opts, command: &[CString]) -> ! {
    if opts.register_sources {
        let result = env::current_dir()
            .context("couldn't determine the working directory")
            .and_then(|cwd| scan::register_source_tree(buffer, &cwd));
        if let Err(err) = result {
            eprintln!("capfs: source scan failed: {err:#}");
            process::exit(-1);
        }
    }

    env::set_var("CFS_ID", buffer.id().to_string());
    if opts.debug != 0 {
        env::set_var("CFS_DEBUG", opts.debug.to_string());
    }
    env::set_var("CFS_LOG_FILE", &opts.log_file);

    let err = execvp(&command[0], command).unwrap_err();
    eprintln!(
        "capfs: couldn't execute {}: {err}",
        command[0].to_string_lossy()
    );
    process::exit(-1);
}

/// Consumer loop: park until a producer reports the buffer full (or the
/// child exits), append the payload to the trace, hand the space back. On
/// EOF the buffer is drained one final time for whatever the last producers
/// left behind.
fn drain(buffer: &TraceBuffer, out: &mut impl Write) -> anyhow::Result<()> {
    loop {
        let status = buffer.wait_until_full().context("waiting for trace data")?;

        let payload = buffer.fetch();
        if !payload.is_empty() {
            out.write_all(payload).context("writing trace data")?;
            debug!(bytes = payload.len(), "drained trace buffer");
        }
        buffer.empty_content();
        buffer.mark_full(false).context("releasing producers")?;

        if status == DrainStatus::Eof {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::read::GzDecoder;
    use serial_test::serial;
    use tracefmt::{Event, EventKind};

    #[test]
    fn cli_accepts_the_documented_shapes() {
        let opts = Opts::parse_from(["capfs", "-o", "t.trace", "-d", "2", "-r", "make", "-j8"]);
        assert_eq!(opts.trace_file, PathBuf::from("t.trace"));
        assert_eq!(opts.log_file, PathBuf::from("cfs.log"));
        assert_eq!(opts.debug, 2);
        assert!(opts.register_sources);
        assert_eq!(
            opts.command,
            vec![OsString::from("make"), OsString::from("-j8")]
        );

        assert!(Opts::try_parse_from(["capfs", "-d", "3"]).is_err());
    }

    #[test]
    #[serial]
    fn drain_collects_child_events_until_eof() {
        let buffer = TraceBuffer::create_with_size(1 << 16).unwrap();
        let mut out = GzEncoder::new(Vec::new(), Compression::default());
        tracefmt::write_header(&mut out).unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                {
                    let mut guard = buffer.lock().unwrap();
                    guard
                        .write_event(&Event::Path {
                            kind: EventKind::FileRead,
                            process: 1,
                            path: CString::new("/tmp/in.txt").unwrap(),
                        })
                        .unwrap();
                }
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                drain(&buffer, &mut out).unwrap();
                let _ = waitpid(child, None);

                let bytes = out.finish().unwrap();
                let events = tracefmt::read_trace(GzDecoder::new(&bytes[..])).unwrap();
                assert_eq!(
                    events,
                    vec![Event::Path {
                        kind: EventKind::FileRead,
                        process: 1,
                        path: CString::new("/tmp/in.txt").unwrap(),
                    }]
                );
            }
        }
    }
}
