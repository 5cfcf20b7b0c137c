use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracebuf::TraceBuffer;

/// Process-wide tracer context, installed once by the constructor. Absent
/// entirely when the process is not running under the tracer.
pub(crate) struct Shim {
    pub buffer: TraceBuffer,
    pub process_number: u32,
    #[allow(dead_code)]
    pub parent_number: u32,
    /// Kept current by the chdir/fchdir shims so relative paths normalize
    /// without a getcwd round trip per event.
    pub cwd: Mutex<PathBuf>,
    /// The full `LD_PRELOAD=…` string this process started with, re-exported
    /// verbatim to every child image.
    pub ld_preload: CString,
}

static SHIM: OnceCell<Shim> = OnceCell::new();
static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(0);
static LOG_FILE: OnceCell<CString> = OnceCell::new();

pub(crate) fn shim() -> Option<&'static Shim> {
    SHIM.get()
}

pub(crate) fn install(shim: Shim) {
    let _ = SHIM.set(shim);
}

pub(crate) fn debug_level() -> i32 {
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

pub(crate) fn set_debug_level(level: i32) {
    DEBUG_LEVEL.store(level.clamp(0, 2), Ordering::Relaxed);
}

pub(crate) fn log_file() -> &'static CStr {
    LOG_FILE.get().map(CString::as_c_str).unwrap_or(c"cfs.log")
}

pub(crate) fn set_log_file(path: CString) {
    let _ = LOG_FILE.set(path);
}

/// Re-read the working directory after a successful chdir/fchdir. A process
/// whose cwd cannot be determined would attribute every relative path to the
/// wrong place, so that is fatal, exactly like a failed constructor.
pub(crate) fn refresh_cwd() {
    let Some(shim) = shim() else { return };
    match nix::unistd::getcwd() {
        Ok(cwd) => {
            *shim.cwd.lock().unwrap_or_else(|e| e.into_inner()) = cwd;
        }
        Err(err) => {
            eprintln!("capfs: fatal: couldn't determine the working directory: {err}");
            std::process::exit(1);
        }
    }
}

pub(crate) fn cached_cwd() -> Option<PathBuf> {
    shim().map(|s| s.cwd.lock().unwrap_or_else(|e| e.into_inner()).clone())
}
