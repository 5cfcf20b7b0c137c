use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;

use libc::{c_char, c_int, mode_t};

use crate::errno::ErrnoGuard;
use crate::real::real;
use crate::state;

/// Debug trace of intercepted calls, gated on the `CFS_DEBUG` level (0–2).
macro_rules! shim_debug {
    ($level:expr, $($arg:tt)*) => {
        if $level <= $crate::state::debug_level() {
            $crate::log::write_line(::std::format_args!($($arg)*));
        }
    };
}

pub(crate) use shim_debug;

/// Append one `PID <pid>: <message>` line to the debug log, serialized with
/// the other traced processes through the buffer's log-file lock (best
/// effort: an unattached process writes unlocked rather than not at all).
pub(crate) fn write_line(args: fmt::Arguments<'_>) {
    let _errno = ErrnoGuard::new();
    let line = format!("PID {}: {}\n", std::process::id(), args);
    let _lock = state::shim().and_then(|s| s.buffer.lock_logfile().ok());

    // opened with the real open64: routing this through our own shim would
    // trace the log file and recurse straight back here
    unsafe {
        let open64 = real!(fn open64(*const c_char, c_int, mode_t) -> c_int);
        let fd = open64(
            state::log_file().as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            0o644,
        );
        if fd != -1 {
            let _ = libc::write(fd, line.as_ptr().cast(), line.len());
            libc::close(fd);
        }
    }
}

/// Render a C string argument for the debug log.
pub(crate) fn cstr_arg<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("(null)")
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
    }
}
