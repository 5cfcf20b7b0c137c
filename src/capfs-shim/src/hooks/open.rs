//! The open family: `open`/`openat`/`creat` and the stdio wrappers.

use libc::{c_char, c_int, mode_t, FILE};

use tracefmt::Access;

use crate::events;
use crate::log::{cstr_arg, shim_debug};
use crate::paths;
use crate::real::real;

// The trailing `mode` argument is variadic at the C level. Receiving it as a
// plain third argument forwards whatever the caller put in the argument
// registers, junk or not, which is exactly what the real variadic
// implementations do with an absent mode.

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real_open = real!(fn open(*const c_char, c_int, mode_t) -> c_int);
    shim_debug!(1, "open(\"{}\", {:#x}, 0o{:o})", cstr_arg(path), flags, mode);

    let fd = real_open(path, flags, mode);
    if fd != -1 {
        events::open_common(paths::cstr(path), Access::from_open_flags(flags));
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real_open64 = real!(fn open64(*const c_char, c_int, mode_t) -> c_int);
    shim_debug!(1, "open64(\"{}\", {:#x}, 0o{:o})", cstr_arg(path), flags, mode);

    let fd = real_open64(path, flags, mode);
    if fd != -1 {
        events::open_common(paths::cstr(path), Access::from_open_flags(flags));
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    let real_openat = real!(fn openat(c_int, *const c_char, c_int, mode_t) -> c_int);
    shim_debug!(
        1,
        "openat({}, \"{}\", {:#x}, 0o{:o})",
        dirfd,
        cstr_arg(path),
        flags,
        mode
    );

    let fd = real_openat(dirfd, path, flags, mode);
    if fd != -1 {
        if let Some(resolved) = paths::cstr(path).and_then(|p| paths::at_path(dirfd, p)) {
            events::open_path(&resolved, Access::from_open_flags(flags));
        }
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    let real_openat64 = real!(fn openat64(c_int, *const c_char, c_int, mode_t) -> c_int);
    shim_debug!(
        1,
        "openat64({}, \"{}\", {:#x}, 0o{:o})",
        dirfd,
        cstr_arg(path),
        flags,
        mode
    );

    let fd = real_openat64(dirfd, path, flags, mode);
    if fd != -1 {
        if let Some(resolved) = paths::cstr(path).and_then(|p| paths::at_path(dirfd, p)) {
            events::open_path(&resolved, Access::from_open_flags(flags));
        }
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    let real_creat = real!(fn creat(*const c_char, mode_t) -> c_int);
    shim_debug!(1, "creat(\"{}\", 0o{:o})", cstr_arg(path), mode);

    let fd = real_creat(path, mode);
    if fd != -1 {
        // creat is open with O_CREAT|O_WRONLY|O_TRUNC: always a write
        events::open_common(paths::cstr(path), Access::Write);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn creat64(path: *const c_char, mode: mode_t) -> c_int {
    let real_creat64 = real!(fn creat64(*const c_char, mode_t) -> c_int);
    shim_debug!(1, "creat64(\"{}\", 0o{:o})", cstr_arg(path), mode);

    let fd = real_creat64(path, mode);
    if fd != -1 {
        events::open_common(paths::cstr(path), Access::Write);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    let real_fopen = real!(fn fopen(*const c_char, *const c_char) -> *mut FILE);
    shim_debug!(1, "fopen(\"{}\", \"{}\")", cstr_arg(path), cstr_arg(mode));

    let file = real_fopen(path, mode);
    if !file.is_null() {
        events::fopen_common(paths::cstr(path), paths::cstr(mode));
    }
    file
}

#[no_mangle]
pub unsafe extern "C" fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    let real_fopen64 = real!(fn fopen64(*const c_char, *const c_char) -> *mut FILE);
    shim_debug!(1, "fopen64(\"{}\", \"{}\")", cstr_arg(path), cstr_arg(mode));

    let file = real_fopen64(path, mode);
    if !file.is_null() {
        events::fopen_common(paths::cstr(path), paths::cstr(mode));
    }
    file
}

// freopen with a null path re-opens the stream's current file with a new
// mode; there is no pathname to report, so no event is emitted.

#[no_mangle]
pub unsafe extern "C" fn freopen(
    path: *const c_char,
    mode: *const c_char,
    stream: *mut FILE,
) -> *mut FILE {
    let real_freopen = real!(fn freopen(*const c_char, *const c_char, *mut FILE) -> *mut FILE);
    shim_debug!(1, "freopen(\"{}\", \"{}\")", cstr_arg(path), cstr_arg(mode));

    let file = real_freopen(path, mode, stream);
    if !file.is_null() && !path.is_null() {
        events::fopen_common(paths::cstr(path), paths::cstr(mode));
    }
    file
}

#[no_mangle]
pub unsafe extern "C" fn freopen64(
    path: *const c_char,
    mode: *const c_char,
    stream: *mut FILE,
) -> *mut FILE {
    let real_freopen64 = real!(fn freopen64(*const c_char, *const c_char, *mut FILE) -> *mut FILE);
    shim_debug!(1, "freopen64(\"{}\", \"{}\")", cstr_arg(path), cstr_arg(mode));

    let file = real_freopen64(path, mode, stream);
    if !file.is_null() && !path.is_null() {
        events::fopen_common(paths::cstr(path), paths::cstr(mode));
    }
    file
}
