use std::ffi::{CStr, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use libc::{c_char, c_int};

pub(crate) unsafe fn cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr))
    }
}

pub(crate) fn as_path(s: &CStr) -> &Path {
    Path::new(OsStr::from_bytes(s.to_bytes()))
}

/// Resolve a `(dirfd, path)` pair from the `…at` family into a plain path
/// (absolute, or relative to the cwd). Absolute paths and `AT_FDCWD` pass
/// through untouched; a real directory descriptor is looked up through
/// `/proc/self/fd`. `None` means the lookup failed and the event is skipped.
pub(crate) fn at_path(dirfd: c_int, path: &CStr) -> Option<PathBuf> {
    let bytes = path.to_bytes();
    if bytes.first() == Some(&b'/') || dirfd == libc::AT_FDCWD {
        return Some(PathBuf::from(OsString::from_vec(bytes.to_vec())));
    }
    let dir = fd_path(dirfd)?;
    let mut joined = dir.into_os_string().into_vec();
    joined.push(b'/');
    joined.extend_from_slice(bytes);
    Some(PathBuf::from(OsString::from_vec(joined)))
}

/// The filesystem name behind an open descriptor, via `/proc/self/fd`.
/// Descriptors that don't name the filesystem (`pipe:…`, `socket:…`) yield
/// `None`; their events are silently dropped.
pub(crate) fn fd_path(fd: c_int) -> Option<PathBuf> {
    let target = std::fs::read_link(format!("/proc/self/fd/{fd}")).ok()?;
    if !target.as_os_str().as_bytes().starts_with(b"/") {
        return None;
    }
    Some(target)
}
