//! Event emission. Every helper here is silent on failure: a broken
//! normalization, a missing buffer or a full semaphore must never change
//! what the interposed caller sees.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracefmt::{Access, Event, EventKind};

use crate::errno::ErrnoGuard;
use crate::paths;
use crate::state;

/// Canonicalize a (possibly relative) path against the cached cwd.
pub(crate) fn normalized(path: &Path) -> Option<PathBuf> {
    let cwd = state::cached_cwd()?;
    pathnorm::combine(Some(cwd.as_os_str()), Some(path.as_os_str())).ok()
}

fn to_cstring(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes().to_vec()).ok()
}

fn emit(event: Event) {
    let Some(shim) = state::shim() else { return };
    if let Ok(mut guard) = shim.buffer.lock() {
        let _ = guard.write_event(&event);
    }
}

fn process_number() -> u32 {
    state::shim().map(|s| s.process_number).unwrap_or(0)
}

/// Record an open-style touch of a path that still needs normalizing.
pub(crate) fn open_path(path: &Path, access: Access) {
    let _errno = ErrnoGuard::new();
    let Some(normalized) = normalized(path) else { return };
    emit_access(&normalized, access);
}

pub(crate) fn open_common(path: Option<&CStr>, access: Access) {
    let Some(path) = path else { return };
    open_path(paths::as_path(path), access);
}

/// Record a touch of a path that is already canonical. Used for symlink
/// names, which were normalized before creation: canonicalizing afterwards
/// would follow the fresh link to its target.
pub(crate) fn open_prenormalized(path: &Path, access: Access) {
    let _errno = ErrnoGuard::new();
    emit_access(path, access);
}

fn emit_access(path: &Path, access: Access) {
    if pathnorm::is_system_path(path) {
        return;
    }
    let is_dir = pathnorm::is_directory(path);
    let Some(cpath) = to_cstring(path) else { return };
    emit(Event::Path {
        kind: access.kind(is_dir),
        process: process_number(),
        path: cpath,
    });
}

pub(crate) fn fopen_common(path: Option<&CStr>, mode: Option<&CStr>) {
    let access = mode
        .map(|m| Access::from_fopen_mode(m.to_bytes()))
        .unwrap_or(Access::Write);
    open_common(path, access);
}

/// Record a deletion. `is_dir` was sampled before the real call removed the
/// target; normalization tolerates the now-missing leaf.
pub(crate) fn delete_path(path: &Path, is_dir: bool) {
    let _errno = ErrnoGuard::new();
    let Some(normalized) = normalized(path) else { return };
    if pathnorm::is_system_path(&normalized) {
        return;
    }
    let Some(cpath) = to_cstring(&normalized) else { return };
    emit(Event::Path {
        kind: if is_dir {
            EventKind::DirDelete
        } else {
            EventKind::FileDelete
        },
        process: process_number(),
        path: cpath,
    });
}

/// Record a hard link: the source was read, and a new name for it exists.
/// Two records, each atomic on its own.
pub(crate) fn link_path(source: &Path, link: &Path) {
    let _errno = ErrnoGuard::new();
    let Some(source) = normalized(source) else { return };
    let Some(link) = normalized(link) else { return };

    emit_access(&source, Access::Read);

    if pathnorm::is_system_path(&source) || pathnorm::is_system_path(&link) {
        return;
    }
    let (Some(first), Some(second)) = (to_cstring(&source), to_cstring(&link)) else {
        return;
    };
    emit(Event::TwoPath {
        kind: EventKind::FileNewLink,
        process: process_number(),
        first,
        second,
    });
}
