//! Metadata changes, directory creation, links, renames and deletions.

use libc::{c_char, c_int, gid_t, key_t, mode_t, off_t, uid_t};

use tracefmt::Access;

use crate::events;
use crate::log::{cstr_arg, shim_debug};
use crate::paths;
use crate::real::real;

#[no_mangle]
pub unsafe extern "C" fn chmod(path: *const c_char, mode: mode_t) -> c_int {
    let real_chmod = real!(fn chmod(*const c_char, mode_t) -> c_int);
    shim_debug!(1, "chmod(\"{}\", 0o{:o})", cstr_arg(path), mode);

    let rc = real_chmod(path, mode);
    if rc != -1 {
        events::open_common(paths::cstr(path), Access::Modify);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn fchmod(fd: c_int, mode: mode_t) -> c_int {
    let real_fchmod = real!(fn fchmod(c_int, mode_t) -> c_int);
    shim_debug!(1, "fchmod({}, 0o{:o})", fd, mode);

    let rc = real_fchmod(fd, mode);
    if rc != -1 {
        // no pathname for pipes and sockets; the event is simply skipped
        if let Some(path) = paths::fd_path(fd) {
            events::open_path(&path, Access::Modify);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn fchmodat(
    dirfd: c_int,
    path: *const c_char,
    mode: mode_t,
    flags: c_int,
) -> c_int {
    let real_fchmodat = real!(fn fchmodat(c_int, *const c_char, mode_t, c_int) -> c_int);
    shim_debug!(
        1,
        "fchmodat({}, \"{}\", 0o{:o}, {})",
        dirfd,
        cstr_arg(path),
        mode,
        flags
    );

    let rc = real_fchmodat(dirfd, path, mode, flags);
    if rc != -1 {
        if let Some(resolved) = paths::cstr(path).and_then(|p| paths::at_path(dirfd, p)) {
            events::open_path(&resolved, Access::Modify);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn chown(path: *const c_char, owner: uid_t, group: gid_t) -> c_int {
    let real_chown = real!(fn chown(*const c_char, uid_t, gid_t) -> c_int);
    shim_debug!(1, "chown(\"{}\", {}, {})", cstr_arg(path), owner, group);

    let rc = real_chown(path, owner, group);
    if rc != -1 {
        events::open_common(paths::cstr(path), Access::Modify);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn fchown(fd: c_int, owner: uid_t, group: gid_t) -> c_int {
    let real_fchown = real!(fn fchown(c_int, uid_t, gid_t) -> c_int);
    shim_debug!(1, "fchown({}, {}, {})", fd, owner, group);

    let rc = real_fchown(fd, owner, group);
    if rc != -1 {
        if let Some(path) = paths::fd_path(fd) {
            events::open_path(&path, Access::Modify);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn fchownat(
    dirfd: c_int,
    path: *const c_char,
    owner: uid_t,
    group: gid_t,
    flags: c_int,
) -> c_int {
    let real_fchownat = real!(fn fchownat(c_int, *const c_char, uid_t, gid_t, c_int) -> c_int);
    shim_debug!(
        1,
        "fchownat({}, \"{}\", {}, {}, {})",
        dirfd,
        cstr_arg(path),
        owner,
        group,
        flags
    );

    let rc = real_fchownat(dirfd, path, owner, group, flags);
    if rc != -1 {
        if let Some(resolved) = paths::cstr(path).and_then(|p| paths::at_path(dirfd, p)) {
            events::open_path(&resolved, Access::Modify);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn lchown(path: *const c_char, owner: uid_t, group: gid_t) -> c_int {
    let real_lchown = real!(fn lchown(*const c_char, uid_t, gid_t) -> c_int);
    shim_debug!(1, "lchown(\"{}\", {}, {})", cstr_arg(path), owner, group);
    real_lchown(path, owner, group)
}

#[no_mangle]
pub unsafe extern "C" fn truncate(path: *const c_char, length: off_t) -> c_int {
    let real_truncate = real!(fn truncate(*const c_char, off_t) -> c_int);
    shim_debug!(1, "truncate(\"{}\", {})", cstr_arg(path), length);

    let rc = real_truncate(path, length);
    if rc != -1 {
        events::open_common(paths::cstr(path), Access::Modify);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn truncate64(path: *const c_char, length: libc::off64_t) -> c_int {
    // the 64-bit offset is spelled out in the resolved signature; a
    // loosely-typed lookup would mangle it on 32-bit targets
    let real_truncate64 = real!(fn truncate64(*const c_char, libc::off64_t) -> c_int);
    shim_debug!(1, "truncate64(\"{}\", {})", cstr_arg(path), length);

    let rc = real_truncate64(path, length);
    if rc != -1 {
        events::open_common(paths::cstr(path), Access::Modify);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn mkdir(path: *const c_char, mode: mode_t) -> c_int {
    let real_mkdir = real!(fn mkdir(*const c_char, mode_t) -> c_int);
    shim_debug!(1, "mkdir(\"{}\", 0o{:o})", cstr_arg(path), mode);

    let rc = real_mkdir(path, mode);
    if rc != -1 {
        // the path is a directory by now, so this lands as a DIR_WRITE
        events::open_common(paths::cstr(path), Access::Write);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn mkdirat(dirfd: c_int, path: *const c_char, mode: mode_t) -> c_int {
    let real_mkdirat = real!(fn mkdirat(c_int, *const c_char, mode_t) -> c_int);
    shim_debug!(1, "mkdirat({}, \"{}\", 0o{:o})", dirfd, cstr_arg(path), mode);

    let rc = real_mkdirat(dirfd, path, mode);
    if rc != -1 {
        if let Some(resolved) = paths::cstr(path).and_then(|p| paths::at_path(dirfd, p)) {
            events::open_path(&resolved, Access::Write);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn link(oldpath: *const c_char, newpath: *const c_char) -> c_int {
    let real_link = real!(fn link(*const c_char, *const c_char) -> c_int);
    shim_debug!(1, "link(\"{}\", \"{}\")", cstr_arg(oldpath), cstr_arg(newpath));

    let rc = real_link(oldpath, newpath);
    if rc != -1 {
        if let (Some(old), Some(new)) = (paths::cstr(oldpath), paths::cstr(newpath)) {
            events::link_path(paths::as_path(old), paths::as_path(new));
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn linkat(
    olddirfd: c_int,
    oldpath: *const c_char,
    newdirfd: c_int,
    newpath: *const c_char,
    flags: c_int,
) -> c_int {
    let real_linkat = real!(fn linkat(c_int, *const c_char, c_int, *const c_char, c_int) -> c_int);
    shim_debug!(
        1,
        "linkat({}, \"{}\", {}, \"{}\", {})",
        olddirfd,
        cstr_arg(oldpath),
        newdirfd,
        cstr_arg(newpath),
        flags
    );

    let rc = real_linkat(olddirfd, oldpath, newdirfd, newpath, flags);
    if rc != -1 {
        let old = paths::cstr(oldpath).and_then(|p| paths::at_path(olddirfd, p));
        let new = paths::cstr(newpath).and_then(|p| paths::at_path(newdirfd, p));
        if let (Some(old), Some(new)) = (old, new) {
            events::link_path(&old, &new);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn symlink(target: *const c_char, linkpath: *const c_char) -> c_int {
    let real_symlink = real!(fn symlink(*const c_char, *const c_char) -> c_int);
    shim_debug!(
        1,
        "symlink(\"{}\", \"{}\")",
        cstr_arg(target),
        cstr_arg(linkpath)
    );

    // normalize the link name before it exists: once the symlink is in
    // place, canonicalization would follow it to the target instead
    let pre = paths::cstr(linkpath).and_then(|p| events::normalized(paths::as_path(p)));

    let rc = real_symlink(target, linkpath);
    if rc != -1 {
        events::open_common(paths::cstr(target), Access::Read);
        if let Some(link) = pre {
            events::open_prenormalized(&link, Access::Write);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn symlinkat(
    target: *const c_char,
    newdirfd: c_int,
    linkpath: *const c_char,
) -> c_int {
    let real_symlinkat = real!(fn symlinkat(*const c_char, c_int, *const c_char) -> c_int);
    shim_debug!(
        1,
        "symlinkat(\"{}\", {}, \"{}\")",
        cstr_arg(target),
        newdirfd,
        cstr_arg(linkpath)
    );

    let pre = paths::cstr(linkpath)
        .and_then(|p| paths::at_path(newdirfd, p))
        .and_then(|p| events::normalized(&p));

    let rc = real_symlinkat(target, newdirfd, linkpath);
    if rc != -1 {
        events::open_common(paths::cstr(target), Access::Read);
        if let Some(link) = pre {
            events::open_prenormalized(&link, Access::Write);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn unlink(path: *const c_char) -> c_int {
    let real_unlink = real!(fn unlink(*const c_char) -> c_int);
    shim_debug!(1, "unlink(\"{}\")", cstr_arg(path));

    let rc = real_unlink(path);
    if rc != -1 {
        if let Some(path) = paths::cstr(path) {
            events::delete_path(paths::as_path(path), false);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn unlinkat(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    let real_unlinkat = real!(fn unlinkat(c_int, *const c_char, c_int) -> c_int);
    shim_debug!(1, "unlinkat({}, \"{}\", {:#x})", dirfd, cstr_arg(path), flags);

    let rc = real_unlinkat(dirfd, path, flags);
    if rc != -1 {
        if let Some(resolved) = paths::cstr(path).and_then(|p| paths::at_path(dirfd, p)) {
            events::delete_path(&resolved, flags & libc::AT_REMOVEDIR != 0);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn rmdir(path: *const c_char) -> c_int {
    let real_rmdir = real!(fn rmdir(*const c_char) -> c_int);
    shim_debug!(1, "rmdir(\"{}\")", cstr_arg(path));

    let rc = real_rmdir(path);
    if rc != -1 {
        if let Some(path) = paths::cstr(path) {
            events::delete_path(paths::as_path(path), true);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn remove(path: *const c_char) -> c_int {
    let real_remove = real!(fn remove(*const c_char) -> c_int);
    shim_debug!(1, "remove(\"{}\")", cstr_arg(path));

    // sample directory-ness now; the target is about to disappear
    let is_dir = paths::cstr(path)
        .map(|p| pathnorm::is_directory(paths::as_path(p)))
        .unwrap_or(false);

    let rc = real_remove(path);
    if rc != -1 {
        if let Some(path) = paths::cstr(path) {
            events::delete_path(paths::as_path(path), is_dir);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn rename(oldpath: *const c_char, newpath: *const c_char) -> c_int {
    let real_rename = real!(fn rename(*const c_char, *const c_char) -> c_int);
    shim_debug!(
        1,
        "rename(\"{}\", \"{}\")",
        cstr_arg(oldpath),
        cstr_arg(newpath)
    );

    // sample directory-ness now; the old name is about to disappear
    let is_dir = paths::cstr(oldpath)
        .map(|p| pathnorm::is_directory(paths::as_path(p)))
        .unwrap_or(false);

    let rc = real_rename(oldpath, newpath);
    if rc != -1 {
        if let Some(old) = paths::cstr(oldpath) {
            events::delete_path(paths::as_path(old), is_dir);
        }
        // the new name could be a file or a directory; the create event
        // works that out from the path itself
        events::open_common(paths::cstr(newpath), Access::Write);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn renameat(
    olddirfd: c_int,
    oldpath: *const c_char,
    newdirfd: c_int,
    newpath: *const c_char,
) -> c_int {
    let real_renameat =
        real!(fn renameat(c_int, *const c_char, c_int, *const c_char) -> c_int);
    shim_debug!(
        1,
        "renameat({}, \"{}\", {}, \"{}\")",
        olddirfd,
        cstr_arg(oldpath),
        newdirfd,
        cstr_arg(newpath)
    );

    let old = paths::cstr(oldpath).and_then(|p| paths::at_path(olddirfd, p));
    let is_dir = old
        .as_deref()
        .map(pathnorm::is_directory)
        .unwrap_or(false);

    let rc = real_renameat(olddirfd, oldpath, newdirfd, newpath);
    if rc != -1 {
        if let Some(old) = old {
            events::delete_path(&old, is_dir);
        }
        if let Some(new) = paths::cstr(newpath).and_then(|p| paths::at_path(newdirfd, p)) {
            events::open_path(&new, Access::Write);
        }
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn ftok(path: *const c_char, proj_id: c_int) -> key_t {
    let real_ftok = real!(fn ftok(*const c_char, c_int) -> key_t);
    shim_debug!(1, "ftok(\"{}\", {})", cstr_arg(path), proj_id);

    let key = real_ftok(path, proj_id);
    if key != -1 {
        events::open_common(paths::cstr(path), Access::Read);
    }
    key
}
