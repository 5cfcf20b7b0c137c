//! Process lifecycle: cwd tracking, the exec/spawn family, and the
//! observed-but-untraced calls.
//!
//! No exec shim emits an event. The successor image announces itself from
//! the library constructor, which knows its real argv and environment; all
//! that matters here is that the five tracked variables survive into the
//! child.

use libc::{c_char, c_int, pid_t, FILE};

use crate::env;
use crate::log::{cstr_arg, shim_debug};
use crate::real::real;
use crate::state;

pub(crate) unsafe fn execve_common(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let real_execve =
        real!(fn execve(*const c_char, *const *const c_char, *const *const c_char) -> c_int);
    env::debug_env(envp);
    match env::propagated(envp) {
        None => real_execve(path, argv, envp),
        // the block frees our strings when the exec comes back failed
        Some(block) => real_execve(path, argv, block.as_ptr()),
    }
}

pub(crate) unsafe fn execvpe_common(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let real_execvpe =
        real!(fn execvpe(*const c_char, *const *const c_char, *const *const c_char) -> c_int);
    env::debug_env(envp);
    match env::propagated(envp) {
        None => real_execvpe(file, argv, envp),
        Some(block) => real_execvpe(file, argv, block.as_ptr()),
    }
}

#[no_mangle]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    shim_debug!(1, "execv(\"{}\", ...)", cstr_arg(path));
    execve_common(path, argv, env::current())
}

#[no_mangle]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    shim_debug!(1, "execve(\"{}\", ..., ...)", cstr_arg(path));
    execve_common(path, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    shim_debug!(1, "execvp(\"{}\", ...)", cstr_arg(file));
    execvpe_common(file, argv, env::current())
}

#[no_mangle]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    shim_debug!(1, "execvpe(\"{}\", ..., ...)", cstr_arg(file));
    execvpe_common(file, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn fexecve(
    fd: c_int,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let real_fexecve =
        real!(fn fexecve(c_int, *const *const c_char, *const *const c_char) -> c_int);
    shim_debug!(1, "fexecve({}, ..., ...)", fd);
    match env::propagated(envp) {
        None => real_fexecve(fd, argv, envp),
        Some(block) => real_fexecve(fd, argv, block.as_ptr()),
    }
}

// Landing pads for the C argument-repacking stubs in csrc/execl.c.

extern "C" {
    fn execl(path: *const c_char, arg0: *const c_char, ...) -> c_int;
    fn execle(path: *const c_char, arg0: *const c_char, ...) -> c_int;
    fn execlp(file: *const c_char, arg0: *const c_char, ...) -> c_int;
}

// Nothing else in the cdylib references the stubs' object file, and the
// linker drops unreferenced archive members; these relocations pin it.
#[used]
static KEEP_EXECL_STUBS: [unsafe extern "C" fn(*const c_char, *const c_char, ...) -> c_int; 3] =
    [execl, execle, execlp];

#[no_mangle]
pub unsafe extern "C" fn capfs_execl_impl(
    path: *const c_char,
    argv: *const *const c_char,
) -> c_int {
    shim_debug!(1, "execl(\"{}\", ...)", cstr_arg(path));
    execve_common(path, argv, env::current())
}

#[no_mangle]
pub unsafe extern "C" fn capfs_execle_impl(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    shim_debug!(1, "execle(\"{}\", ..., ...)", cstr_arg(path));
    execve_common(path, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn capfs_execlp_impl(
    file: *const c_char,
    argv: *const *const c_char,
) -> c_int {
    shim_debug!(1, "execlp(\"{}\", ...)", cstr_arg(file));
    execvpe_common(file, argv, env::current())
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    let real_posix_spawn = real!(fn posix_spawn(
        *mut pid_t,
        *const c_char,
        *const libc::posix_spawn_file_actions_t,
        *const libc::posix_spawnattr_t,
        *const *mut c_char,
        *const *mut c_char
    ) -> c_int);
    shim_debug!(1, "posix_spawn(\"{}\", ...)", cstr_arg(path));

    match env::propagated(envp as *const *const c_char) {
        None => real_posix_spawn(pid, path, file_actions, attrp, argv, envp),
        Some(block) => real_posix_spawn(
            pid,
            path,
            file_actions,
            attrp,
            argv,
            block.as_ptr() as *const *mut c_char,
        ),
    }
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawnp(
    pid: *mut pid_t,
    file: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    let real_posix_spawnp = real!(fn posix_spawnp(
        *mut pid_t,
        *const c_char,
        *const libc::posix_spawn_file_actions_t,
        *const libc::posix_spawnattr_t,
        *const *mut c_char,
        *const *mut c_char
    ) -> c_int);
    shim_debug!(1, "posix_spawnp(\"{}\", ...)", cstr_arg(file));

    match env::propagated(envp as *const *const c_char) {
        None => real_posix_spawnp(pid, file, file_actions, attrp, argv, envp),
        Some(block) => real_posix_spawnp(
            pid,
            file,
            file_actions,
            attrp,
            argv,
            block.as_ptr() as *const *mut c_char,
        ),
    }
}

#[no_mangle]
pub unsafe extern "C" fn system(command: *const c_char) -> c_int {
    let real_system = real!(fn system(*const c_char) -> c_int);
    shim_debug!(1, "system(\"{}\")", cstr_arg(command));

    // system's internal fork+exec reads the global environ
    env::with_propagated_environ(|| real_system(command))
}

#[no_mangle]
pub unsafe extern "C" fn popen(command: *const c_char, mode: *const c_char) -> *mut FILE {
    let real_popen = real!(fn popen(*const c_char, *const c_char) -> *mut FILE);
    shim_debug!(1, "popen(\"{}\", \"{}\")", cstr_arg(command), cstr_arg(mode));

    env::with_propagated_environ(|| real_popen(command, mode))
}

#[no_mangle]
pub unsafe extern "C" fn chdir(path: *const c_char) -> c_int {
    let real_chdir = real!(fn chdir(*const c_char) -> c_int);
    shim_debug!(1, "chdir(\"{}\")", cstr_arg(path));

    let rc = real_chdir(path);
    if rc == 0 {
        // the new cwd may differ from the argument through . / .. / symlinks
        state::refresh_cwd();
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn fchdir(fd: c_int) -> c_int {
    let real_fchdir = real!(fn fchdir(c_int) -> c_int);
    shim_debug!(1, "fchdir({})", fd);

    let rc = real_fchdir(fd);
    if rc == 0 {
        state::refresh_cwd();
    }
    rc
}

/// Plain forks carry no build-graph information: the child keeps this
/// process's identity until it execs.
#[no_mangle]
pub unsafe extern "C" fn fork() -> pid_t {
    let real_fork = real!(fn fork() -> pid_t);
    shim_debug!(1, "fork()");
    real_fork()
}

/// vfork's shared-stack contract can't survive the interposed exec path, so
/// the child gets a full fork instead. The cost is performance only.
#[no_mangle]
pub unsafe extern "C" fn vfork() -> pid_t {
    let real_fork = real!(fn fork() -> pid_t);
    shim_debug!(1, "vfork()");
    real_fork()
}

// File-existence probes tell us nothing about the build graph; observe and
// pass through.

#[no_mangle]
pub unsafe extern "C" fn access(path: *const c_char, mode: c_int) -> c_int {
    let real_access = real!(fn access(*const c_char, c_int) -> c_int);
    shim_debug!(1, "access(\"{}\", {})", cstr_arg(path), mode);
    real_access(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn eaccess(path: *const c_char, mode: c_int) -> c_int {
    let real_eaccess = real!(fn eaccess(*const c_char, c_int) -> c_int);
    shim_debug!(1, "eaccess(\"{}\", {})", cstr_arg(path), mode);
    real_eaccess(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn euidaccess(path: *const c_char, mode: c_int) -> c_int {
    let real_euidaccess = real!(fn euidaccess(*const c_char, c_int) -> c_int);
    shim_debug!(1, "euidaccess(\"{}\", {})", cstr_arg(path), mode);
    real_euidaccess(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn faccessat(
    dirfd: c_int,
    path: *const c_char,
    mode: c_int,
    flags: c_int,
) -> c_int {
    let real_faccessat = real!(fn faccessat(c_int, *const c_char, c_int, c_int) -> c_int);
    shim_debug!(
        1,
        "faccessat({}, \"{}\", {}, {})",
        dirfd,
        cstr_arg(path),
        mode,
        flags
    );
    real_faccessat(dirfd, path, mode, flags)
}

#[no_mangle]
pub unsafe extern "C" fn exit(status: c_int) -> ! {
    let real_exit = real!(fn exit(c_int) -> !);
    shim_debug!(1, "exit({})", status);
    real_exit(status)
}

#[no_mangle]
pub unsafe extern "C" fn _exit(status: c_int) -> ! {
    let real_exit = real!(fn _exit(c_int) -> !);
    shim_debug!(1, "_exit({})", status);
    real_exit(status)
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn _Exit(status: c_int) -> ! {
    let real_exit = real!(fn _Exit(c_int) -> !);
    shim_debug!(1, "_Exit({})", status);
    real_exit(status)
}
