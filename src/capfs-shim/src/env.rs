//! Environment propagation across exec and spawn.
//!
//! Tracing survives only if every child image starts with the right values
//! for the five tracked variables. Programs routinely rebuild or scrub their
//! environment, so each spawning call rewrites an outgoing copy with
//! authoritative values just before handing it to libc.

use std::ffi::{CStr, CString};

use libc::c_char;

use crate::errno::ErrnoGuard;
use crate::log::shim_debug;
use crate::state;

extern "C" {
    static mut environ: *mut *const c_char;
}

const LD_PRELOAD_SLOT: usize = 4;

const NAMES: [&[u8]; 5] = [
    b"CFS_ID=",
    b"CFS_PARENT_ID=",
    b"CFS_DEBUG=",
    b"CFS_LOG_FILE=",
    b"LD_PRELOAD=",
];

/// Replacement environment array for a child image. Entries we didn't touch
/// keep pointing into the caller's array, which outlives the exec/spawn
/// call; rewritten entries are owned here and freed on the failure return.
pub(crate) struct EnvBlock {
    #[allow(dead_code)]
    owned: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl EnvBlock {
    pub(crate) fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }
}

/// Build the outgoing environment from `envp`. `None` when this process is
/// not tracing; the caller must then pass its original array through
/// untouched.
pub(crate) unsafe fn propagated(envp: *const *const c_char) -> Option<EnvBlock> {
    let shim = state::shim()?;
    let _errno = ErrnoGuard::new();

    let mut ptrs: Vec<*const c_char> = Vec::new();
    let mut found: [Option<usize>; 5] = [None; 5];

    if !envp.is_null() {
        let mut i = 0;
        loop {
            let entry = *envp.add(i);
            if entry.is_null() {
                break;
            }
            let bytes = CStr::from_ptr(entry).to_bytes();
            for (slot, name) in NAMES.iter().enumerate() {
                if bytes.starts_with(name) {
                    found[slot] = Some(ptrs.len());
                }
            }
            ptrs.push(entry);
            i += 1;
        }
    }

    // a program that rewrote LD_PRELOAD gets it overwritten again; tracing
    // depends on it, but tell the user their change went missing
    if let Some(idx) = found[LD_PRELOAD_SLOT] {
        let existing = CStr::from_ptr(ptrs[idx]);
        if existing.to_bytes() != shim.ld_preload.to_bytes() {
            shim_debug!(
                0,
                "WARNING: LD_PRELOAD has been modified - the program may malfunction"
            );
        }
    }

    let values = [
        CString::new(format!("CFS_ID={}", shim.buffer.id())).ok()?,
        CString::new(format!("CFS_PARENT_ID={}", shim.process_number)).ok()?,
        CString::new(format!("CFS_DEBUG={}", state::debug_level())).ok()?,
        {
            let mut v = b"CFS_LOG_FILE=".to_vec();
            v.extend_from_slice(state::log_file().to_bytes());
            CString::new(v).ok()?
        },
        shim.ld_preload.clone(),
    ];

    let mut owned = Vec::with_capacity(values.len());
    for (slot, value) in values.into_iter().enumerate() {
        let idx = match found[slot] {
            Some(idx) => idx,
            None => {
                ptrs.push(std::ptr::null());
                ptrs.len() - 1
            }
        };
        // CString buffers are heap-stable; the pointer survives the move
        ptrs[idx] = value.as_ptr();
        owned.push(value);
    }
    ptrs.push(std::ptr::null());

    Some(EnvBlock { owned, ptrs })
}

/// The process's own environment array, for the exec variants that inherit
/// it implicitly.
pub(crate) unsafe fn current() -> *const *const c_char {
    environ as *const *const c_char
}

/// Swap a propagated environment into the global `environ` around `f`.
/// `system` and `popen` spawn through an internal fork+exec that reads
/// `environ` directly, so rewriting the pointer is the only hook available.
pub(crate) unsafe fn with_propagated_environ<R>(f: impl FnOnce() -> R) -> R {
    let Some(block) = propagated(current()) else {
        return f();
    };
    let saved = environ;
    environ = block.as_ptr() as *mut *const c_char;
    let result = f();
    environ = saved;
    result
}

/// Dump an outgoing environment at the most verbose debug level.
pub(crate) unsafe fn debug_env(envp: *const *const c_char) {
    if state::debug_level() < 2 || envp.is_null() {
        return;
    }
    let mut i = 0;
    loop {
        let entry = *envp.add(i);
        if entry.is_null() {
            break;
        }
        shim_debug!(2, "  env {}", CStr::from_ptr(entry).to_string_lossy());
        i += 1;
    }
}
