use nix::errno::Errno;

/// Restores errno on drop. Every tracing block runs under one of these so
/// the interposed caller observes exactly the errno the real call left
/// behind.
pub(crate) struct ErrnoGuard(i32);

impl ErrnoGuard {
    pub(crate) fn new() -> ErrnoGuard {
        ErrnoGuard(Errno::last_raw())
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        Errno::set_raw(self.0);
    }
}
