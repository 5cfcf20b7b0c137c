//! Shared multi-producer / single-consumer trace buffer.
//!
//! The driver creates one SysV shared-memory segment per build; every traced
//! process attaches to it by the id passed down in `CFS_ID` and appends
//! encoded records to the payload. The driver periodically drains the payload
//! to disk. Three semaphores in a single kernel set coordinate access:
//!
//! * `master`: mutual exclusion over the payload and its size field. A
//!   producer holds it for the duration of one logical record.
//! * `full`: the buffer-full handoff between producers and the consumer
//!   (see [`TraceBuffer::mark_full`]).
//! * `logfile`: serializes writers of the plain-text debug log.
//!
//! The segment is marked for removal at creation time, so it cannot outlive
//! the build even if the driver dies uncleanly.

use std::ffi::c_void;
use std::io;
use std::mem::size_of;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracefmt::{Event, EventSink};

/// Default region size, header included.
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

/// Written once at creation; never mutated afterwards.
const BUFFER_MAGIC: u32 = 0x1357_2468;

const SEM_MASTER: u16 = 0;
const SEM_FULL: u16 = 1;
const SEM_LOG_FILE: u16 = 2;
const SEM_COUNT: i32 = 3;

const HEADER_SIZE: usize = size_of::<Header>();

#[repr(C)]
struct Header {
    magic: u32,
    /// Payload bytes currently used. Only the master-lock holder writes it,
    /// with one exception: the consumer resets it after a drain, when every
    /// producer is parked on either `master` or `full`.
    size: u32,
    sem_id: i32,
    creator_pid: i32,
    /// Next process number to hand out. The driver is 0; the first traced
    /// child receives 1. Kernel pids are 16-bit and reused within one build,
    /// hence this separate 32-bit counter.
    next_process: u32,
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("a trace buffer is already attached to this process")]
    AlreadyAttached,
    #[error("shared memory segment {id} does not carry a trace buffer")]
    BadMagic { id: i32 },
    #[error("couldn't install SIGCHLD handler")]
    SigChld(#[source] io::Error),
    #[error(transparent)]
    Os(#[from] Errno),
}

/// Outcome of [`TraceBuffer::wait_until_full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// A producer filled the buffer; drain it and mark it empty.
    Full,
    /// The direct child terminated. The buffer may still hold a final batch.
    Eof,
}

// One attachment per process. The shim and the driver each own exactly one
// handle; a second create/attach in the same process is a caller bug.
static ATTACHED: AtomicBool = AtomicBool::new(false);

// Set from the SIGCHLD handler; read by the consumer. Reset on every create
// so a driver reused in-process (tests) starts clean.
static CHILD_TERMINATED: Lazy<Arc<AtomicBool>> = Lazy::new(Default::default);
static SIGCHLD_HOOK: OnceCell<signal_hook::SigId> = OnceCell::new();

trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

impl IsMinusOne for i32 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for isize {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

fn err<T: IsMinusOne + Copy>(ret: T) -> Result<T, Errno> {
    if ret.is_minus_one() {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

/// Owned attachment to the shared trace buffer. Dropping it detaches; the
/// creating process additionally tears down the semaphore set.
pub struct TraceBuffer {
    shm_id: i32,
    hdr: *mut Header,
    size: usize,
    creator: bool,
}

// The region is shared between processes anyway; within one process the
// semaphore set provides the required exclusion.
unsafe impl Send for TraceBuffer {}
unsafe impl Sync for TraceBuffer {}

impl TraceBuffer {
    /// Allocate a fresh region plus semaphore set and become its creator.
    pub fn create() -> Result<TraceBuffer, BufferError> {
        Self::create_with_size(DEFAULT_BUFFER_SIZE)
    }

    /// Like [`create`](Self::create) with an explicit region size. Sized-down
    /// buffers are useful to exercise the full/empty handoff in tests.
    pub fn create_with_size(size: usize) -> Result<TraceBuffer, BufferError> {
        claim_process_slot()?;

        let shm_id = match err(unsafe { libc::shmget(libc::IPC_PRIVATE, size, 0o600) }) {
            Ok(id) => id,
            Err(e) => {
                release_process_slot();
                return Err(e.into());
            }
        };
        match Self::init_region(shm_id, size) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                unsafe { libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut()) };
                release_process_slot();
                Err(e)
            }
        }
    }

    fn init_region(shm_id: i32, size: usize) -> Result<TraceBuffer, BufferError> {
        let sem_id = err(unsafe { libc::semget(libc::IPC_PRIVATE, SEM_COUNT, libc::IPC_CREAT | 0o600) })?;

        // master and logfile are plain mutexes; full starts at 1 so the
        // consumer's wait-for-zero blocks until a producer decrements it
        for sem in [SEM_MASTER, SEM_FULL, SEM_LOG_FILE] {
            if let Err(e) = err(unsafe { libc::semctl(sem_id, sem as i32, libc::SETVAL, 1) }) {
                unsafe { libc::semctl(sem_id, 0, libc::IPC_RMID) };
                return Err(e.into());
            }
        }

        let base = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if base as isize == -1 {
            let errno = Errno::last();
            unsafe { libc::semctl(sem_id, 0, libc::IPC_RMID) };
            return Err(errno.into());
        }

        // remove-on-last-detach: the segment must not outlive the build
        unsafe { libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut()) };

        let hdr = base as *mut Header;
        unsafe {
            (*hdr).magic = BUFFER_MAGIC;
            (*hdr).size = 0;
            (*hdr).sem_id = sem_id;
            (*hdr).creator_pid = libc::getpid();
            (*hdr).next_process = 1;
        }

        if let Err(err) = SIGCHLD_HOOK.get_or_try_init(|| {
            signal_hook::flag::register(
                signal_hook::consts::SIGCHLD,
                Arc::clone(&CHILD_TERMINATED),
            )
        }) {
            unsafe {
                libc::semctl(sem_id, 0, libc::IPC_RMID);
                libc::shmdt(base);
            }
            return Err(BufferError::SigChld(err));
        }
        CHILD_TERMINATED.store(false, Ordering::SeqCst);

        Ok(TraceBuffer {
            shm_id,
            hdr,
            size,
            creator: true,
        })
    }

    /// Attach to a buffer created by another process (normally the driver).
    pub fn attach(id: i32) -> Result<TraceBuffer, BufferError> {
        claim_process_slot()?;

        let base = unsafe { libc::shmat(id, ptr::null(), 0) };
        if base as isize == -1 {
            let errno = Errno::last();
            release_process_slot();
            return Err(errno.into());
        }
        let hdr = base as *mut Header;
        if unsafe { (*hdr).magic } != BUFFER_MAGIC {
            unsafe { libc::shmdt(base) };
            release_process_slot();
            return Err(BufferError::BadMagic { id });
        }

        let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
        let size = match err(unsafe { libc::shmctl(id, libc::IPC_STAT, &mut stat) }) {
            Ok(_) => stat.shm_segsz as usize,
            Err(e) => {
                unsafe { libc::shmdt(base) };
                release_process_slot();
                return Err(e.into());
            }
        };

        Ok(TraceBuffer {
            shm_id: id,
            hdr,
            size,
            creator: false,
        })
    }

    /// The id traced children attach by; passed around as `CFS_ID`.
    pub fn id(&self) -> i32 {
        self.shm_id
    }

    fn sem_id(&self) -> i32 {
        unsafe { (*self.hdr).sem_id }
    }

    fn payload_base(&self) -> *mut u8 {
        unsafe { (self.hdr as *mut u8).add(HEADER_SIZE) }
    }

    fn payload_capacity(&self) -> usize {
        self.size - HEADER_SIZE
    }

    fn semop(&self, sem: u16, op: i16, flags: i16) -> Result<(), BufferError> {
        let mut sb = libc::sembuf {
            sem_num: sem,
            sem_op: op,
            sem_flg: flags,
        };
        loop {
            let rc = unsafe { libc::semop(self.sem_id(), &mut sb, 1) };
            if rc != -1 {
                return Ok(());
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(errno.into());
            }
        }
    }

    /// Take the master lock. The guard is the only way to write records or
    /// allocate process numbers, so "writers hold master" holds by
    /// construction.
    pub fn lock(&self) -> Result<BufferGuard<'_>, BufferError> {
        self.semop(SEM_MASTER, -1, libc::SEM_UNDO as i16)?;
        Ok(BufferGuard { buf: self })
    }

    /// Serialize debug-log writers across every traced process.
    pub fn lock_logfile(&self) -> Result<LogGuard<'_>, BufferError> {
        self.semop(SEM_LOG_FILE, -1, libc::SEM_UNDO as i16)?;
        Ok(LogGuard { buf: self })
    }

    /// Current payload. Only meaningful to the consumer, after
    /// [`wait_until_full`](Self::wait_until_full) has reported that the
    /// producers are parked.
    pub fn fetch(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.payload_base(), (*self.hdr).size as usize) }
    }

    /// Reset the payload to empty after draining it.
    pub fn empty_content(&self) {
        unsafe { (*self.hdr).size = 0 };
    }

    /// The buffer-full handoff.
    ///
    /// A producer that cannot fit its next bytes calls `mark_full(true)`:
    /// the first decrement drops `full` to zero (waking the consumer's
    /// wait-for-zero), the second blocks the producer until the consumer
    /// hands capacity back. The consumer calls `mark_full(false)` after
    /// draining, adding *two* units: one releases the parked producer, the
    /// other re-arms the consumer's next wait. A single unit would leave
    /// both sides blocked.
    pub fn mark_full(&self, full: bool) -> Result<(), BufferError> {
        if full {
            self.semop(SEM_FULL, -1, 0)?;
            self.semop(SEM_FULL, -1, 0)
        } else {
            self.semop(SEM_FULL, 2, 0)
        }
    }

    /// Block until a producer reports the buffer full, or until the direct
    /// child has terminated ([`DrainStatus::Eof`]).
    pub fn wait_until_full(&self) -> Result<DrainStatus, BufferError> {
        if CHILD_TERMINATED.load(Ordering::SeqCst) {
            return Ok(DrainStatus::Eof);
        }
        let mut sb = libc::sembuf {
            sem_num: SEM_FULL,
            sem_op: 0,
            sem_flg: 0,
        };
        let rc = unsafe { libc::semop(self.sem_id(), &mut sb, 1) };
        if rc == -1 {
            // the only signal routed here is SIGCHLD, so an interrupted wait
            // means the child died
            return match Errno::last() {
                Errno::EINTR => Ok(DrainStatus::Eof),
                errno => Err(errno.into()),
            };
        }
        Ok(DrainStatus::Full)
    }
}

impl Drop for TraceBuffer {
    fn drop(&mut self) {
        unsafe {
            // only the creating process may destroy the lock set; a forked
            // copy of the creator's handle must not
            if self.creator && (*self.hdr).creator_pid == libc::getpid() {
                libc::semctl((*self.hdr).sem_id, 0, libc::IPC_RMID);
            }
            libc::shmdt(self.hdr as *const c_void);
        }
        release_process_slot();
    }
}

fn claim_process_slot() -> Result<(), BufferError> {
    ATTACHED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .map(|_| ())
        .map_err(|_| BufferError::AlreadyAttached)
}

fn release_process_slot() {
    ATTACHED.store(false, Ordering::SeqCst);
}

/// Master-lock holder. Typed writes go straight into the shared payload,
/// handing off to the consumer whenever the region fills up mid-write.
pub struct BufferGuard<'a> {
    buf: &'a TraceBuffer,
}

impl BufferGuard<'_> {
    pub fn write_byte(&mut self, byte: u8) -> Result<(), BufferError> {
        self.write_bytes(&[byte])
    }

    /// Little-endian 32-bit, the only integer width in the trace format.
    pub fn write_int(&mut self, value: u32) -> Result<(), BufferError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// String bytes plus terminating NUL.
    pub fn write_string(&mut self, s: &std::ffi::CStr) -> Result<(), BufferError> {
        self.write_bytes(s.to_bytes_with_nul())
    }

    /// Append raw bytes, splitting across as many full-buffer handoffs as it
    /// takes. A write far larger than the region completes in order; the
    /// consumer sees it spread over several drains.
    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<(), BufferError> {
        while !bytes.is_empty() {
            let used = unsafe { (*self.buf.hdr).size } as usize;
            let avail = self.buf.payload_capacity() - used;
            if avail == 0 {
                self.buf.mark_full(true)?;
                continue;
            }
            let take = bytes.len().min(avail);
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), self.buf.payload_base().add(used), take);
                (*self.buf.hdr).size = (used + take) as u32;
            }
            bytes = &bytes[take..];
        }
        Ok(())
    }

    /// Encode one record. The whole record goes out under this guard's
    /// master lock, which is what makes records indivisible between
    /// producers.
    pub fn write_event(&mut self, event: &Event) -> Result<(), BufferError> {
        event.write_to(self)
    }

    /// Allocate the next build-scoped process number (first value: 1).
    pub fn next_process_number(&mut self) -> u32 {
        unsafe {
            let n = (*self.buf.hdr).next_process;
            (*self.buf.hdr).next_process = n + 1;
            n
        }
    }
}

impl EventSink for BufferGuard<'_> {
    type Error = BufferError;

    fn put_byte(&mut self, byte: u8) -> Result<(), BufferError> {
        self.write_byte(byte)
    }

    fn put_u32(&mut self, value: u32) -> Result<(), BufferError> {
        self.write_int(value)
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.write_bytes(bytes)
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        let _ = self.buf.semop(SEM_MASTER, 1, libc::SEM_UNDO as i16);
    }
}

/// Log-file lock holder; releases on drop.
pub struct LogGuard<'a> {
    buf: &'a TraceBuffer,
}

impl Drop for LogGuard<'_> {
    fn drop(&mut self) {
        let _ = self.buf.semop(SEM_LOG_FILE, 1, libc::SEM_UNDO as i16);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use std::ffi::CString;
    use tracefmt::EventKind;

    fn cs(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    #[serial]
    fn one_buffer_per_process() {
        let buf = TraceBuffer::create_with_size(8192).unwrap();
        assert!(matches!(
            TraceBuffer::create_with_size(8192),
            Err(BufferError::AlreadyAttached)
        ));
        drop(buf);
        let buf = TraceBuffer::create_with_size(8192).unwrap();
        drop(buf);
    }

    #[test]
    #[serial]
    fn attach_verifies_the_magic() {
        // a raw segment that was never initialized as a trace buffer
        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, 4096, 0o600) };
        assert_ne!(shm_id, -1);
        let res = TraceBuffer::attach(shm_id);
        assert!(matches!(res, Err(BufferError::BadMagic { .. })));
        unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };

        // and nothing stays claimed after the failure
        drop(TraceBuffer::create_with_size(8192).unwrap());
    }

    #[test]
    #[serial]
    fn attach_rejects_unknown_ids() {
        assert!(matches!(TraceBuffer::attach(-1), Err(BufferError::Os(_))));
        drop(TraceBuffer::create_with_size(8192).unwrap());
    }

    #[test]
    #[serial]
    fn typed_writes_use_little_endian() {
        let buf = TraceBuffer::create_with_size(8192).unwrap();
        {
            let mut guard = buf.lock().unwrap();
            guard.write_byte(0xAB).unwrap();
            guard.write_int(0x1357_2468).unwrap();
            guard.write_string(&cs("hi")).unwrap();
        }
        assert_eq!(
            buf.fetch(),
            &[0xAB, 0x68, 0x24, 0x57, 0x13, b'h', b'i', 0][..]
        );
        buf.empty_content();
        assert!(buf.fetch().is_empty());
    }

    #[test]
    #[serial]
    fn process_numbers_start_at_one_and_increase() {
        let buf = TraceBuffer::create_with_size(8192).unwrap();
        let mut guard = buf.lock().unwrap();
        assert_eq!(guard.next_process_number(), 1);
        assert_eq!(guard.next_process_number(), 2);
        assert_eq!(guard.next_process_number(), 3);
    }

    #[test]
    #[serial]
    fn events_round_trip_through_the_payload() {
        let buf = TraceBuffer::create_with_size(8192).unwrap();
        let ev = Event::Path {
            kind: EventKind::FileWrite,
            process: 4,
            path: cs("/tmp/out.o"),
        };
        buf.lock().unwrap().write_event(&ev).unwrap();
        assert_eq!(tracefmt::parse_payload(buf.fetch()).unwrap(), vec![ev]);
    }

    #[test]
    #[serial]
    fn concurrent_producers_never_interleave_within_an_event() {
        let buf = TraceBuffer::create_with_size(DEFAULT_BUFFER_SIZE).unwrap();
        const PER_THREAD: u32 = 200;

        std::thread::scope(|s| {
            for t in 0..2u32 {
                let buf = &buf;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let ev = Event::Path {
                            kind: EventKind::FileRead,
                            process: t,
                            path: cs(&format!("/src/thread{t}/file{i}.c")),
                        };
                        buf.lock().unwrap().write_event(&ev).unwrap();
                    }
                });
            }
        });

        let events = tracefmt::parse_payload(buf.fetch()).unwrap();
        assert_eq!(events.len(), (2 * PER_THREAD) as usize);
        for t in 0..2u32 {
            let mine: Vec<_> = events.iter().filter(|e| e.process() == t).collect();
            assert_eq!(mine.len(), PER_THREAD as usize);
            // per-producer program order is preserved
            for (i, ev) in mine.iter().enumerate() {
                match ev {
                    Event::Path { path, .. } => {
                        assert_eq!(path.to_bytes(), format!("/src/thread{t}/file{i}.c").as_bytes());
                    }
                    other => panic!("unexpected event {other:?}"),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn oversized_write_crosses_multiple_handoffs() {
        let buf = TraceBuffer::create_with_size(4096).unwrap();
        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        let total = payload.len();

        std::thread::scope(|s| {
            let consumer = s.spawn(|| {
                let mut collected = Vec::new();
                loop {
                    buf.wait_until_full().unwrap();
                    collected.extend_from_slice(buf.fetch());
                    buf.empty_content();
                    buf.mark_full(false).unwrap();
                    if collected.len() >= total {
                        return collected;
                    }
                }
            });

            {
                let mut guard = buf.lock().unwrap();
                guard.write_bytes(&payload).unwrap();
            }
            // flush the final partial buffer to the consumer
            buf.mark_full(true).unwrap();

            let collected = consumer.join().unwrap();
            assert_eq!(collected, payload);
        });
    }

    #[test]
    #[serial]
    fn child_exit_surfaces_as_eof() {
        use nix::sys::wait::waitpid;
        use nix::unistd::{fork, ForkResult};

        let buf = TraceBuffer::create_with_size(8192).unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(0) },
            ForkResult::Parent { child } => {
                assert_eq!(buf.wait_until_full().unwrap(), DrainStatus::Eof);
                waitpid(child, None).unwrap();
            }
        }
    }
}
