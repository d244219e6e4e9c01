//! The runtime: owns the poller, the coroutine pool, the listener set and the per-connection fd
//! cache; drives the accept-then-dispatch event loop (§4.F).
//!
//! Grounded on `original_source/main.c`/`framework.h`'s `ef_init`/`ef_add_listen`/`ef_run_loop`
//! and `_ef_listen_info`/`_ef_runtime` field layout for the overall shape; the teacher's
//! `scheduler.rs` contributed the resume-then-branch-on-status dispatch idiom, generalized here
//! from its multi-threaded work-stealing loop (out of scope — Non-goal) down to the single-thread
//! accept/resume/tick loop this spec calls for.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::coroutine::Coroutine;
use crate::error::{Error, Result};
use crate::fault;
use crate::pool::Pool;
use crate::poller::{Event, MioPoller, Poller, IN};

/// Signature required of a per-listener entry procedure: given the accepted client fd and the
/// coroutine now running it, do the connection's work and return an arbitrary status code.
pub type EntryProc = fn(RawFd, &Coroutine) -> isize;

struct ListenRecord {
    fd: RawFd,
    entry: EntryProc,
}

/// Disambiguates a poller cookie without a second lookup table: listener cookies are the address
/// of their (stably-boxed) [`ListenRecord`] with the low tag bit set; RWC cookies are a bare
/// coroutine pointer (always at least word-aligned, so the tag bit is otherwise unused).
fn tag_listen(record: *mut ListenRecord) -> *mut () {
    ((record as usize) | 1) as *mut ()
}

fn tag_rwc(coro: *mut Coroutine) -> *mut () {
    debug_assert_eq!(coro as usize & 1, 0, "coroutine pointers must be word-aligned");
    coro as *mut ()
}

enum Cookie {
    Listen(*mut ListenRecord),
    Rwc(*mut Coroutine),
}

fn untag(cookie: *mut ()) -> Cookie {
    let addr = cookie as usize;
    if addr & 1 == 1 {
        Cookie::Listen((addr & !1) as *mut ListenRecord)
    } else {
        Cookie::Rwc(cookie as *mut Coroutine)
    }
}

/// A cheaply-cloneable external handle that can set a runtime's `stopping` flag from outside the
/// thread running it — the intended caller is a signal handler, per §6 ("stopping field —
/// settable from outside").
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request that the owning runtime's `run_loop` exit after its current iteration.
    /// Async-signal-safe: a single relaxed store, no allocation.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopping(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Owns the poller, the coroutine pool, the listener set, and a free-fd-holder cache; runs the
/// event loop described in §4.F.
pub struct Runtime {
    poller: MioPoller,
    pool: Pool,
    listeners: Vec<Box<ListenRecord>>,
    stopping: Arc<AtomicBool>,
    shrink_interval_ms: u64,
    poll_capacity: usize,
    event_buf: Vec<Event>,
    emfile_warned: Cell<bool>,
}

thread_local! {
    static ACTIVE_RUNTIME: Cell<*mut Runtime> = Cell::new(ptr::null_mut());
}

impl Runtime {
    /// Construct a runtime: installs the poller, the coroutine pool, and this thread's guard-page
    /// fault handler (§4.B) before any coroutine exists.
    pub fn new(
        stack_size: usize,
        header_size: usize,
        min_count: usize,
        max_count: usize,
        shrink_interval_ms: u64,
        shrink_batch: usize,
        poll_capacity: usize,
    ) -> Result<Runtime> {
        fault::install();
        let poller = MioPoller::new(poll_capacity)?;
        let pool = Pool::new(stack_size, header_size, min_count, max_count, shrink_interval_ms, shrink_batch);

        log::info!(
            "runtime init: stack_size={stack_size} min={min_count} max={max_count} \
             shrink_interval_ms={shrink_interval_ms} shrink_batch={shrink_batch}"
        );

        Ok(Runtime {
            poller,
            pool,
            listeners: Vec::new(),
            stopping: Arc::new(AtomicBool::new(false)),
            shrink_interval_ms,
            poll_capacity,
            event_buf: Vec::with_capacity(poll_capacity),
            emfile_warned: Cell::new(false),
        })
    }

    /// A handle that can request shutdown from outside this runtime's thread (e.g. a signal
    /// handler installed by the application).
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stopping.clone())
    }

    /// Register a listening descriptor. `fd` is put into nonblocking mode; `entry` is invoked once
    /// per accepted connection. The association record lives for the runtime's whole lifetime.
    pub fn add_listen(&mut self, fd: RawFd, entry: EntryProc) -> Result<()> {
        set_nonblocking(fd)?;

        let mut record = Box::new(ListenRecord { fd, entry });
        let cookie = tag_listen(record.as_mut() as *mut ListenRecord);
        self.poller.associate(fd, IN, cookie, false)?;
        self.listeners.push(record);

        log::info!("listening on fd={fd}");
        Ok(())
    }

    /// The main event loop (§4.F): wait for readiness, drain accepts, resume blocked coroutines,
    /// then tick the pool's shrink clock. Returns once `stopping` is observed true.
    pub fn run_loop(&mut self) {
        let self_ptr = self as *mut Runtime;
        ACTIVE_RUNTIME.with(|a| a.set(self_ptr));

        while !self.stopping.load(Ordering::Relaxed) {
            self.event_buf.clear();
            let n = match self.poller.wait(&mut self.event_buf, Some(self.shrink_interval_ms)) {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("poller wait failed: {e}");
                    continue;
                }
            };

            for i in 0..n {
                let ev = self.event_buf[i];
                match untag(ev.cookie) {
                    Cookie::Listen(record_ptr) => self.drain_accepts(record_ptr),
                    Cookie::Rwc(coro_ptr) => self.resume_rwc(coro_ptr, ev.events),
                }
            }

            self.pool.tick(Instant::now());
        }

        log::info!("run_loop: stopping observed, exiting");
        ACTIVE_RUNTIME.with(|a| a.set(ptr::null_mut()));
    }

    fn drain_accepts(&mut self, record_ptr: *mut ListenRecord) {
        let (listen_fd, entry) = unsafe {
            let r = &*record_ptr;
            (r.fd, r.entry)
        };

        loop {
            let client_fd = unsafe { libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut()) };
            if client_fd < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => break,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        if !self.emfile_warned.get() {
                            log::warn!("accept: {err} (fd limit); backing off until next readiness");
                            self.emfile_warned.set(true);
                        }
                        break;
                    }
                    Some(libc::EINTR) => continue,
                    _ => {
                        log::warn!("accept failed on listener fd={listen_fd}: {err}");
                        break;
                    }
                }
            }
            self.emfile_warned.set(false);

            if let Err(e) = set_nonblocking(client_fd) {
                log::warn!("accepted fd={client_fd} but nonblocking setup failed: {e}; closing");
                unsafe { libc::close(client_fd) };
                continue;
            }

            let spawn_result = self.pool.acquire(move |first_val| {
                let client_fd = first_val as RawFd;
                let coro_ptr = Coroutine::current().expect("entry runs inside its own coroutine");
                entry(client_fd, unsafe { &*coro_ptr })
            });

            let mut coro = match spawn_result {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("could not spawn coroutine for fd={client_fd}: {e}; closing");
                    unsafe { libc::close(client_fd) };
                    continue;
                }
            };
            // Recorded on the coroutine itself (not just this stack frame) so `resume_rwc` can
            // close it too, on whichever later resume actually observes `Exited` — the coroutine
            // may suspend on an I/O wrapper any number of times before it does.
            coro.set_io_fd(client_fd);

            match Coroutine::resume(&mut coro, client_fd as isize) {
                Ok(_) if coro.status() == crate::coroutine::Status::Exited => {
                    unsafe { libc::close(client_fd) };
                    self.pool.release(coro);
                }
                Ok(_) => {
                    // Suspended mid-flight on an I/O wrapper; it already associated itself with
                    // the poller using `tag_rwc(coro_ptr)` as its own cookie (see `io.rs`), and
                    // owns itself until its entry returns. Leak the box out of this scope — the
                    // coroutine now "owns" itself via that registration and is reclaimed in
                    // `resume_rwc` once it exits.
                    std::mem::forget(coro);
                }
                Err(e) => {
                    log::warn!("initial resume of fd={client_fd} failed: {e}");
                    unsafe { libc::close(client_fd) };
                    self.pool.release(coro);
                }
            }
        }
    }

    fn resume_rwc(&mut self, coro_ptr: *mut Coroutine, events: u32) {
        let coro = unsafe { &mut *coro_ptr };
        match Coroutine::resume(coro, events as isize) {
            Ok(_) if coro.status() == crate::coroutine::Status::Exited => {
                // On return or failure the adapter is responsible for closing the client fd
                // (§4.F); a coroutine reclaimed here has already suspended and been resumed at
                // least once since `drain_accepts`, so that stack frame's `client_fd` local is
                // long gone — read it back off the coroutine instead of leaking it.
                close_io_fd(coro);
                let boxed = unsafe { Box::from_raw(coro_ptr) };
                self.pool.release(boxed);
            }
            Ok(_) => {
                // Suspended again on another I/O wrapper; still self-owned via its own
                // registration.
            }
            Err(e) => {
                log::warn!("resume of suspended coroutine failed: {e}");
                close_io_fd(coro);
                let boxed = unsafe { Box::from_raw(coro_ptr) };
                self.pool.release(boxed);
            }
        }
    }
}

/// Close and clear whichever client fd this coroutine was last servicing, if any.
fn close_io_fd(coro: &Coroutine) {
    let fd = coro.io_fd();
    if fd >= 0 {
        unsafe { libc::close(fd) };
        coro.set_io_fd(-1);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Outstanding coroutines that are idle-waiting on the poller are abandoned here, per
        // §4.F: their stacks are released when the runtime (and its pool) is dropped, without
        // forcibly unwinding them first.
        log::info!("runtime teardown: {} coroutines outstanding in pool", self.pool.len());
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// The coroutine currently running on this OS thread, read via the same thread-local slot the
/// guard-page fault handler consults (§9 design note: thread-local, not a process-wide global).
pub fn current_coroutine() -> Option<*mut Coroutine> {
    Coroutine::current()
}

/// Resolve the active runtime's poller for the calling thread, for use by the I/O wrappers
/// (`io.rs`). Returns `None` if called outside a `run_loop`.
pub(crate) fn with_active_poller<R>(f: impl FnOnce(&mut dyn Poller) -> R) -> Option<R> {
    ACTIVE_RUNTIME.with(|a| {
        let ptr = a.get();
        if ptr.is_null() {
            None
        } else {
            let rt = unsafe { &mut *ptr };
            Some(f(&mut rt.poller))
        }
    })
}

pub(crate) fn rwc_cookie(coro: *mut Coroutine) -> *mut () {
    tag_rwc(coro)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_and_untag_roundtrip_listen_and_rwc() {
        let mut record = Box::new(ListenRecord { fd: 3, entry: |_, _| 0 });
        let record_ptr = record.as_mut() as *mut ListenRecord;
        let cookie = tag_listen(record_ptr);
        match untag(cookie) {
            Cookie::Listen(p) => assert_eq!(p, record_ptr),
            Cookie::Rwc(_) => panic!("expected Listen"),
        }

        let fake_coro = 0x1000usize as *mut Coroutine;
        let cookie = tag_rwc(fake_coro);
        match untag(cookie) {
            Cookie::Rwc(p) => assert_eq!(p, fake_coro),
            Cookie::Listen(_) => panic!("expected Rwc"),
        }
    }

    #[test]
    fn stop_handle_is_observed_by_is_stopping() {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = StopHandle(flag.clone());
        assert!(!handle.is_stopping());
        handle.stop();
        assert!(flag.load(Ordering::Relaxed));
        assert!(handle.is_stopping());
    }
}
