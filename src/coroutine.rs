//! Coroutine objects: status, parent link, the context-switch-driven `resume`/`yield_now`, and
//! the bootstrap trampoline that turns a synthesized initial context into a running entry
//! procedure.

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::stack::Stack;

/// A coroutine's lifecycle status. Simplified from the many-state machine a preemptible runtime
/// would need down to the two states a strictly cooperative, parent/child-resumed coroutine can
/// ever be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created, never resumed past a still-pending entry invocation.
    Inited,
    /// The entry procedure has returned; the coroutine will never run again.
    Exited,
}

type Entry = Box<dyn FnOnce(isize) -> isize>;

/// A single coroutine: its own reserved, guard-paged stack, a saved context, and the entry
/// closure that runs on first resume.
///
/// Unlike the embedded-control-block layout of the original C implementation (which carves the
/// coroutine struct itself out of the stack's top header region), this control block is a normal
/// heap allocation; `header_size` still reserves the address range above `Stack::upper()` so
/// callers that want that embedding can do it themselves. See DESIGN.md.
pub struct Coroutine {
    status: Cell<Status>,
    ctx: Cell<Context>,
    parent: Cell<*mut Coroutine>,
    /// `None` only for the per-thread [`Coroutine::new_root`] sentinel, which represents the OS
    /// thread's own native stack (§3 "Thread-coroutine") rather than a reserved region this crate
    /// owns.
    stack: Option<Stack>,
    entry: Cell<Option<Entry>>,
    /// Set while this coroutine is current or suspended as an ancestor of the coroutine current
    /// on this thread — i.e. somewhere in an active resume chain rather than idle. `resume`
    /// rejects a target with this set, distinct from `status` (which stays `Inited` across a
    /// suspend/resume cycle): a coroutine can be `Inited` and idle (a valid resume target) or
    /// `Inited` and running (not a valid resume target until it next suspends).
    running: Cell<bool>,
    /// Set by `grow_stack` when a commit leaves fewer than one page of reserve between the new
    /// `stack_lower` and the guard page. Checked (and logged) in `Drop`, never inside the fault
    /// handler itself — emitting a log record there would violate async-signal-safety.
    near_limit: Cell<bool>,
    /// The client fd this coroutine is servicing, if any. Set by the runtime's accept loop so
    /// that dispatch can close the fd once the coroutine exits even after it has suspended and
    /// been resumed again — the RWC association record's only piece of runtime-specific state
    /// that can't be recovered from the coroutine pointer alone (§4.F: the adapter "closes the
    /// client fd" on return or failure). `-1` means none.
    io_fd: Cell<RawFd>,
}

// A Coroutine is moved between threads only as part of a whole Runtime; within one runtime it's
// only ever touched from the single OS thread driving the event loop.
unsafe impl Send for Coroutine {}

impl Drop for Coroutine {
    fn drop(&mut self) {
        if self.near_limit.get() {
            log::warn!(
                "coroutine stack grew to within one page of its {}-byte reservation before exiting",
                self.stack.as_ref().map(Stack::size).unwrap_or(0)
            );
        }
    }
}

impl Coroutine {
    /// Create a new coroutine in status `Inited`. `entry` receives the `sndval` of whichever
    /// `resume` first runs it, and its return value becomes the `rcvval` of the `resume` call
    /// that observes its exit.
    pub fn create<F>(stack_size: usize, header_size: usize, entry: F) -> Result<Box<Coroutine>>
    where
        F: FnOnce(isize) -> isize + 'static,
    {
        let stack = Stack::new(stack_size, header_size).map_err(Error::StackAlloc)?;
        let upper = stack.upper();

        let mut coro = Box::new(Coroutine {
            status: Cell::new(Status::Inited),
            ctx: Cell::new(Context(0)),
            parent: Cell::new(std::ptr::null_mut()),
            stack: Some(stack),
            entry: Cell::new(Some(Box::new(entry))),
            running: Cell::new(false),
            near_limit: Cell::new(false),
            io_fd: Cell::new(-1),
        });

        let self_ptr = coro.as_mut() as *mut Coroutine as usize;
        coro.ctx.set(Context::new(upper, self_ptr));
        Ok(coro)
    }

    /// The per-thread sentinel representing the OS thread's own native stack (§3
    /// "Thread-coroutine"). It owns no reserved memory and never runs an entry procedure; it
    /// exists purely so [`resume`]/[`yield_now`] have a real context slot to save the calling
    /// thread's stack pointer into when a coroutine is resumed directly from the OS thread rather
    /// than from another coroutine. Always the root of every resume chain on its thread.
    fn new_root() -> Box<Coroutine> {
        Box::new(Coroutine {
            status: Cell::new(Status::Inited),
            ctx: Cell::new(Context(0)),
            parent: Cell::new(std::ptr::null_mut()),
            stack: None,
            entry: Cell::new(None),
            running: Cell::new(false),
            near_limit: Cell::new(false),
            io_fd: Cell::new(-1),
        })
    }

    /// Whether this is the per-thread root sentinel rather than a real, stack-owning coroutine.
    pub(crate) fn is_thread_root(&self) -> bool {
        self.stack.is_none()
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Reconfigure an `Exited` coroutine in place for reuse, reusing its already-reserved and
    /// partially-committed stack instead of reserving a fresh one.
    ///
    /// Re-runs the bootstrap synthesis from `create` against the same [`Stack`], so the next
    /// `resume` lands in `bootstrap_trampoline` exactly as it would for a brand new coroutine.
    /// Used by [`crate::pool::Pool::acquire`] to recycle freed coroutines. Panics if `self` is
    /// still `Inited` — a live coroutine must never be reset out from under itself.
    pub(crate) fn reset<F>(&mut self, entry: F)
    where
        F: FnOnce(isize) -> isize + 'static,
    {
        assert_eq!(self.status.get(), Status::Exited, "reset of a still-live coroutine");
        self.entry.set(Some(Box::new(entry)));
        self.parent.set(std::ptr::null_mut());
        let self_ptr = self as *mut Coroutine as usize;
        let upper = self.stack.as_ref().expect("reset of the thread-root sentinel").upper();
        self.ctx.set(Context::new(upper, self_ptr));
        self.status.set(Status::Inited);
        self.running.set(false);
        self.near_limit.set(false);
        self.io_fd.set(-1);
    }

    /// Lowest address currently committed on this coroutine's stack.
    pub fn stack_lower(&self) -> usize {
        self.stack.as_ref().expect("stack_lower on the thread-root sentinel").lower()
    }

    /// Reserved stack region base (the guard page starts here).
    pub fn stack_area(&self) -> usize {
        self.stack.as_ref().expect("stack_area on the thread-root sentinel").area()
    }

    pub fn stack_upper(&self) -> usize {
        self.stack.as_ref().expect("stack_upper on the thread-root sentinel").upper()
    }

    /// Total reserved size of this coroutine's stack, in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().expect("stack_size on the thread-root sentinel").size()
    }

    /// The client fd this coroutine is currently servicing, or `-1` if none has been recorded.
    pub fn io_fd(&self) -> RawFd {
        self.io_fd.get()
    }

    /// Record the client fd this coroutine is servicing, so it can be recovered (and closed) by
    /// whoever reaps the coroutine after it exits, even if it exits after suspending and being
    /// resumed again rather than on its first run.
    pub fn set_io_fd(&self, fd: RawFd) {
        self.io_fd.set(fd);
    }

    /// Grow this coroutine's committed stack down to `new_lower`, invoked by the guard-page fault
    /// handler once it has validated the address range.
    ///
    /// # Safety
    /// Must only be called with a `new_lower` already validated by `stack::guard::decide` against
    /// this coroutine's current bounds.
    pub unsafe fn grow_stack(&self, new_lower: usize) -> io::Result<()> {
        // `Stack::commit_down_to` takes `&mut self`; a coroutine's stack is never concurrently
        // accessed (single-threaded cooperative model: either this coroutine is suspended, and
        // the fault can't be happening, or it's running and faulting into its own stack), so a
        // shared reference is sufficient to justify the cast here.
        let stack_ref = self.stack.as_ref().expect("grow_stack on the thread-root sentinel");
        let stack = stack_ref as *const Stack as *mut Stack;
        (*stack).commit_down_to(new_lower)?;

        // Flag only; the actual `warn!` is emitted from `Drop`, never here — this runs on the
        // signal path and must stay allocation-free.
        if new_lower - stack_ref.area() <= crate::stack::page_size() {
            self.near_limit.set(true);
        }
        Ok(())
    }

    /// Resume `this`, sending `sndval`. Fails without switching if `this` is not `Inited`, or if
    /// `this` is already active (currently running, or suspended as an ancestor somewhere in the
    /// chain that resumed into the coroutine now running on this thread) — not a valid resume
    /// target until it returns to idle, reported as [`Error::NotInited`].
    ///
    /// Sets `this.parent` to the caller (read from the thread-local current-coroutine slot),
    /// makes `this` current, and performs the context swap. Returns whatever the target passes
    /// back via `yield_now` or by returning from its entry.
    pub fn resume(this: &mut Coroutine, sndval: isize) -> Result<isize> {
        match this.status.get() {
            Status::Exited => return Err(Error::Exited),
            Status::Inited => {}
        }
        if this.running.get() {
            return Err(Error::NotInited);
        }

        // Never null: defaults to this thread's root sentinel (§3 "Thread-coroutine") the first
        // time anything is resumed directly from the OS thread, giving `yield_now` a real context
        // slot to swap back into.
        let caller = CURRENT.with(|c| c.get());
        this.parent.set(caller);
        let this_ptr = this as *mut Coroutine;
        CURRENT.with(|c| c.set(this_ptr));
        this.running.set(true);

        log::trace!("resume: {:p} -> {:p} (sndval={})", caller, this_ptr, sndval);

        let new_ctx = this.ctx.get();
        // Write the caller's outgoing stack pointer straight into its own `ctx` cell — not into
        // a local that only gets copied back after `Context::swap` returns. The store happens
        // inside the swap itself, before the stack pointer is switched, so by the time anything
        // reads `(*caller).ctx` (a `yield_now` inside `this`, or a later `resume` of `caller`)
        // the write has already landed; copying a local back afterward is one step too late,
        // since control doesn't return here until `this` suspends or exits.
        let caller_ctx_slot = unsafe { &mut *(*caller).ctx.as_ptr() };
        let rcv = unsafe { Context::swap(&new_ctx, caller_ctx_slot, sndval as usize) };

        CURRENT.with(|c| c.set(caller));
        this.running.set(false);

        Ok(rcv as isize)
    }

    /// Suspend the currently running coroutine, sending `sndval` back to whoever resumed it.
    /// Returns the `sndval` of the next `resume` into this coroutine.
    ///
    /// # Panics
    /// If called when no coroutine is current (i.e. directly on the root OS thread).
    pub fn yield_now(sndval: isize) -> isize {
        let current = CURRENT.with(|c| c.get());
        let current_ref = unsafe { &*current };
        assert!(!current_ref.is_thread_root(), "yield_now called outside a coroutine");

        let parent = current_ref.parent.get();
        assert!(!parent.is_null(), "yield_now called with no parent to return to");

        log::trace!("yield: {:p} -> {:p} (sndval={})", current, parent, sndval);

        CURRENT.with(|c| c.set(parent));
        let parent_ctx = unsafe { (*parent).ctx.get() };
        // As in `resume`: the outgoing stack pointer is written straight into `current`'s own
        // `ctx` cell by the swap, not into a local copied back too late.
        let current_ctx_slot = unsafe { &mut *(*current).ctx.as_ptr() };
        let rcv = unsafe { Context::swap(&parent_ctx, current_ctx_slot, sndval as usize) };
        CURRENT.with(|c| c.set(current));

        rcv as isize
    }

    /// The coroutine currently running on this OS thread, if any. `None` both when nothing is
    /// current (unreachable once `CURRENT` defaults to the thread-root sentinel, kept as a
    /// defensive check) and when the thread-root sentinel itself is current, i.e. execution is on
    /// the OS thread directly rather than inside a real coroutine.
    pub fn current() -> Option<*mut Coroutine> {
        let ptr = CURRENT.with(|c| c.get());
        if ptr.is_null() {
            return None;
        }
        if unsafe { (*ptr).is_thread_root() } {
            None
        } else {
            Some(ptr)
        }
    }
}

thread_local! {
    /// The per-thread root sentinel (§3 "Thread-coroutine"): owns no stack, represents the OS
    /// thread's own native stack as the ultimate parent of every resume chain on this thread.
    static ROOT: Box<Coroutine> = Coroutine::new_root();

    /// The coroutine currently running on this OS thread — the root sentinel when execution is on
    /// the OS thread itself rather than inside a real coroutine. Doubles as the thread-local
    /// "active runtime" pointer the guard-page fault handler consults (see `fault.rs`) — reading
    /// it is a single pointer load, async-signal-safe, with no lazy initialization on the signal
    /// path because this cell has already been populated by the time any coroutine exists.
    pub(crate) static CURRENT: Cell<*mut Coroutine> =
        Cell::new(ROOT.with(|r| r.as_ref() as *const Coroutine as *mut Coroutine));
}

/// Entered via `ret`/`bl` from the architecture-specific trampoline once a coroutine's first
/// `resume` lands. `coro_ptr` is the address of the `Coroutine` baked in at `create` time;
/// `first_val` is the `sndval` of that first resume.
///
/// Never returns: after the entry closure completes, the coroutine is marked `Exited` and yields
/// one last time — as a coroutine that will never be resumed again, rejected by any further
/// `resume` at the status check above.
#[no_mangle]
pub(crate) extern "C" fn bootstrap_trampoline(coro_ptr: usize, first_val: usize) -> ! {
    let coro = unsafe { &*(coro_ptr as *const Coroutine) };
    let entry = coro.entry.take().expect("entry already consumed");

    let result = entry(first_val as isize);

    coro.status.set(Status::Exited);
    log::trace!("coroutine {:p} exited with {}", coro_ptr as *const Coroutine, result);

    // Swap back to the parent forever; any further resume is rejected before it ever reaches
    // this stack again, so this loop never actually iterates more than once — but a loop (not a
    // single swap) documents that falling off the bottom here is not an option. The trampoline
    // must never return past this point, per the synthesized-context contract in `context/mod.rs`.
    loop {
        let parent = unsafe { (*coro).parent.get() };
        CURRENT.with(|c| c.set(parent));
        let parent_ctx = unsafe { (*parent).ctx.get() };
        let mut discard = Context(0);
        unsafe {
            Context::swap(&parent_ctx, &mut discard, result as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_coroutine_swap_matches_scenario_1() {
        // Create a coroutine whose body yields 42 once and then returns 7.
        let mut coro = Coroutine::create(64 * 1024, 256, |_first| {
            let rcv = Coroutine::yield_now(42);
            assert_eq!(rcv, 2);
            7
        })
        .expect("create");

        let rcv = Coroutine::resume(&mut coro, 1).expect("first resume");
        assert_eq!(rcv, 42);
        assert_eq!(coro.status(), Status::Inited);

        let rcv = Coroutine::resume(&mut coro, 2).expect("second resume");
        assert_eq!(rcv, 7);
        assert_eq!(coro.status(), Status::Exited);

        match Coroutine::resume(&mut coro, 3) {
            Err(Error::Exited) => {}
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[test]
    fn nested_resume_is_strictly_lifo() {
        let mut order: Vec<&'static str> = Vec::new();
        let order_ptr = &mut order as *mut Vec<&'static str> as usize;

        let mut outer = Coroutine::create(64 * 1024, 256, move |_| {
            unsafe { (*(order_ptr as *mut Vec<&'static str>)).push("outer-start") };
            let mut inner = Coroutine::create(64 * 1024, 256, move |_| {
                unsafe { (*(order_ptr as *mut Vec<&'static str>)).push("inner-run") };
                0
            })
            .expect("create inner");
            Coroutine::resume(&mut inner, 0).expect("resume inner");
            unsafe { (*(order_ptr as *mut Vec<&'static str>)).push("outer-end") };
            0
        })
        .expect("create outer");

        Coroutine::resume(&mut outer, 0).expect("resume outer");
        assert_eq!(order, vec!["outer-start", "inner-run", "outer-end"]);
    }

    #[test]
    fn resuming_a_suspended_ancestor_is_rejected_as_not_inited() {
        // `outer` resumes `inner`; while `outer` is suspended mid-stack (still `running`, not
        // idle), `inner` tries to resume `outer` back. That must fail with `NotInited` rather
        // than re-entering `outer`'s stack frame out from under it.
        let outer_ptr_cell: Cell<*mut Coroutine> = Cell::new(std::ptr::null_mut());
        let cell_addr = &outer_ptr_cell as *const Cell<*mut Coroutine> as usize;

        let mut outer = Coroutine::create(64 * 1024, 256, move |_| {
            let mut inner = Coroutine::create(64 * 1024, 256, move |_| {
                let outer_ptr = unsafe { (*(cell_addr as *const Cell<*mut Coroutine>)).get() };
                let outer_ref = unsafe { &mut *outer_ptr };
                match Coroutine::resume(outer_ref, 0) {
                    Err(Error::NotInited) => 1,
                    other => panic!("expected NotInited, got {other:?}"),
                }
            })
            .expect("create inner");
            Coroutine::resume(&mut inner, 0).expect("resume inner")
        })
        .expect("create outer");
        outer_ptr_cell.set(outer.as_mut() as *mut Coroutine);

        let rcv = Coroutine::resume(&mut outer, 0).expect("resume outer");
        assert_eq!(rcv, 1);
    }

    #[test]
    fn zero_stack_size_rounds_to_one_page() {
        let coro = Coroutine::create(0, 64, |_| 0).expect("create");
        assert_eq!(coro.stack_size(), crate::stack::page_size());
    }

    #[test]
    fn current_is_none_on_the_os_thread_and_some_inside_the_coroutine() {
        assert!(Coroutine::current().is_none());

        let seen_current_inside = std::rc::Rc::new(Cell::new(false));
        let flag = seen_current_inside.clone();
        let mut coro = Coroutine::create(64 * 1024, 256, move |_| {
            flag.set(Coroutine::current().is_some());
            0
        })
        .expect("create");
        Coroutine::resume(&mut coro, 0).expect("resume");

        assert!(seen_current_inside.get());
        assert!(Coroutine::current().is_none());
    }

    #[test]
    fn yield_now_from_a_coroutine_resumed_directly_off_the_os_thread_returns_to_the_caller() {
        // Regression test: resuming straight from the OS thread (no enclosing coroutine) used to
        // leave `parent` null, so `yield_now` inside would dereference a null pointer. The
        // thread-root sentinel (§3 "Thread-coroutine") gives it a real context to swap back into.
        let mut coro = Coroutine::create(64 * 1024, 256, |first| {
            assert_eq!(first, 10);
            let back = Coroutine::yield_now(20);
            assert_eq!(back, 30);
            40
        })
        .expect("create");

        assert_eq!(Coroutine::resume(&mut coro, 10).expect("first resume"), 20);
        assert_eq!(Coroutine::resume(&mut coro, 30).expect("second resume"), 40);
    }

    #[test]
    fn growing_to_within_one_page_of_the_guard_flags_near_limit() {
        let coro = Coroutine::create(8 * crate::stack::page_size(), 64, |_| 0).expect("create");
        assert!(!coro.near_limit.get());

        let target = coro.stack_area() + crate::stack::page_size();
        unsafe { coro.grow_stack(target).expect("grow") };
        assert!(coro.near_limit.get());
    }
}
