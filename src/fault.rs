//! The guard-page fault handler (§4.B): `SIGSEGV`/`SIGBUS` on an alternate signal stack, growing
//! the faulting coroutine's stack on demand or chaining to whatever disposition preceded ours.
//!
//! Grounded on `original_source/fiber.c`'s `ef_fiber_sigsegv_handler`/`ef_fiber_expand_stack`/
//! `ef_fiber_init_sched` for the accept/reject address-range test and the
//! `sigaltstack`+`sigaction(SA_SIGINFO|SA_ONSTACK)` sequence. Nothing here allocates; the handler
//! only reads a thread-local pointer, does address arithmetic, calls `mprotect`, and either
//! returns or raises a signal — all async-signal-safe per §7.

use std::cell::Cell;
use std::ptr;
use std::sync::OnceLock;
use std::sync::Once;

use crate::coroutine::{Coroutine, CURRENT};
use crate::stack::{guard, page_size};

const ALTSTACK_SIZE: usize = 64 * 1024;

struct RawSigaction(libc::sigaction);
// `sigaction` is plain data (a function pointer plus flags/mask); it's written once by `install`
// before any other thread can observe it and never mutated afterward.
unsafe impl Sync for RawSigaction {}

static PREV_SEGV: OnceLock<RawSigaction> = OnceLock::new();
static PREV_BUS: OnceLock<RawSigaction> = OnceLock::new();
static INSTALL: Once = Once::new();

thread_local! {
    static ALTSTACK_DONE: Cell<bool> = Cell::new(false);
}

/// Install the process-wide `SIGSEGV`/`SIGBUS` handler (idempotent — only the first call takes
/// effect) and this thread's alternate signal stack (idempotent per-thread).
///
/// Must be called before any coroutine on this thread can fault, i.e. from [`crate::runtime::Runtime::new`].
pub fn install() {
    INSTALL.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_fault as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut sa.sa_mask);

        let mut prev_segv: libc::sigaction = std::mem::zeroed();
        libc::sigaction(libc::SIGSEGV, &sa, &mut prev_segv);
        let _ = PREV_SEGV.set(RawSigaction(prev_segv));

        let mut prev_bus: libc::sigaction = std::mem::zeroed();
        libc::sigaction(libc::SIGBUS, &sa, &mut prev_bus);
        let _ = PREV_BUS.set(RawSigaction(prev_bus));
    });

    ensure_altstack();
}

fn ensure_altstack() {
    ALTSTACK_DONE.with(|done| {
        if done.get() {
            return;
        }
        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                ALTSTACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if base != libc::MAP_FAILED {
                let ss = libc::stack_t {
                    ss_sp: base,
                    ss_flags: 0,
                    ss_size: ALTSTACK_SIZE,
                };
                // Leaked intentionally: lives for the thread's remaining lifetime, exactly like
                // the thread-local `CURRENT` pointer it sits alongside.
                libc::sigaltstack(&ss, ptr::null_mut());
            }
        }
        done.set(true);
    });
}

extern "C" fn handle_fault(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let addr = unsafe { (*info).si_addr() } as usize;

    let coro_ptr = CURRENT.with(|c| c.get());
    if !coro_ptr.is_null() {
        let coro = unsafe { &*coro_ptr };
        // The thread-root sentinel owns no reserved stack region — a fault while it's current is
        // a genuine fault on the OS thread's native stack, not a guard-page growth.
        if !coro.is_thread_root() {
            let decision = guard::decide(
                coro.stack_area(),
                page_size(),
                coro.stack_lower(),
                addr,
            );
            if let Some(new_lower) = decision {
                let grew = unsafe { coro.grow_stack(new_lower) };
                if grew.is_ok() {
                    return;
                }
            }
        }
    }

    chain_or_abort(sig, info, ctx);
}

/// Fault wasn't a valid guard-page growth: run whatever handler preceded ours (a different
/// memory sanitizer, typically), or raise `SIGABRT` so the process core-dumps if there wasn't
/// one installed.
fn chain_or_abort(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let prev = match sig {
        libc::SIGSEGV => PREV_SEGV.get(),
        libc::SIGBUS => PREV_BUS.get(),
        _ => None,
    };

    if let Some(RawSigaction(sa)) = prev {
        let handler = sa.sa_sigaction;
        if handler != libc::SIG_DFL && handler != libc::SIG_IGN {
            if sa.sa_flags & libc::SA_SIGINFO != 0 {
                let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    unsafe { std::mem::transmute(handler) };
                f(sig, info, ctx);
                return;
            }
            let f: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(handler) };
            f(sig);
            return;
        }
    }

    unsafe {
        libc::raise(libc::SIGABRT);
    }
}
