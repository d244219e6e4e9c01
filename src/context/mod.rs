//! The symmetric context-switch primitive and the bootstrap trampoline for freshly created
//! coroutines.
//!
//! `swap` is implemented in `global_asm!` per target architecture (see `x86_64.rs`/`aarch64.rs`)
//! rather than compiled from an external `.S` file — no build-time assembler invocation is
//! needed. Only callee-preserved registers are saved; this is a cooperative switch, not a signal
//! or full-register-state save.

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod arch;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod arch;

/// An opaque saved stack pointer. Never dereferenced directly by safe code; only ever round-
/// tripped through [`swap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context(pub usize);

impl Context {
    /// Synthesize the initial context for a coroutine whose stack spans up to `upper`, such that
    /// resuming it for the first time invokes [`crate::coroutine::bootstrap_trampoline`] with
    /// `arg` recoverable from the architecture's designated callee-saved register.
    ///
    /// `upper` must be the coroutine's `Stack::upper()` (the address just below the control-block
    /// header).
    pub fn new(upper: usize, arg: usize) -> Context {
        Context(arch::initialize_call_frame(upper, arg))
    }

    /// Symmetric context switch: save the caller's callee-preserved registers, record the
    /// resulting stack pointer into `out_old_sp` (playing the role of `old_sp`), load `new_sp`'s
    /// registers, and return the `value` that counterpart last passed when swapping into us.
    ///
    /// # Safety
    /// `new_sp` must be a context previously produced by [`Context::new`] or saved by a prior
    /// `swap` into a live, still-reserved stack.
    pub unsafe fn swap(new_sp: &Context, out_old_sp: &mut Context, value: usize) -> usize {
        arch::rt_swap_context(new_sp.0, &mut out_old_sp.0, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_has_distinct_nonzero_stack_pointer() {
        let stack = crate::stack::Stack::new(64 * 1024, 256).expect("stack alloc");
        let ctx = Context::new(stack.upper(), 0);
        assert_ne!(ctx.0, 0);
        assert!(ctx.0 < stack.upper());
        assert!(ctx.0 >= stack.area());
    }

    #[test]
    fn synthesized_pointer_is_word_aligned() {
        let stack = crate::stack::Stack::new(64 * 1024, 256).expect("stack alloc");
        let ctx = Context::new(stack.upper(), 0);
        assert_eq!(ctx.0 % std::mem::size_of::<usize>(), 0);
    }
}
