// x86_64 SysV ABI context switch.
//
// rt_swap_context(new_sp: usize /*rdi*/, old_sp_out: *mut usize /*rsi*/, value: usize /*rdx*/)
//   -> usize /*rax*/
//
// Saves the six callee-preserved general-purpose registers, swaps rsp, restores them on the new
// stack, and hands `value` back in rax right before `ret` — so the call this resumes into
// receives it as this function's return value.

use std::arch::global_asm;

global_asm!(
    r#"
.text
.globl rt_swap_context
.p2align 4
rt_swap_context:
    push rbx
    push rbp
    push r12
    push r13
    push r14
    push r15

    mov [rsi], rsp
    mov rsp, rdi

    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx

    mov rax, rdx
    ret
"#
);

extern "C" {
    pub fn rt_swap_context(new_sp: usize, old_sp_out: *mut usize, value: usize) -> usize;
}

// The naked trampoline landed on by the first `ret` out of a freshly synthesized frame. rax
// still holds the value the first `resume` passed (set by `mov rax, rdx; ret` above); r15 holds
// the coroutine pointer baked in at creation. Both are forwarded into the Rust-side bootstrap.
global_asm!(
    r#"
.text
.globl rt_trampoline
.p2align 4
rt_trampoline:
    mov rsi, rax
    mov rdi, r15
    call {bootstrap}
    ud2
"#,
    bootstrap = sym super::super::coroutine::bootstrap_trampoline,
);

extern "C" {
    fn rt_trampoline();
}

/// Build the initial stack frame so that the first `rt_swap_context` into this stack ends up
/// inside `rt_trampoline` with `arg` recoverable from r15.
///
/// Layout (low to high address, matching pop order r15,r14,r13,r12,rbp,rbx then the return
/// address consumed by `ret`):
/// `[r15=arg][r14=0][r13=0][r12=0][rbp=0][rbx=0][retaddr=rt_trampoline]`
pub fn initialize_call_frame(upper: usize, arg: usize) -> usize {
    const WORDS: usize = 7;
    // 16-byte align the base, leaving room for the synthesized frame below it.
    let base = upper & !0xf;
    let sp = base - WORDS * 8;
    unsafe {
        let slots = sp as *mut usize;
        slots.add(0).write(arg); // r15
        slots.add(1).write(0); // r14
        slots.add(2).write(0); // r13
        slots.add(3).write(0); // r12
        slots.add(4).write(0); // rbp
        slots.add(5).write(0); // rbx
        slots.add(6).write(rt_trampoline as usize); // return address
    }
    sp
}
