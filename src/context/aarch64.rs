// AArch64 AAPCS64 context switch.
//
// rt_swap_context(new_sp: usize /*x0*/, old_sp_out: *mut usize /*x1*/, value: usize /*x2*/)
//   -> usize /*x0*/
//
// Saves the callee-preserved integer registers (x19-x28, fp/x29, lr/x30) and the callee-preserved
// floating point registers (d8-d15) at fixed offsets below sp, swaps sp, restores them on the new
// stack, and hands `value` back in x0 right before `ret`.
//
// FRAME_BYTES = 20 * 8 = 160, offsets below assigned low to high:
// 0:x19 8:x20 16:x21 24:x22 32:x23 40:x24 48:x25 56:x26 64:x27 72:x28
// 80:x29 88:x30 96:d8 104:d9 112:d10 120:d11 128:d12 136:d13 144:d14 152:d15

use std::arch::global_asm;

global_asm!(
    r#"
.text
.globl rt_swap_context
.p2align 4
rt_swap_context:
    sub sp, sp, #160
    str x19, [sp, #0]
    str x20, [sp, #8]
    str x21, [sp, #16]
    str x22, [sp, #24]
    str x23, [sp, #32]
    str x24, [sp, #40]
    str x25, [sp, #48]
    str x26, [sp, #56]
    str x27, [sp, #64]
    str x28, [sp, #72]
    str x29, [sp, #80]
    str x30, [sp, #88]
    str d8,  [sp, #96]
    str d9,  [sp, #104]
    str d10, [sp, #112]
    str d11, [sp, #120]
    str d12, [sp, #128]
    str d13, [sp, #136]
    str d14, [sp, #144]
    str d15, [sp, #152]

    mov x9, sp
    str x9, [x1]
    mov sp, x0

    ldr x19, [sp, #0]
    ldr x20, [sp, #8]
    ldr x21, [sp, #16]
    ldr x22, [sp, #24]
    ldr x23, [sp, #32]
    ldr x24, [sp, #40]
    ldr x25, [sp, #48]
    ldr x26, [sp, #56]
    ldr x27, [sp, #64]
    ldr x28, [sp, #72]
    ldr x29, [sp, #80]
    ldr x30, [sp, #88]
    ldr d8,  [sp, #96]
    ldr d9,  [sp, #104]
    ldr d10, [sp, #112]
    ldr d11, [sp, #120]
    ldr d12, [sp, #128]
    ldr d13, [sp, #136]
    ldr d14, [sp, #144]
    ldr d15, [sp, #152]
    add sp, sp, #160

    mov x0, x2
    ret
"#
);

extern "C" {
    pub fn rt_swap_context(new_sp: usize, old_sp_out: *mut usize, value: usize) -> usize;
}

// Landed on via `ret` (x30) out of a freshly synthesized frame. x0 still holds the value the
// first `resume` passed; x19 holds the coroutine pointer baked in at creation. Both are
// forwarded into the Rust-side bootstrap.
global_asm!(
    r#"
.text
.globl rt_trampoline
.p2align 4
rt_trampoline:
    mov x1, x0
    mov x0, x19
    bl {bootstrap}
    brk #1
"#,
    bootstrap = sym super::super::coroutine::bootstrap_trampoline,
);

extern "C" {
    fn rt_trampoline();
}

const FRAME_BYTES: usize = 160;

/// Build the initial stack frame so the first `rt_swap_context` into this stack ends up inside
/// `rt_trampoline` with `arg` recoverable from x19, and `lr` (x30) pointing at `rt_trampoline`.
pub fn initialize_call_frame(upper: usize, arg: usize) -> usize {
    let base = upper & !0xf;
    let sp = base - FRAME_BYTES;
    unsafe {
        let bytes = sp as *mut u8;
        let word_at = |offset: usize, value: usize| {
            (bytes.add(offset) as *mut usize).write(value);
        };
        word_at(0, arg); // x19
        for off in (8..80).step_by(8) {
            word_at(off, 0); // x20..x28
        }
        word_at(80, 0); // x29 (fp)
        word_at(88, rt_trampoline as usize); // x30 (lr)
        for off in (96..160).step_by(8) {
            word_at(off, 0); // d8..d15
        }
    }
    sp
}
