//! x86_64 context switching
//!
//! Inline assembly, System V AMD64 ABI. Callee-saved set: rbx, rbp, r12-r15.

use super::SavedContext;
use std::arch::naked_asm;

/// Prepare a fresh fiber context.
///
/// When first switched to, execution starts in the entry trampoline with
/// `entry_fn` in r12 and `entry_arg` in r13. `entry_fn` must never return.
///
/// # Safety
///
/// `ctx` must point to writable [`SavedContext`] memory and `stack_top`
/// to the high end of a mapped stack.
pub unsafe fn init_context(ctx: *mut SavedContext, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    // The trampoline is entered by `jmp` with rsp 16-aligned; its `call`
    // then gives the entry function the ABI-required entry alignment.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.ip = entry_trampoline as usize as u64;
    ctx.sp = sp as u64;
    ctx.callee = [0; 6];
    ctx.callee[2] = entry_fn as u64; // r12
    ctx.callee[3] = entry_arg as u64; // r13
}

/// First-run springboard: moves the entry argument into place and calls the
/// entry function. The entry function terminates the fiber itself, so
/// falling through is a hard fault.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}

/// Voluntary context switch.
///
/// Saves the current register state into `save`, publishes the completed
/// save by storing 0 through `save_done`, then restores `load` and jumps.
/// Another thread must not resume from `save` until `*save_done` reads 0.
///
/// # Safety
///
/// Both contexts must be valid; `load` must have been produced by
/// [`init_context`] or a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
    _save: *mut SavedContext,
    _load: *const SavedContext,
    _save_done: *mut u8,
) {
    naked_asm!(
        // Save: ip, sp, then callee-saved in SavedContext order.
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x00], rax",
        "mov [rdi + 0x08], rsp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // The saved context is now complete and may be resumed elsewhere.
        "mov byte ptr [rdx], 0",
        // Load the target context.
        "mov rax, [rsi + 0x00]",
        "mov rsp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context.
        "2:",
        "ret",
    );
}
