//! aarch64 context switching
//!
//! TODO: implement for ARM64 (x19-x28, fp, lr, sp, d8-d15)

use super::SavedContext;

/// Prepare a fresh fiber context.
pub unsafe fn init_context(
    _ctx: *mut SavedContext,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Voluntary context switch.
pub unsafe extern "C" fn context_switch(
    _save: *mut SavedContext,
    _load: *const SavedContext,
    _save_done: *mut u8,
) {
    todo!("aarch64 context_switch not yet implemented")
}
