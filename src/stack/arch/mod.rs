/*
 * Context-Switch Primitives
 *
 * Per-architecture trampolines implementing the switch contract:
 * `switch(curr, post_fn, &mut curr_sp, next_sp)` saves the callee-saved
 * register set and floating-point control state on the current stack,
 * publishes the resulting stack pointer through `curr_sp`, adopts
 * `next_sp`, and calls `post_fn(curr)` on the incoming stack before the
 * incoming context resumes.
 *
 * `init` lays out a synthetic frame so the first switch into a fresh stack
 * falls through the restore path into a bootstrap shim, which loads
 * `(entry, a1, a2, a3)` from the callee-saved slots and calls the entry.
 */

use cfg_if::cfg_if;

use super::{EntryFn, PostFn};

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        use x86_64 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        use aarch64 as imp;
    } else {
        compile_error!("strand supports x86_64 and aarch64 only");
    }
}

/// Prepare a frame on a fresh stack; returns the stack pointer to switch to.
///
/// # Safety
///
/// `top` must be the 16-byte-aligned top of a writable stack with room for
/// the frame; `entry` must never return.
pub(crate) unsafe fn init(top: usize, entry: EntryFn, a1: usize, a2: usize, a3: usize) -> usize {
    unsafe { imp::init(top, entry, a1, a2, a3) }
}

/// Save the current context into `*curr_sp`, adopt `next_sp`, then invoke
/// `post(curr)` on the adopted stack. Returns when some context later
/// switches back to the saved stack pointer.
///
/// # Safety
///
/// `next_sp` must be a stack pointer produced by `init` or a previous
/// `switch` of a context that is not currently running.
pub(crate) unsafe fn switch(curr: *mut (), post: PostFn, curr_sp: *mut usize, next_sp: usize) {
    unsafe { imp::strand_stack_switch(curr, post, curr_sp, next_sp) }
}

/// Abandon the current context and enter `func(a1, a2, a3)` on the stack
/// whose top is `sp`.
///
/// # Safety
///
/// The current context is lost; only used to bootstrap a worker's idle
/// loop onto a fresh stack.
pub(crate) unsafe fn direct(sp: usize, func: EntryFn, a1: usize, a2: usize, a3: usize) -> ! {
    unsafe { imp::strand_stack_direct(sp, func, a1, a2, a3) }
}
