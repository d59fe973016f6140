//! Raw `ucontext_t` plumbing.
//!
//! `makecontext` only accepts `int` arguments, so a pointer-sized payload is
//! split into two 32-bit halves and rejoined inside the trampoline — the
//! classic trick used by ucontext-based coroutine implementations, since
//! Rust's `extern "C" fn` trampoline has no closure environment to capture
//! state in directly.

use crate::stack::Stack;

pub struct Context(libc::ucontext_t);

impl Context {
    pub fn new() -> Self {
        let ctx: libc::ucontext_t = unsafe { std::mem::zeroed() };
        Context(ctx)
    }

    /// Prepare this context to start running `func(split(data))` on `stack`
    /// the next time it is swapped into.
    pub fn makecontext(
        &mut self,
        stack: &Stack,
        func: unsafe extern "C" fn(u32, u32) -> !,
        data: *const (),
    ) {
        unsafe {
            let rc = libc::getcontext(&mut self.0);
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                log::error!("getcontext failed: {err}");
                panic!("getcontext failed: {err}");
            }
        }
        self.0.uc_stack.ss_sp = stack.base().cast();
        self.0.uc_stack.ss_size = stack.size();
        self.0.uc_link = std::ptr::null_mut();

        let (hi, lo) = split_usize(data as usize);
        unsafe {
            let entry: extern "C" fn() = std::mem::transmute(func as usize);
            libc::makecontext(&mut self.0, entry, 2, hi, lo);
        }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::ucontext_t {
        &mut self.0
    }
}

/// Swap the running context from `from` to `to`. Does not return until
/// `from` is swapped back into by someone else.
pub unsafe fn swap(from: &std::cell::UnsafeCell<Context>, to: &std::cell::UnsafeCell<Context>) {
    let from_ptr = (*from.get()).as_mut_ptr();
    let to_ptr = (*to.get()).as_mut_ptr();
    libc::swapcontext(from_ptr, to_ptr);
}

/// Like `swap`, but used from the trampoline on fiber exit: the exiting
/// context is never swapped back into, so there is no meaningful `from`
/// to preserve beyond satisfying `swapcontext`'s signature.
pub unsafe fn swap_out_only(
    from: &std::cell::UnsafeCell<Context>,
    to: &std::cell::UnsafeCell<Context>,
) {
    swap(from, to)
}

pub fn split_usize(value: usize) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

pub fn join_usize(hi: u32, lo: u32) -> usize {
    ((hi as usize) << 32) | (lo as usize)
}
