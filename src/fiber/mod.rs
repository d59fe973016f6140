//! Stackful coroutine engine.
//!
//! Every fiber owns a `ucontext_t` and (except the per-thread anchor) a
//! stack handed out by [`crate::stack::StackAllocator`]. Switching fibers
//! is a plain `swapcontext`. Every fiber remembers who resumed it
//! (`resumer`) and yields back to that fiber specifically, rather than
//! always to a fixed per-thread anchor — a use-caller scheduler root fiber
//! is then just an ordinary fiber whose first resumer happens to be the
//! thread that called `start()`, with no separate code path needed.

mod context;
pub mod cond;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::stack::{Stack, StackAllocator};

pub use cond::Cond;

pub type FiberId = u64;
type CallBack = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Hold,
    Ready,
    Exec,
    Term,
    Except,
}

static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct FiberInner {
    id: FiberId,
    state: Cell<State>,
    ctx: UnsafeCell<context::Context>,
    stack: RefCell<Option<Stack>>,
    cb: RefCell<Option<CallBack>>,
    /// Who last resumed this fiber; yielding swaps back into them.
    resumer: Cell<*const FiberInner>,
    is_anchor: bool,
}

// A `FiberInner` is only ever touched by whichever single OS thread is
// currently resuming, running, or holding it; the scheduler's task-list
// mutex is what makes handing one to a different worker thread safe. The
// interior `Cell`/`RefCell`/`UnsafeCell` fields are therefore never
// accessed concurrently despite not being `Sync` on their own.
unsafe impl Send for FiberInner {}
unsafe impl Sync for FiberInner {}

/// A handle to a stackful fiber. Cloning shares the same underlying fiber
/// (`Arc`); the fiber is destroyed once the last handle is dropped.
#[derive(Clone)]
pub struct Fiber(Arc<FiberInner>);

thread_local! {
    static CURRENT: Cell<*const FiberInner> = Cell::new(std::ptr::null());
    static ANCHOR: Fiber = Fiber::new_anchor();
}

impl Fiber {
    /// Create a new fiber with its own stack, in `State::Init`.
    pub fn spawn<F>(allocator: &StackAllocator, cb: F) -> crate::error::Result<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = allocator.alloc()?;
        let inner = Arc::new(FiberInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Cell::new(State::Init),
            ctx: UnsafeCell::new(context::Context::new()),
            stack: RefCell::new(None),
            cb: RefCell::new(Some(Box::new(cb))),
            resumer: Cell::new(std::ptr::null()),
            is_anchor: false,
        });
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        let fiber = Fiber(inner);
        fiber.make_context(stack);
        Ok(fiber)
    }

    fn new_anchor() -> Fiber {
        let inner = Arc::new(FiberInner {
            id: 0,
            state: Cell::new(State::Exec),
            ctx: UnsafeCell::new(context::Context::new()),
            stack: RefCell::new(None),
            cb: RefCell::new(None),
            resumer: Cell::new(std::ptr::null()),
            is_anchor: true,
        });
        CURRENT.with(|c| c.set(Arc::as_ptr(&inner)));
        Fiber(inner)
    }

    fn make_context(&self, stack: Stack) {
        let ptr = Arc::as_ptr(&self.0) as *const ();
        unsafe { (*self.0.ctx.get()).makecontext(&stack, trampoline, ptr) };
        *self.0.stack.borrow_mut() = Some(stack);
    }

    /// Re-arm a `Term`/`Init` fiber with a new body, reusing its stack.
    pub fn reset<F>(&self, cb: F) -> crate::error::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.0.state.get() {
            State::Term | State::Init => {}
            other => {
                return Err(crate::error::Error::contract_violation(format!(
                    "cannot reset fiber {} in state {other:?}",
                    self.0.id
                )))
            }
        }
        *self.0.cb.borrow_mut() = Some(Box::new(cb));
        let stack = self
            .0
            .stack
            .borrow_mut()
            .take()
            .expect("non-anchor fiber always has a stack");
        let ptr = Arc::as_ptr(&self.0) as *const ();
        unsafe { (*self.0.ctx.get()).makecontext(&stack, trampoline, ptr) };
        *self.0.stack.borrow_mut() = Some(stack);
        self.0.state.set(State::Init);
        Ok(())
    }

    pub fn id(&self) -> FiberId {
        self.0.id
    }

    pub fn state(&self) -> State {
        self.0.state.get()
    }

    /// Resume this fiber, blocking the caller until it yields or finishes.
    pub fn resume(&self) {
        let state = self.0.state.get();
        if !matches!(state, State::Init | State::Ready | State::Hold) {
            log::error!("attempted to resume fiber {} in state {state:?}", self.0.id);
            panic!("attempted to resume fiber {} in state {state:?}", self.0.id);
        }

        let resumer_ptr = CURRENT.with(|c| c.get());
        self.0.resumer.set(resumer_ptr);

        let self_ptr = Arc::as_ptr(&self.0);
        CURRENT.with(|c| c.set(self_ptr));

        unsafe {
            let resumer = &*resumer_ptr;
            resumer.state.set(State::Hold);
            self.0.state.set(State::Exec);
            context::swap(&resumer.ctx, &self.0.ctx);
        }
    }

    fn yield_to(new_state: State) {
        let current_ptr = CURRENT.with(|c| c.get());
        assert!(!current_ptr.is_null(), "no fiber is currently executing");
        let current = unsafe { &*current_ptr };
        if current.is_anchor {
            log::error!("attempted to yield the anchor fiber");
            panic!("attempted to yield the anchor fiber");
        }
        current.state.set(new_state);

        let resumer_ptr = current.resumer.get();
        CURRENT.with(|c| c.set(resumer_ptr));

        unsafe {
            let resumer = &*resumer_ptr;
            resumer.state.set(State::Exec);
            context::swap(&current.ctx, &resumer.ctx);
        }
    }
}

impl Drop for FiberInner {
    fn drop(&mut self) {
        if !self.is_anchor {
            match self.state.get() {
                State::Exec | State::Hold | State::Ready => {
                    log::error!(
                        "fiber {} dropped while in state {:?}; this is a contract violation",
                        self.id,
                        self.state.get()
                    );
                    std::process::abort();
                }
                State::Init | State::Term | State::Except => {}
            }
            TOTAL_FIBERS.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// The fiber currently executing on this OS thread, or the per-thread
/// anchor if no user fiber is running.
pub fn current() -> Fiber {
    let ptr = CURRENT.with(|c| c.get());
    if ptr.is_null() {
        return ANCHOR.with(|a| a.clone());
    }
    let rc = unsafe { Arc::from_raw(ptr) };
    let cloned = Fiber(Arc::clone(&rc));
    std::mem::forget(rc);
    cloned
}

pub fn current_id() -> FiberId {
    let ptr = CURRENT.with(|c| c.get());
    if ptr.is_null() {
        0
    } else {
        unsafe { (*ptr).id }
    }
}

pub fn total_fibers() -> u64 {
    TOTAL_FIBERS.load(Ordering::Relaxed)
}

/// Yield with `State::Ready`: the scheduler should re-queue this fiber for
/// another turn as soon as possible.
pub fn yield_to_ready() {
    Fiber::yield_to(State::Ready);
}

/// Yield with `State::Hold`: the fiber is parked and must be explicitly
/// woken (by the reactor or a condition variable) before it runs again.
pub fn yield_to_hold() {
    Fiber::yield_to(State::Hold);
}

unsafe extern "C" fn trampoline(hi: u32, lo: u32) -> ! {
    let ptr = context::join_usize(hi, lo) as *const FiberInner;
    let fiber = &*ptr;

    let cb = fiber.cb.borrow_mut().take();
    let result = match cb {
        Some(cb) => std::panic::catch_unwind(AssertUnwindSafe(cb)),
        None => Ok(()),
    };

    match result {
        Ok(()) => fiber.state.set(State::Term),
        Err(payload) => {
            let msg = panic_message(&payload);
            log::error!("fiber {} terminated with an exception: {msg}", fiber.id);
            fiber.state.set(State::Except);
        }
    }

    let resumer_ptr = fiber.resumer.get();
    CURRENT.with(|c| c.set(resumer_ptr));
    let resumer = &*resumer_ptr;
    resumer.state.set(State::Exec);
    context::swap_out_only(&fiber.ctx, &resumer.ctx);

    log::error!("fiber {} resumed after termination; this should never happen", fiber.id);
    std::process::abort();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackAllocator;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn runs_to_completion_and_yields_control_back() {
        let alloc = StackAllocator::new(64 * 1024, 2).unwrap();
        let ran = Arc::new(StdMutex::new(false));
        let ran_in_fiber = ran.clone();
        let fiber = Fiber::spawn(&alloc, move || {
            *ran_in_fiber.lock().unwrap() = true;
        })
        .unwrap();

        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn cooperative_yield_resumes_where_it_left_off() {
        let alloc = StackAllocator::new(64 * 1024, 2).unwrap();
        let trace = Arc::new(StdMutex::new(Vec::new()));
        let trace_in_fiber = trace.clone();
        let fiber = Fiber::spawn(&alloc, move || {
            trace_in_fiber.lock().unwrap().push(1);
            yield_to_ready();
            trace_in_fiber.lock().unwrap().push(2);
        })
        .unwrap();

        fiber.resume();
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panicking_body_marks_except_without_propagating() {
        let alloc = StackAllocator::new(64 * 1024, 2).unwrap();
        let fiber = Fiber::spawn(&alloc, || {
            panic!("boom");
        })
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Except);
    }
}
