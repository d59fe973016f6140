//! M-on-N cooperative task scheduler.
//!
//! Dispatch hooks (`init`/`tickle`/`stopping`/`idle`) are modeled as a
//! `Hooks` trait object held by `Scheduler` rather than a subclassing
//! relationship — [`crate::reactor::IoManager`] implements `Hooks` and
//! wraps a `Scheduler` instead of extending it.
//!
//! The default `Hooks::stopping` is unconditional: a plain scheduler with
//! no reactor may stop exactly when asked to.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::fiber::{self, Fiber};
use crate::stack::StackAllocator;
use crate::sync::Mutex;
use crate::thread_handle::ThreadHandle;

const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Hooks a scheduler calls into at well-defined points of its dispatch
/// loop. [`crate::reactor::IoManager`] overrides all four.
pub trait Hooks: Send + Sync {
    fn init(&self) {
        log::debug!("scheduler worker starting");
    }

    fn tickle(&self, _has_idle_threads: bool) {
        log::trace!("tickle (no-op)");
    }

    /// Whether the scheduler may finish stopping, given that
    /// `stop_requested` is the scheduler's own stop flag. The base
    /// implementation is unconditional: it may stop exactly when asked
    /// to. A reactor overrides this to also wait out pending events and
    /// timers.
    fn stopping(&self, stop_requested: bool) -> bool {
        stop_requested
    }

    /// Runs when no runnable task is found. The default spins cooperatively
    /// until told to stop.
    fn idle(&self, should_stop: &dyn Fn() -> bool) {
        while !should_stop() {
            fiber::yield_to_hold();
        }
    }
}

struct NullHooks;
impl Hooks for NullHooks {}

struct Task {
    body: TaskBody,
    thread_id: Option<libc::pid_t>,
}

enum TaskBody {
    Fiber(Fiber),
    Callback(Box<dyn FnOnce() + Send>),
}

struct Shared {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stack_allocator: Arc<StackAllocator>,
    hooks: Box<dyn Hooks>,
    thread_ids: Mutex<Vec<libc::pid_t>>,
    use_caller: bool,
    root_thread_id: AtomicI32,
}

/// An M-on-N scheduler: `thread_count` OS threads (plus, optionally, the
/// calling thread itself) cooperatively run an unbounded stream of fibers
/// and callbacks.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<ThreadHandle>>,
    root_fiber: Mutex<Option<Fiber>>,
}

impl Scheduler {
    pub fn new(thread_count: usize, name: impl Into<String>, use_caller: bool) -> Result<Self> {
        Self::with_hooks(thread_count, name, use_caller, Box::new(NullHooks))
    }

    pub fn with_hooks(
        thread_count: usize,
        name: impl Into<String>,
        use_caller: bool,
        hooks: Box<dyn Hooks>,
    ) -> Result<Self> {
        let stack_allocator = Arc::new(StackAllocator::new(DEFAULT_STACK_SIZE, thread_count.max(1))?);
        let shared = Arc::new(Shared {
            name: name.into(),
            tasks: Mutex::new(VecDeque::new()),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stack_allocator,
            hooks,
            thread_ids: Mutex::new(Vec::new()),
            use_caller,
            root_thread_id: AtomicI32::new(-1),
        });

        let root_fiber = if use_caller {
            let shared_for_root = shared.clone();
            let fiber = Fiber::spawn(&shared.stack_allocator, move || {
                run_loop(shared_for_root);
            })?;
            Some(fiber)
        } else {
            None
        };

        Ok(Scheduler {
            shared,
            workers: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(root_fiber),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn stack_allocator(&self) -> &Arc<StackAllocator> {
        &self.shared.stack_allocator
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::Acquire)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.shared.idle_threads.load(Ordering::Acquire) > 0
    }

    pub fn schedule(&self, fiber: Fiber, thread_id: Option<libc::pid_t>) {
        self.schedule_task(Task {
            body: TaskBody::Fiber(fiber),
            thread_id,
        });
    }

    pub fn schedule_callback<F>(&self, cb: F, thread_id: Option<libc::pid_t>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task {
            body: TaskBody::Callback(Box::new(cb)),
            thread_id,
        });
    }

    fn schedule_task(&self, task: Task) {
        let need_tickle = {
            let mut tasks = self.shared.tasks.lock();
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.shared.hooks.tickle(self.has_idle_threads());
        }
    }

    /// Start `thread_count` worker threads. If constructed with
    /// `use_caller = true`, the calling thread joins the pool on
    /// [`Scheduler::stop`], not here.
    pub fn start(&self, thread_count: usize) {
        if self.shared.stopped.load(Ordering::Acquire) {
            return;
        }
        let mut workers = self.workers.lock();
        for i in 0..thread_count {
            let shared = self.shared.clone();
            let name = format!("{}-{}", self.shared.name, i);
            let handle = ThreadHandle::spawn(name, move || {
                run_loop(shared);
            });
            self.shared.thread_ids.lock().push(handle.thread_id());
            workers.push(handle);
        }
    }

    /// Request shutdown. If `use_caller`, drains the caller's own share of
    /// work by running the root fiber before joining the worker threads.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.hooks.tickle(self.has_idle_threads());

        if let Some(root) = self.root_fiber.lock().take() {
            self.shared
                .root_thread_id
                .store(unsafe { libc::gettid() }, Ordering::Release);
            root.resume();
        }

        let workers: Vec<ThreadHandle> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.join();
        }
        self.shared.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

fn run_loop(shared: Arc<Shared>) {
    shared.hooks.init();
    let idle_allocator = shared.stack_allocator.clone();
    let shared_for_idle = shared.clone();
    let idle_fiber = Fiber::spawn(&idle_allocator, move || {
        let should_stop = || {
            shared_for_idle
                .hooks
                .stopping(shared_for_idle.stop_requested.load(Ordering::Acquire))
        };
        shared_for_idle.hooks.idle(&should_stop);
    })
    .expect("failed to allocate idle fiber stack");

    loop {
        let this_thread = unsafe { libc::gettid() };
        let (found, skipped_for_pinning) = {
            let mut tasks = shared.tasks.lock();
            let mut cursor = 0;
            let mut picked = None;
            let mut skipped = false;
            while cursor < tasks.len() {
                let matches_thread = match tasks[cursor].thread_id {
                    Some(tid) => tid == this_thread,
                    None => true,
                };
                if matches_thread {
                    picked = tasks.remove(cursor);
                    break;
                }
                skipped = true;
                cursor += 1;
            }
            (picked, skipped)
        };

        // A task pinned to another worker was left behind for it; tickle so
        // that worker (possibly idle) wakes up to claim it.
        if skipped_for_pinning {
            shared.hooks.tickle(shared.idle_threads.load(Ordering::Acquire) > 0);
        }

        match found {
            Some(task) => {
                shared.active_threads.fetch_add(1, Ordering::AcqRel);
                let fiber = match task.body {
                    TaskBody::Fiber(f) => f,
                    TaskBody::Callback(cb) => Fiber::spawn(&shared.stack_allocator, cb)
                        .expect("failed to allocate task fiber stack"),
                };
                fiber.resume();
                shared.active_threads.fetch_sub(1, Ordering::AcqRel);

                if fiber.state() == crate::fiber::State::Ready {
                    shared.tasks.lock().push_back(Task {
                        body: TaskBody::Fiber(fiber),
                        thread_id: task.thread_id,
                    });
                }
            }
            None => {
                shared.idle_threads.fetch_add(1, Ordering::AcqRel);
                idle_fiber.resume();
                shared.idle_threads.fetch_sub(1, Ordering::AcqRel);
                if idle_fiber.state() == crate::fiber::State::Term {
                    // Wake any sibling worker still parked in its own idle
                    // fiber so it notices the scheduler is done stopping too.
                    shared.hooks.tickle(shared.idle_threads.load(Ordering::Acquire) > 0);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn runs_scheduled_callbacks() {
        let scheduler = Scheduler::new(2, "test-sched", false).unwrap();
        scheduler.start(2);

        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            scheduler.schedule_callback(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );
        }

        std::thread::sleep(std::time::Duration::from_millis(100));
        scheduler.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn pinned_task_runs_on_requested_thread() {
        let scheduler = Scheduler::new(2, "pinned-sched", false).unwrap();
        scheduler.start(2);

        let tids: Arc<Mutex<Vec<libc::pid_t>>> = Arc::new(Mutex::new(Vec::new()));
        let first_tid = scheduler.shared.thread_ids.lock()[0];
        let tids_in_task = tids.clone();
        scheduler.schedule_callback(
            move || {
                tids_in_task.lock().push(unsafe { libc::gettid() });
            },
            Some(first_tid),
        );

        std::thread::sleep(std::time::Duration::from_millis(100));
        scheduler.stop();
        assert_eq!(*tids.lock(), vec![first_tid]);
    }
}
