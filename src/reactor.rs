//! Epoll-backed IO/timer reactor.
//!
//! Fuses a [`Scheduler`] with a [`TimerManager`] and an edge-triggered
//! `epoll` instance. A self-pipe wakes the idle loop out of `epoll_wait`
//! when a task is scheduled onto an otherwise-idle reactor
//! ([`Scheduler::has_idle_threads`]).
//!
//! The idle loop's WRITE-trigger branch below tests `real_events & WRITE`,
//! the events `epoll_wait` actually reported, not the armed `fd_ctx.events`
//! bitmask — arming READ and WRITE together must not fire the WRITE waiter
//! on a READ-only wakeup.
//!
//! [`IoManager::stopping`] conjoins the scheduler's own stop flag with "no
//! pending fd events" and "no pending timers": a reactor may not tear down
//! its epoll fd while a fiber is still parked waiting on it.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::fiber::{self, Fiber};
use crate::scheduler::{Hooks, Scheduler};
use crate::sync::{Mutex, RwLock};
use crate::timer::TimerManager;

thread_local! {
    /// The reactor whose worker loop is running on this OS thread, if any.
    /// Set by [`DelegatingHooks::init`] as the first thing a reactor worker
    /// thread (or a use-caller root fiber's thread) does; consulted by
    /// [`crate::hook`] to find where to park a fiber waiting on a fd.
    static CURRENT: RefCell<Option<Arc<ReactorHooks>>> = RefCell::new(None);
}

/// The reactor driving the calling OS thread's scheduler loop, if this
/// thread is one of a reactor's workers.
pub(crate) fn current() -> Option<Arc<ReactorHooks>> {
    CURRENT.with(|c| c.borrow().clone())
}

const INITIAL_FD_CONTEXTS: usize = 32;
const MAX_EPOLL_EVENTS: usize = 256;
const DEFAULT_EPOLL_TIMEOUT_MS: i32 = 5000;

bitflags::bitflags! {
    pub struct EventType: u32 {
        const NONE = 0;
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

enum Waiter {
    Fiber(Fiber),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Waiter {
    fn fire(self, scheduler: &Scheduler) {
        match self {
            Waiter::Fiber(fiber) => scheduler.schedule(fiber, None),
            Waiter::Callback(cb) => scheduler.schedule_callback(cb, None),
        }
    }
}

#[derive(Default)]
struct EventContext {
    waiter: Option<Waiter>,
}

struct FdContextInner {
    events: EventType,
    read: EventContext,
    write: EventContext,
}

/// Reactor-side per-fd bookkeeping: which directions are currently armed
/// and who to wake for each. Distinct from [`crate::fd_manager::FdContext`],
/// which tracks hook-layer bookkeeping (blocking mode, cached timeouts)
/// independent of any particular reactor.
pub struct FdContext {
    fd: RawFd,
    inner: Mutex<FdContextInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            inner: Mutex::new(FdContextInner {
                events: EventType::NONE,
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }

    fn context_mut<'a>(inner: &'a mut FdContextInner, event: EventType) -> &'a mut EventContext {
        if event == EventType::READ {
            &mut inner.read
        } else {
            &mut inner.write
        }
    }

    fn trigger(inner: &mut FdContextInner, event: EventType, scheduler: &Scheduler) {
        let ctx = Self::context_mut(inner, event);
        if let Some(waiter) = ctx.waiter.take() {
            waiter.fire(scheduler);
        }
        inner.events.remove(event);
    }
}

struct FdTable {
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    fn new(capacity: usize) -> Self {
        let mut contexts = Vec::with_capacity(capacity);
        for fd in 0..capacity {
            contexts.push(Some(Arc::new(FdContext::new(fd as RawFd))));
        }
        FdTable {
            contexts: RwLock::new(contexts),
        }
    }

    fn get_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.contexts.read();
            if (fd as usize) < contexts.len() {
                if let Some(ctx) = &contexts[fd as usize] {
                    return ctx.clone();
                }
            }
        }
        let mut contexts = self.contexts.write();
        let needed = fd as usize + 1;
        if needed > contexts.len() {
            let grown = ((contexts.len() as f64 * 1.5) as usize).max(needed);
            for i in contexts.len()..grown {
                contexts.push(Some(Arc::new(FdContext::new(i as RawFd))));
            }
        }
        contexts[fd as usize]
            .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
            .clone()
    }

    fn take(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let mut contexts = self.contexts.write();
        if (fd as usize) < contexts.len() {
            contexts[fd as usize].take()
        } else {
            None
        }
    }
}

pub(crate) struct ReactorHooks {
    epoll_fd: RawFd,
    tickle_read_fd: RawFd,
    tickle_write_fd: RawFd,
    fd_table: FdTable,
    timers: TimerManager,
    pending_events: AtomicUsize,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
}

impl ReactorHooks {
    pub(crate) fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub(crate) fn scheduler_arc(&self) -> Arc<Scheduler> {
        self.scheduler
            .lock()
            .clone()
            .expect("reactor hooks used before IoManager finished constructing")
    }

    /// Arm `event` on `fd`; the current fiber (or `cb`, if given) is woken
    /// when it becomes ready.
    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        event: EventType,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        let fd_ctx = self.fd_table.get_or_grow(fd);
        let mut inner = fd_ctx.inner.lock();
        let already_armed = inner.events.contains(event);
        if already_armed {
            log::error!("fd {fd} already has event {event:?} armed");
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = libc::EPOLLET as u32 | inner.events.bits() | event.bits();
        ev.u64 = fd as u64;
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        inner.events.insert(event);
        let waiter = match cb {
            Some(cb) => Waiter::Callback(cb),
            None => Waiter::Fiber(fiber::current()),
        };
        *FdContext::context_mut(&mut inner, event) = EventContext {
            waiter: Some(waiter),
        };
        // Overwriting an already-armed direction doesn't change the events
        // bitmask, so it must not change the pending-event count either.
        if !already_armed {
            self.pending_events.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Disarm `event` on `fd` without waking its waiter.
    pub(crate) fn del_event(&self, fd: RawFd, event: EventType) -> Result<()> {
        let fd_ctx = self.fd_table.get_or_grow(fd);
        let mut inner = fd_ctx.inner.lock();
        if !inner.events.contains(event) {
            return Ok(());
        }
        let left_event = inner.events & !event;
        let op = if left_event.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = libc::EPOLLET as u32 | left_event.bits();
        ev.u64 = fd as u64;
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        *FdContext::context_mut(&mut inner, event) = EventContext::default();
        inner.events.remove(event);
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Disarm `event` on `fd` and wake its waiter immediately.
    pub(crate) fn cancel_event(&self, fd: RawFd, event: EventType) -> Result<()> {
        let fd_ctx = self.fd_table.get_or_grow(fd);
        let has_event = fd_ctx.inner.lock().events.contains(event);
        if !has_event {
            return Ok(());
        }
        let scheduler = self.scheduler_arc();
        let mut inner = fd_ctx.inner.lock();
        if inner.events.contains(event) {
            let left_event = inner.events & !event;
            let op = if left_event.is_empty() {
                libc::EPOLL_CTL_DEL
            } else {
                libc::EPOLL_CTL_MOD
            };
            let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
            ev.events = libc::EPOLLET as u32 | left_event.bits();
            ev.u64 = fd as u64;
            unsafe {
                libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev);
            }
            FdContext::trigger(&mut inner, event, &scheduler);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Disarm every event on `fd` and wake every waiter, e.g. because the
    /// fd is about to be closed.
    pub(crate) fn cancel_all(&self, fd: RawFd) {
        let fd_ctx = match self.fd_table.take(fd) {
            Some(ctx) => ctx,
            None => return,
        };
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
        let scheduler = self.scheduler_arc();
        let mut inner = fd_ctx.inner.lock();
        let had_read = inner.events.contains(EventType::READ);
        let had_write = inner.events.contains(EventType::WRITE);
        if had_read {
            FdContext::trigger(&mut inner, EventType::READ, &scheduler);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        if had_write {
            FdContext::trigger(&mut inner, EventType::WRITE, &scheduler);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Hooks for ReactorHooks {
    fn init(&self) {
        crate::hook::set_hook_enabled(true);
        log::debug!("reactor worker starting");
    }

    fn tickle(&self, has_idle_threads: bool) {
        if !has_idle_threads {
            return;
        }
        let byte = [b'T'];
        unsafe {
            libc::write(self.tickle_write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn stopping(&self, stop_requested: bool) -> bool {
        stop_requested
            && self.pending_events.load(Ordering::Acquire) == 0
            && !self.timers.has_pending_timers()
    }

    fn idle(&self, should_stop: &dyn Fn() -> bool) {
        let scheduler = self
            .scheduler
            .lock()
            .clone()
            .expect("reactor hooks used before IoManager finished constructing");
        let mut events: Vec<libc::epoll_event> =
            vec![unsafe { std::mem::zeroed() }; MAX_EPOLL_EVENTS];

        while !should_stop() {
            for cb in self.timers.expire() {
                scheduler.schedule_callback(cb, None);
            }

            let timeout_ms = self
                .timers
                .next_timeout_ms()
                .map(|ms| ms.min(DEFAULT_EPOLL_TIMEOUT_MS as i64) as i32)
                .unwrap_or(DEFAULT_EPOLL_TIMEOUT_MS);

            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epoll_fd,
                        events.as_mut_ptr(),
                        MAX_EPOLL_EVENTS as i32,
                        timeout_ms,
                    )
                };
                if rc >= 0 {
                    break rc;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("epoll_wait failed: {err}");
                break 0;
            };

            for event in &events[..n as usize] {
                let fd = event.u64 as RawFd;
                if fd == self.tickle_read_fd {
                    let mut buf = [0u8; 64];
                    loop {
                        let rc = unsafe {
                            libc::read(
                                self.tickle_read_fd,
                                buf.as_mut_ptr() as *mut libc::c_void,
                                buf.len(),
                            )
                        };
                        if rc <= 0 {
                            break;
                        }
                    }
                    continue;
                }

                let fd_ctx = match self.fd_table.contexts.read().get(fd as usize) {
                    Some(Some(ctx)) => ctx.clone(),
                    _ => continue,
                };

                let mut real_events = 0u32;
                if event.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    real_events |= EventType::READ.bits() | EventType::WRITE.bits();
                }
                if event.events & libc::EPOLLIN as u32 != 0 {
                    real_events |= EventType::READ.bits();
                }
                if event.events & libc::EPOLLOUT as u32 != 0 {
                    real_events |= EventType::WRITE.bits();
                }
                let real_events = EventType::from_bits_truncate(real_events);

                let mut inner = fd_ctx.inner.lock();
                if (inner.events & real_events).is_empty() {
                    continue;
                }

                let left_event = inner.events & !real_events;
                let op = if left_event.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
                ev.events = libc::EPOLLET as u32 | left_event.bits();
                ev.u64 = fd as u64;
                unsafe {
                    libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev);
                }

                if real_events.contains(EventType::READ) {
                    FdContext::trigger(&mut inner, EventType::READ, &scheduler);
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
                // Gate on `real_events`, not `inner.events`, or a fd armed
                // for both directions fires its WRITE waiter on every
                // READ-only wakeup.
                if real_events.contains(EventType::WRITE) {
                    FdContext::trigger(&mut inner, EventType::WRITE, &scheduler);
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
            }

            fiber::yield_to_hold();
        }
    }
}

/// An epoll-backed reactor: a [`Scheduler`] whose idle loop polls fd
/// readiness and fires due timers instead of simply parking.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    hooks: Arc<ReactorHooks>,
}

impl IoManager {
    pub fn new(thread_count: usize, name: impl Into<String>, use_caller: bool) -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut pipe_fds = [0i32; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let [tickle_read_fd, tickle_write_fd] = pipe_fds;

        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = libc::EPOLLIN as u32 | libc::EPOLLET as u32;
        ev.u64 = tickle_read_fd as u64;
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_read_fd, &mut ev) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let hooks = Arc::new(ReactorHooks {
            epoll_fd,
            tickle_read_fd,
            tickle_write_fd,
            fd_table: FdTable::new(INITIAL_FD_CONTEXTS),
            timers: TimerManager::new(),
            pending_events: AtomicUsize::new(0),
            scheduler: Mutex::new(None),
        });

        let scheduler = Arc::new(Scheduler::with_hooks(
            thread_count,
            name,
            use_caller,
            Box::new(DelegatingHooks(hooks.clone())),
        )?);
        *hooks.scheduler.lock() = Some(scheduler.clone());

        Ok(IoManager { scheduler, hooks })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timers(&self) -> &TimerManager {
        &self.hooks.timers
    }

    pub fn start(&self, thread_count: usize) {
        self.scheduler.start(thread_count);
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Arm `event` on `fd`; the current fiber (or `cb`, if given) is woken
    /// when it becomes ready.
    pub fn add_event(&self, fd: RawFd, event: EventType, cb: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        self.hooks.add_event(fd, event, cb)
    }

    /// Disarm `event` on `fd` without waking its waiter.
    pub fn del_event(&self, fd: RawFd, event: EventType) -> Result<()> {
        self.hooks.del_event(fd, event)
    }

    /// Disarm `event` on `fd` and wake its waiter immediately.
    pub fn cancel_event(&self, fd: RawFd, event: EventType) -> Result<()> {
        self.hooks.cancel_event(fd, event)
    }

    /// Disarm every event on `fd` and wake every waiter, e.g. because the
    /// fd is about to be closed.
    pub fn cancel_all(&self, fd: RawFd) {
        self.hooks.cancel_all(fd)
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.hooks.epoll_fd);
            libc::close(self.hooks.tickle_read_fd);
            libc::close(self.hooks.tickle_write_fd);
        }
    }
}

/// Adapter so `Scheduler` (which owns `Box<dyn Hooks>`) can hold a cloneable
/// `Arc<ReactorHooks>` instead of having to be generic over it.
struct DelegatingHooks(Arc<ReactorHooks>);

impl Hooks for DelegatingHooks {
    fn init(&self) {
        CURRENT.with(|c| *c.borrow_mut() = Some(self.0.clone()));
        self.0.init();
    }
    fn tickle(&self, has_idle_threads: bool) {
        self.0.tickle(has_idle_threads);
    }
    fn stopping(&self, stop_requested: bool) -> bool {
        self.0.stopping(stop_requested)
    }
    fn idle(&self, should_stop: &dyn Fn() -> bool) {
        self.0.idle(should_stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn construct_and_tear_down() {
        let io = IoManager::new(1, "test-io", false).unwrap();
        io.start(1);
        io.stop();
    }

    #[test]
    fn add_event_fires_on_readiness() {
        let io = IoManager::new(1, "test-io-events", false).unwrap();
        io.start(1);

        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_cb = fired.clone();
        io.add_event(
            fd,
            EventType::READ,
            Some(Box::new(move || {
                fired_cb.store(true, Ordering::SeqCst);
            })),
        )
        .unwrap();

        a.write_all(b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        io.stop();
        assert!(fired.load(Ordering::SeqCst));
    }
}
