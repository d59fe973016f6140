//! Blocking-call replacements that park on the calling thread's reactor
//! instead of blocking the OS thread.
//!
//! True libc symbol interposition (`dlsym(RTLD_NEXT, ..)`) only works for a
//! dynamically-loaded interposer (`LD_PRELOAD`); a statically linked crate
//! cannot shadow its own call sites' libc symbols that way. These functions
//! are therefore plain Rust entry points fiber code calls directly — the
//! interception boundary moves from link time to API surface, but every
//! other behavior (per-call `EAGAIN`-then-park-then-retry, timeout wiring,
//! fd bookkeeping) is preserved.
//!
//! Calling any of these from a thread that isn't a reactor worker falls
//! back to the underlying blocking syscall: there's nothing to park on.

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::fd_manager::FdManager;
use crate::reactor::{self, EventType};

thread_local! {
    /// Per-thread opt-in for interception, disabled by default. The reactor
    /// flips this on for its own worker threads (including a use-caller
    /// root fiber's thread) as the first thing it does; plain application
    /// threads never intercept unless they ask to.
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Enable or disable syscall interception on the calling OS thread.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(-1);

/// Process-wide default timeout for [`connect`], in milliseconds. `-1`
/// means "no timeout" (the default).
pub fn set_connect_timeout_ms(ms: i64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Release);
}

fn connect_timeout() -> Option<Duration> {
    let ms = CONNECT_TIMEOUT_MS.load(Ordering::Acquire);
    if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

fn is_would_block(rc: libc::ssize_t) -> bool {
    if rc >= 0 {
        return false;
    }
    let err = io::Error::last_os_error();
    matches!(err.kind(), io::ErrorKind::WouldBlock)
}

fn is_eintr(rc: libc::ssize_t) -> bool {
    rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted
}

/// Whether `fd` is eligible for interception: hooking must be enabled on
/// this thread, a fd-context must already exist for it (lazily populated by
/// [`socket`]/[`accept`]), it must be a socket, and the user must not have
/// asked for non-blocking mode themselves (in which case `EAGAIN` is theirs
/// to handle, not ours to hide).
fn should_intercept(fd: RawFd) -> bool {
    if !hook_enabled() {
        return false;
    }
    match FdManager::get(fd) {
        Some(ctx) => {
            let ctx = ctx.read();
            ctx.is_socket && !ctx.user_non_block
        }
        None => false,
    }
}

/// Run `syscall` (returning a raw `ssize_t`-like result) until it succeeds
/// or fails with something other than `EAGAIN`/`EWOULDBLOCK`. `EINTR` is
/// always retried transparently. If `fd` isn't eligible for interception
/// (hooking disabled, no fd-context, not a socket, or user-requested
/// non-blocking mode) or no reactor is running on this thread, a would-block
/// result is simply returned to the caller instead of being parked on.
fn do_io<F>(fd: RawFd, event: EventType, timeout: Option<Duration>, mut syscall: F) -> libc::ssize_t
where
    F: FnMut() -> libc::ssize_t,
{
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        let rc = syscall();
        if is_eintr(rc) {
            continue;
        }
        if !is_would_block(rc) {
            return rc;
        }
        if !should_intercept(fd) {
            return rc;
        }

        let hooks = match reactor::current() {
            Some(hooks) => hooks,
            None => return rc,
        };

        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                unsafe { *libc::__errno_location() = libc::ETIMEDOUT };
                return -1;
            }
            let cancel_guard = std::sync::Arc::new(());
            let weak_guard = std::sync::Arc::downgrade(&cancel_guard);
            hooks.timers().add_conditional_timer(
                remaining.as_millis() as i64,
                weak_guard,
                move || {
                    let _ = reactor::current().map(|h| h.cancel_event(fd, event));
                },
                false,
            );
            if hooks.add_event(fd, event, None).is_err() {
                return rc;
            }
            crate::fiber::yield_to_hold();
            drop(cancel_guard);
        } else {
            if hooks.add_event(fd, event, None).is_err() {
                return rc;
            }
            crate::fiber::yield_to_hold();
        }
    }
}

fn recv_timeout(fd: RawFd) -> Option<Duration> {
    FdManager::get(fd).and_then(|ctx| ctx.read().recv_timeout)
}

fn send_timeout(fd: RawFd) -> Option<Duration> {
    FdManager::get(fd).and_then(|ctx| ctx.read().send_timeout)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> libc::ssize_t {
    do_io(fd, EventType::READ, recv_timeout(fd), || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> libc::ssize_t {
    do_io(fd, EventType::WRITE, send_timeout(fd), || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

pub fn readv(fd: RawFd, iov: &mut [libc::iovec]) -> libc::ssize_t {
    do_io(fd, EventType::READ, recv_timeout(fd), || unsafe {
        libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int)
    })
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> libc::ssize_t {
    do_io(fd, EventType::WRITE, send_timeout(fd), || unsafe {
        libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> libc::ssize_t {
    do_io(fd, EventType::READ, recv_timeout(fd), || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> libc::ssize_t {
    do_io(fd, EventType::WRITE, send_timeout(fd), || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::ssize_t {
    do_io(fd, EventType::READ, recv_timeout(fd), || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::ssize_t {
    do_io(fd, EventType::WRITE, send_timeout(fd), || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

pub fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> libc::ssize_t {
    do_io(fd, EventType::READ, recv_timeout(fd), || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: libc::c_int) -> libc::ssize_t {
    do_io(fd, EventType::WRITE, send_timeout(fd), || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Accept a connection, parking on `fd` becoming readable between attempts.
/// The accepted fd is registered and forced non-blocking exactly like
/// [`socket`], since `accept` on Linux does not inherit `O_NONBLOCK` from
/// the listening socket.
pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> RawFd {
    let accepted = do_io(fd, EventType::READ, None, || unsafe {
        libc::accept(fd, addr, addrlen) as libc::ssize_t
    }) as RawFd;
    if accepted >= 0 {
        FdManager::add_or_get_fdctx(accepted);
        set_non_blocking(accepted, true);
    }
    accepted
}

/// Connect, parking on `fd` becoming writable once the kernel has either
/// completed or failed the handshake. Uses the process-wide default set by
/// [`set_connect_timeout_ms`].
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> Result<()> {
    connect_with_timeout(fd, addr, addrlen, connect_timeout())
}

/// Like [`connect`], but gives up with `ETIMEDOUT` after `timeout` if the
/// handshake hasn't completed.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout: Option<Duration>,
) -> Result<()> {
    let rc = unsafe { libc::connect(fd, addr, addrlen) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.kind() != io::ErrorKind::WouldBlock && err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err.into());
    }

    let rc = do_io(fd, EventType::WRITE, timeout, || {
        let mut sock_err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut sock_err as *mut _ as *mut libc::c_void,
                &mut len,
            );
        }
        if sock_err == 0 {
            0
        } else {
            unsafe { *libc::__errno_location() = sock_err };
            -1
        }
    });

    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error().into())
    }
}

/// Sleep the current fiber (not the OS thread) for `duration`, yielding to
/// the scheduler for the whole interval. Falls back to `nanosleep` off a
/// reactor thread.
pub fn sleep(duration: Duration) {
    let hooks = match reactor::current() {
        Some(hooks) => hooks,
        None => {
            let req = libc::timespec {
                tv_sec: duration.as_secs() as libc::time_t,
                tv_nsec: duration.subsec_nanos() as i64,
            };
            unsafe {
                libc::nanosleep(&req, std::ptr::null_mut());
            }
            return;
        }
    };

    let fiber = crate::fiber::current();
    let scheduler = hooks.scheduler_arc();
    hooks.timers().add_timer(
        duration.as_millis() as i64,
        move || scheduler.schedule(fiber, None),
        false,
    );
    crate::fiber::yield_to_hold();
}

pub fn usleep(micros: u64) {
    sleep(Duration::from_micros(micros));
}

pub fn nanosleep(nanos: u64) {
    sleep(Duration::from_nanos(nanos));
}

/// Open a socket and register it with the fd bookkeeping table.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 {
        FdManager::add_or_get_fdctx(fd);
        set_non_blocking(fd, true);
    }
    fd
}

/// Close `fd`, canceling any reactor waiters parked on it first so they
/// wake with an error rather than hanging forever.
pub fn close(fd: RawFd) -> libc::c_int {
    if let Some(hooks) = reactor::current() {
        hooks.cancel_all(fd);
    }
    FdManager::del_fdctx(fd);
    unsafe { libc::close(fd) }
}

fn set_non_blocking(fd: RawFd, non_block: bool) {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return;
    }
    let new_flags = if non_block {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    unsafe {
        libc::fcntl(fd, libc::F_SETFL, new_flags);
    }
    if let Some(ctx) = FdManager::get(fd) {
        ctx.write().sys_non_block = non_block;
    }
}

/// `fcntl`, with `F_SETFL` additionally tracked so the hooks remember
/// whether the *user* asked for non-blocking mode (in which case `EAGAIN`
/// must propagate instead of silently parking on the reactor).
pub fn fcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> libc::c_int {
    if cmd == libc::F_SETFL {
        if let Some(ctx) = FdManager::get(fd) {
            ctx.write().user_non_block = arg & libc::O_NONBLOCK != 0;
        }
        return unsafe { libc::fcntl(fd, cmd, arg | libc::O_NONBLOCK) };
    }
    unsafe { libc::fcntl(fd, cmd, arg) }
}

/// `ioctl(FIONBIO, ..)`, the other common way user code flips a socket's
/// blocking mode; tracked the same way as `fcntl(F_SETFL, ..)`.
pub fn ioctl_fionbio(fd: RawFd, non_block: bool) -> libc::c_int {
    if let Some(ctx) = FdManager::get(fd) {
        ctx.write().user_non_block = non_block;
    }
    let mut value: libc::c_int = 1;
    unsafe { libc::ioctl(fd, libc::FIONBIO, &mut value) }
}

/// `setsockopt`, with `SO_RCVTIMEO`/`SO_SNDTIMEO` additionally cached so
/// `recv`/`send` know how long to park before giving up, since the
/// underlying fd is always kept non-blocking at the syscall level.
pub fn setsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        let tv = unsafe { &*(optval as *const libc::timeval) };
        let duration = Duration::new(tv.tv_sec as u64, tv.tv_usec as u32 * 1000);
        let timeout = if duration.is_zero() { None } else { Some(duration) };
        if let Some(ctx) = FdManager::get(fd) {
            let mut ctx = ctx.write();
            if optname == libc::SO_RCVTIMEO {
                ctx.recv_timeout = timeout;
            } else {
                ctx.send_timeout = timeout;
            }
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

/// Passthrough to the kernel; not intercepted because no option this crate
/// cares about is read back through `getsockopt`.
pub fn getsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> libc::c_int {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}
