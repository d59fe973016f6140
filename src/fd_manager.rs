//! Hook-side per-fd bookkeeping.
//!
//! Tracks blocking-mode state independent of any reactor: whether a fd is a
//! socket, whether the process asked for non-blocking mode itself
//! (`user_non_block`) versus the hook layer silently flipping `O_NONBLOCK`
//! underneath it (`sys_non_block`), and cached send/recv timeouts so
//! `hook::recv`/`hook::send` know how long to let the reactor wait before
//! giving up. Distinct from [`crate::reactor::FdContext`], which is purely
//! about epoll readiness and knows nothing about blocking semantics.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::sync::RwLock;

const INITIAL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct FdContext {
    pub is_init: bool,
    pub is_socket: bool,
    /// `O_NONBLOCK` as last observed via `fcntl`, independent of who set it.
    pub sys_non_block: bool,
    /// Whether user code itself asked for non-blocking mode; if so the
    /// hooks must not silently swallow `EAGAIN` by parking on the reactor.
    pub user_non_block: bool,
    pub is_closed: bool,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

impl Default for FdContext {
    fn default() -> Self {
        FdContext {
            is_init: false,
            is_socket: false,
            sys_non_block: false,
            user_non_block: false,
            is_closed: false,
            recv_timeout: None,
            send_timeout: None,
        }
    }
}

struct FdTable {
    contexts: RwLock<Vec<Option<Arc<RwLock<FdContext>>>>>,
}

static TABLE: Lazy<FdTable> = Lazy::new(|| FdTable {
    contexts: RwLock::new((0..INITIAL_CAPACITY).map(|_| None).collect()),
});

/// The process-wide fd table. There is exactly one regardless of how many
/// reactors exist, mirroring the fact that a fd's blocking mode is kernel
/// state shared by every thread in the process.
pub struct FdManager;

impl FdManager {
    /// Fetch the context for `fd`, creating a freshly-initialized one (with
    /// `is_socket` determined via `fstat`) if this is the first time the
    /// hooks have seen it.
    pub fn add_or_get_fdctx(fd: libc::c_int) -> Arc<RwLock<FdContext>> {
        if let Some(ctx) = Self::get(fd) {
            return ctx;
        }

        let mut contexts = TABLE.contexts.write();
        let needed = fd as usize + 1;
        if needed > contexts.len() {
            let grown = ((contexts.len() as f64 * 1.5) as usize).max(needed);
            contexts.resize_with(grown, || None);
        }
        if let Some(existing) = &contexts[fd as usize] {
            return existing.clone();
        }

        let is_socket = is_socket_fd(fd);
        let ctx = Arc::new(RwLock::new(FdContext {
            is_init: true,
            is_socket,
            ..Default::default()
        }));
        contexts[fd as usize] = Some(ctx.clone());
        ctx
    }

    pub fn get(fd: libc::c_int) -> Option<Arc<RwLock<FdContext>>> {
        if fd < 0 {
            return None;
        }
        let contexts = TABLE.contexts.read();
        contexts.get(fd as usize).and_then(|c| c.clone())
    }

    /// Drop the context for `fd`, e.g. because it was just closed. A
    /// subsequent `add_or_get_fdctx` for the same number (after the kernel
    /// reuses it) starts fresh.
    pub fn del_fdctx(fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let mut contexts = TABLE.contexts.write();
        if (fd as usize) < contexts.len() {
            contexts[fd as usize] = None;
        }
    }
}

fn is_socket_fd(fd: libc::c_int) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    rc == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_reuses_context_for_same_fd() {
        let (a, b) = unsafe {
            let mut fds = [0i32; 2];
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr());
            (fds[0], fds[1])
        };

        let ctx1 = FdManager::add_or_get_fdctx(a);
        assert!(ctx1.read().is_socket);
        let ctx2 = FdManager::add_or_get_fdctx(a);
        assert!(Arc::ptr_eq(&ctx1, &ctx2));

        FdManager::del_fdctx(a);
        assert!(FdManager::get(a).is_none());

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn unknown_fd_returns_none() {
        assert!(FdManager::get(999_999).is_none());
    }
}
