//! OS thread handle with a startup rendezvous.
//!
//! Grounded on `thread.h`/`thread.cpp`'s `Thread`: the constructing thread
//! blocks until the spawned thread has recorded its id and name, so that
//! the caller can rely on [`ThreadHandle::thread_id`] immediately after
//! construction returns.

use std::thread::JoinHandle;

use crate::sync::Semaphore;

/// An owned OS thread, started with a name and an entry closure.
pub struct ThreadHandle {
    join_handle: Option<JoinHandle<()>>,
    thread_id: libc::pid_t,
    name: String,
}

struct StartupState {
    thread_id: std::sync::atomic::AtomicI32,
    ready: Semaphore,
}

impl ThreadHandle {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let state = std::sync::Arc::new(StartupState {
            thread_id: std::sync::atomic::AtomicI32::new(0),
            ready: Semaphore::new(0),
        });
        let state_in_thread = state.clone();
        let thread_name = name.clone();
        let join_handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let tid = unsafe { libc::gettid() };
                state_in_thread
                    .thread_id
                    .store(tid, std::sync::atomic::Ordering::Release);
                state_in_thread.ready.post();
                f();
            })
            .expect("failed to spawn OS thread");

        state.ready.wait();
        let thread_id = state.thread_id.load(std::sync::atomic::Ordering::Acquire);

        ThreadHandle {
            join_handle: Some(join_handle),
            thread_id,
            name,
        }
    }

    pub fn thread_id(&self) -> libc::pid_t {
        self.thread_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the underlying OS thread has finished.
    pub fn join(mut self) {
        if let Some(handle) = self.join_handle.take() {
            if let Err(err) = handle.join() {
                log::error!("thread {} panicked: {:?}", self.name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn records_thread_id_before_returning() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_thread = ran.clone();
        let handle = ThreadHandle::spawn("worker-0", move || {
            ran_in_thread.store(true, Ordering::SeqCst);
        });
        assert!(handle.thread_id() > 0);
        assert_eq!(handle.name(), "worker-0");
        handle.join();
        assert!(ran.load(Ordering::SeqCst));
    }
}
