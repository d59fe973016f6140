//! Thin scoped-acquisition wrappers over OS synchronization primitives.
//!
//! These guard the runtime's own bookkeeping (task lists, fd tables, timer
//! sets) — they are plain OS mutexes/rwlocks/semaphores, not the
//! fiber-cooperative primitives a user fiber parks on (see [`crate::cond`]).
//! A poisoned lock here means a panic happened while the lock was held,
//! which is already a contract violation elsewhere in the runtime; rather
//! than propagate poisoning we log and recover the guard, treating these
//! wrappers as infallible.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{self as std_sync};

/// A mutex that never exposes poisoning to callers.
pub struct Mutex<T: ?Sized> {
    inner: std_sync::Mutex<()>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            inner: std_sync::Mutex::new(()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::error!("mutex poisoned, recovering");
                poisoned.into_inner()
            }
        };
        MutexGuard {
            _inner: guard,
            data: &self.data,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    _inner: std_sync::MutexGuard<'a, ()>,
    data: &'a UnsafeCell<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("data", &*self.lock()).finish()
    }
}

/// A read-write lock that never exposes poisoning to callers.
pub struct RwLock<T: ?Sized> {
    inner: std_sync::RwLock<()>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        RwLock {
            inner: std_sync::RwLock::new(()),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::error!("rwlock poisoned, recovering for read");
                poisoned.into_inner()
            }
        };
        RwLockReadGuard {
            _inner: guard,
            data: &self.data,
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::error!("rwlock poisoned, recovering for write");
                poisoned.into_inner()
            }
        };
        RwLockWriteGuard {
            _inner: guard,
            data: &self.data,
        }
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized> {
    _inner: std_sync::RwLockReadGuard<'a, ()>,
    data: &'a UnsafeCell<T>,
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.data.get() }
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized> {
    _inner: std_sync::RwLockWriteGuard<'a, ()>,
    data: &'a UnsafeCell<T>,
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

/// A counting semaphore over `libc::sem_t`, used by [`crate::thread_handle`]
/// to signal "the spawned thread has recorded its id".
pub struct Semaphore {
    sem: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        let mut sem: libc::sem_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::sem_init(&mut sem, 0, initial) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            log::error!("sem_init failed: {err}");
            panic!("sem_init failed: {err}");
        }
        Semaphore {
            sem: UnsafeCell::new(sem),
        }
    }

    pub fn wait(&self) {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem.get()) };
            if rc == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("sem_wait failed: {err}");
            panic!("sem_wait failed: {err}");
        }
    }

    pub fn post(&self) {
        let rc = unsafe { libc::sem_post(self.sem.get()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            log::error!("sem_post failed: {err}");
            panic!("sem_post failed: {err}");
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.sem.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutex_roundtrip() {
        let m = Mutex::new(0);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn rwlock_roundtrip() {
        let l = RwLock::new(vec![1, 2, 3]);
        assert_eq!(l.read().len(), 3);
        l.write().push(4);
        assert_eq!(*l.read(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn semaphore_blocks_until_posted() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.wait();
            42
        });
        thread::sleep(std::time::Duration::from_millis(20));
        sem.post();
        assert_eq!(handle.join().unwrap(), 42);
    }
}
