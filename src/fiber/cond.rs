//! Fiber condition variable.
//!
//! Generalizes the "yield to hold, get resumed by someone else" pattern
//! used for reactor readiness and timers so a fiber can park on an
//! arbitrary condition instead.

use std::collections::VecDeque;

use crate::sync::Mutex;

use super::Fiber;

/// A queue of fibers parked until signaled.
#[derive(Default)]
pub struct Cond {
    waiters: Mutex<VecDeque<Fiber>>,
}

impl Cond {
    pub fn new() -> Self {
        Cond {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Park the current fiber until [`Cond::signal`] or [`Cond::broadcast`]
    /// wakes it. Must be called from inside a running fiber, not the
    /// per-thread anchor.
    pub fn wait(&self) {
        let current = super::current();
        self.waiters.lock().push_back(current);
        super::yield_to_hold();
    }

    /// Wake one waiting fiber, if any. The caller is responsible for
    /// scheduling the returned fiber (typically by handing it back to the
    /// scheduler it belongs to).
    pub fn signal(&self) -> Option<Fiber> {
        self.waiters.lock().pop_front()
    }

    /// Wake every waiting fiber.
    pub fn broadcast(&self) -> Vec<Fiber> {
        self.waiters.lock().drain(..).collect()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_returns_none_when_empty() {
        let cond = Cond::new();
        assert!(cond.signal().is_none());
        assert_eq!(cond.waiter_count(), 0);
    }
}
