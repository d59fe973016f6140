//! Deadline-ordered timer set.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::clock::monotonic_ms;
use crate::sync::RwLock;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerState {
    id: u64,
    deadline_ms: AtomicI64,
    interval_ms: i64,
    recurring: bool,
    cancelled: std::sync::atomic::AtomicBool,
    cb: RwLock<Option<TimerCallback>>,
}

/// A handle to a scheduled timer. Dropping the handle does not cancel the
/// timer; call [`Timer::cancel`] explicitly.
#[derive(Clone)]
pub struct Timer(Arc<TimerState>);

impl Timer {
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// Re-arm with a fresh deadline `ms` milliseconds from now.
    pub fn refresh(&self, manager: &TimerManager) {
        let new_deadline = monotonic_ms() + self.0.interval_ms;
        self.0.deadline_ms.store(new_deadline, Ordering::Release);
        manager.reinsert(self.clone());
    }

    fn deadline(&self) -> i64 {
        self.0.deadline_ms.load(Ordering::Acquire)
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline()
            .cmp(&other.deadline())
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// An ordered set of pending timers plus rollover detection for the
/// monotonic clock backing deadlines.
pub struct TimerManager {
    timers: RwLock<BTreeSet<Timer>>,
    previous_time_ms: AtomicI64,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            timers: RwLock::new(BTreeSet::new()),
            previous_time_ms: AtomicI64::new(-1),
        }
    }

    /// Schedule `cb` to run `ms` from now. If `on_inserted_into_front` is
    /// supplied and this timer becomes the new earliest deadline, it is
    /// invoked — the reactor uses this to wake its `epoll_wait` early.
    pub fn add_timer<F>(&self, ms: i64, cb: F, recurring: bool) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = monotonic_ms() + ms;
        let timer = Timer(Arc::new(TimerState {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            deadline_ms: AtomicI64::new(deadline),
            interval_ms: ms,
            recurring,
            cancelled: std::sync::atomic::AtomicBool::new(false),
            cb: RwLock::new(Some(Box::new(cb))),
        }));
        self.insert(timer.clone());
        timer
    }

    /// A conditional timer: `cb` only runs if `guard` is still alive when
    /// the deadline is reached. Used to cancel a reactor wait on timeout
    /// without racing a fd that was already closed.
    pub fn add_conditional_timer<T, F>(&self, ms: i64, guard: Weak<T>, cb: F, recurring: bool) -> Timer
    where
        T: 'static,
        F: FnOnce() + Send + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if guard.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn insert(&self, timer: Timer) {
        let is_earliest = {
            let mut timers = self.timers.write();
            let was_front_deadline = timers.iter().next().map(|t| t.deadline());
            timers.insert(timer.clone());
            match was_front_deadline {
                None => true,
                Some(front) => timer.deadline() < front,
            }
        };
        if is_earliest {
            self.on_timer_inserted_into_front(&timer);
        }
    }

    fn reinsert(&self, timer: Timer) {
        self.timers.write().remove(&timer);
        self.insert(timer);
    }

    /// Invoked when a newly-inserted timer becomes the earliest deadline.
    /// A reactor wrapping a `TimerManager` checks `next_timeout_ms()` on its
    /// own poll cadence rather than overriding this; the base manager just
    /// logs.
    fn on_timer_inserted_into_front(&self, _timer: &Timer) {
        log::trace!("timer inserted at front of queue");
    }

    pub fn has_pending_timers(&self) -> bool {
        self.timers.read().iter().any(|t| !t.is_cancelled())
    }

    /// Milliseconds until the next deadline, or `None` if there are no
    /// pending timers. Detects backward clock rollover: if the monotonic
    /// clock appears to have gone backwards by more than an hour since the
    /// last call, every timer is treated as immediately expired.
    pub fn next_timeout_ms(&self) -> Option<i64> {
        let now = monotonic_ms();
        let prev = self.previous_time_ms.swap(now, Ordering::AcqRel);
        let rolled_back = prev != -1 && now < prev - 3_600_000;
        if rolled_back {
            log::warn!("monotonic clock rolled back by more than an hour, expiring all timers");
            return Some(0);
        }

        let timers = self.timers.read();
        timers
            .iter()
            .find(|t| !t.is_cancelled())
            .map(|t| (t.deadline() - now).max(0))
    }

    /// Pop and run every timer whose deadline has passed (or whose clock
    /// rolled back), re-arming recurring ones.
    pub fn expire(&self) -> Vec<TimerCallback> {
        let now = monotonic_ms();
        let rolled_back = {
            let prev = self.previous_time_ms.load(Ordering::Acquire);
            prev != -1 && now < prev - 3_600_000
        };

        let mut expired = Vec::new();
        let mut timers = self.timers.write();
        let due: Vec<Timer> = timers
            .iter()
            .filter(|t| rolled_back || t.deadline() <= now)
            .cloned()
            .collect();
        for timer in &due {
            timers.remove(timer);
        }
        drop(timers);

        for timer in due {
            if timer.is_cancelled() {
                continue;
            }
            if let Some(cb) = timer.0.cb.write().take() {
                expired.push(cb);
            }
            if timer.0.recurring && !timer.is_cancelled() {
                timer.refresh(self);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn next_timeout_reflects_earliest_deadline() {
        let manager = TimerManager::new();
        manager.add_timer(50, || {}, false);
        manager.add_timer(10, || {}, false);
        let timeout = manager.next_timeout_ms().unwrap();
        assert!(timeout <= 10);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_cb = fired.clone();
        let timer = manager.add_timer(0, move || fired_in_cb.store(true, Ordering::SeqCst), false);
        timer.cancel();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let callbacks = manager.expire();
        assert!(callbacks.is_empty());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn expire_runs_due_timers() {
        let manager = TimerManager::new();
        manager.add_timer(0, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let callbacks = manager.expire();
        assert_eq!(callbacks.len(), 1);
        assert!(!manager.has_pending_timers());
    }
}
