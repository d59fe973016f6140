//! End-to-end reactor scenarios: timers, readiness, and cancellation,
//! driven entirely through the public API.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fibra::{hook, EventType, IoManager};

#[test]
fn sleep_yields_the_fiber_not_the_thread() {
    let io = IoManager::new(1, "sleepy", true).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let log_a = log.clone();
    io.scheduler().schedule_callback(
        move || {
            hook::sleep(Duration::from_millis(400));
            log_a.lock().unwrap().push("A-done");
        },
        None,
    );

    let log_b = log.clone();
    io.scheduler().schedule_callback(
        move || {
            hook::sleep(Duration::from_millis(100));
            log_b.lock().unwrap().push("B-done");
        },
        None,
    );

    let started = Instant::now();
    io.stop();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(700), "elapsed = {elapsed:?}");
    assert_eq!(*log.lock().unwrap(), vec!["B-done", "A-done"]);
}

#[test]
fn add_event_fires_exactly_once_and_clears_the_fd() {
    let io = IoManager::new(1, "events", false).unwrap();
    io.start(1);

    let (mut a, b) = UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    let fd = b.as_raw_fd();

    let fire_count = Arc::new(AtomicUsize::new(0));
    let fire_count2 = fire_count.clone();
    io.add_event(
        fd,
        EventType::READ,
        Some(Box::new(move || {
            fire_count2.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    a.write_all(b"x").unwrap();
    std::thread::sleep(Duration::from_millis(150));
    io.stop();

    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_timer_before_expiry_never_fires() {
    let manager = fibra::TimerManager::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    let timer = manager.add_timer(50, move || { fired2.fetch_add(1, Ordering::SeqCst); }, false);
    timer.cancel();
    std::thread::sleep(Duration::from_millis(60));
    let callbacks = manager.expire();
    assert!(callbacks.is_empty());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_all_wakes_the_single_waiter_and_clears_pending_events() {
    let io = IoManager::new(1, "cancel-all", true).unwrap();

    let (_a, b) = UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    let fd = b.as_raw_fd();

    let fire_count = Arc::new(AtomicUsize::new(0));
    let fire_count2 = fire_count.clone();
    io.add_event(
        fd,
        EventType::READ,
        Some(Box::new(move || {
            fire_count2.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    io.cancel_all(fd);
    io.stop();

    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
}
