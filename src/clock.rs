//! Monotonic time source.
//!
//! Free functions backed directly by `clock_gettime(CLOCK_MONOTONIC, ..)`.

use std::time::Duration;

/// Current monotonic time, in milliseconds. Used as the deadline unit
/// throughout the timer manager and reactor.
pub fn monotonic_ms() -> i64 {
    let d = monotonic();
    d.as_millis() as i64
}

/// Current monotonic time since an unspecified epoch.
pub fn monotonic() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        log::error!("clock_gettime(CLOCK_MONOTONIC) failed: {err}");
        panic!("clock_gettime(CLOCK_MONOTONIC) failed: {err}");
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ms_is_nondecreasing() {
        let a = monotonic_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
