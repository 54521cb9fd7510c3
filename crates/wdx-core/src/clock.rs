//! Injectable monotonic clock.
//!
//! Token expirations, cache lifetimes and poll timeouts are all measured
//! against `CLOCK_MONOTONIC`. The clock is passed in on construction so test
//! doubles can control time; nothing in the workspace reads the wall clock.

use std::thread;
use std::time::Duration;

/// Monotonic time source plus sleep, as seen by the service core.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary fixed point.
    fn monotonic(&self) -> Duration;

    /// Blocks the calling thread for the given duration.
    fn sleep(&self, duration: Duration);

    /// Monotonic time in whole seconds.
    fn monotonic_secs(&self) -> u64 {
        self.monotonic().as_secs()
    }
}

/// The operating-system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid timespec
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts) };
        debug_assert_eq!(rc, 0);
        Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.max(0) as u32)
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let clock = SystemClock;
        let first = clock.monotonic();
        let second = clock.monotonic();
        assert!(second >= first);
    }
}
