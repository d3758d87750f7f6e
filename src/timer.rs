//! Wall-clock access shared by the cache and the lock manager.
//!
//! Timestamps are stored in shared memory and compared across processes, so
//! they are milliseconds since the Unix epoch rather than a per-process
//! monotonic clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub trait Timer: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    fn sleep_us(&self, us: u64) {
        std::thread::sleep(Duration::from_micros(us));
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimer;

impl Timer for SystemTimer {
    fn now_ms(&self) -> i64 {
        current_time_ms()
    }
}

/// Manually driven clock for tests. `sleep_us` really sleeps (so that other
/// threads make progress) but never moves the clock.
#[derive(Debug, Default)]
pub struct MockTimer {
    now_ms: AtomicI64,
}

impl MockTimer {
    pub fn new(start_ms: i64) -> Self {
        MockTimer {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_time_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Timer for MockTimer {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

fn current_time_ms() -> i64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        (ts.tv_sec as i64) * 1_000 + (ts.tv_nsec as i64) / 1_000_000
    }

    #[cfg(not(target_os = "linux"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_timer_only_moves_when_told() {
        let timer = MockTimer::new(100);
        assert_eq!(timer.now_ms(), 100);
        timer.sleep_us(10);
        assert_eq!(timer.now_ms(), 100);
        timer.advance_ms(5);
        assert_eq!(timer.now_ms(), 105);
        timer.set_time_ms(0);
        assert_eq!(timer.now_ms(), 0);
    }

    #[test]
    fn system_timer_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemTimer.now_ms() > 1_577_836_800_000);
    }
}
