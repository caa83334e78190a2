use chrono::Utc;
use std::time::{Duration, Instant};

/// Time source for deadlines and fix bookkeeping
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created; alarm deadlines use this base.
    fn elapsed_realtime(&self) -> Duration;

    /// Wall-clock milliseconds since the Unix epoch.
    fn current_time_millis(&self) -> i64;
}

/// Clock backed by `Instant` and the system wall clock
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed_realtime(&self) -> Duration {
        self.boot.elapsed()
    }

    fn current_time_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
