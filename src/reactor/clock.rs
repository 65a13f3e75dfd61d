use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// Source of time for the reactor and for token arithmetic. Injected so that timer driven
///  behavior (token renewal, send draining) can be tested without waiting for wall clock time.
pub trait Clock: Send + Sync + 'static {
    /// monotonic time, used for timer deadlines
    fn now(&self) -> Instant;

    /// calendar time, used to compare against token expiry
    fn wall_clock(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when it is told to
pub struct ManualClock {
    base_instant: Instant,
    base_wall_clock: SystemTime,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock::starting_at(SystemTime::now())
    }

    pub fn starting_at(wall_clock: SystemTime) -> ManualClock {
        ManualClock {
            base_instant: Instant::now(),
            base_wall_clock: wall_clock,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + self.offset()
    }

    fn wall_clock(&self) -> SystemTime {
        self.base_wall_clock + self.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_both_clocks() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let clock = ManualClock::starting_at(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(5));
        clock.advance(Duration::from_millis(250));

        assert_eq!(clock.now() - instant, Duration::from_millis(5250));
        assert_eq!(clock.wall_clock(), start + Duration::from_millis(5250));
    }
}
