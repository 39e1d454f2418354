//! Liveness tracking for long-running consumers.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::SharedClock;

/// Tracks when a component last reported progress.
///
/// Workers call [`HealthTimer::mark_healthy`] on every loop iteration; a
/// health probe calls [`HealthTimer::is_healthy`] and fails once no mark
/// arrived within the timeout.
#[derive(Debug)]
pub struct HealthTimer {
    clock: SharedClock,
    timeout: Duration,
    last_mark: Mutex<DateTime<Utc>>,
}

impl HealthTimer {
    /// Creates a timer that starts out healthy.
    #[must_use]
    pub fn new(clock: SharedClock, timeout: Duration) -> Self {
        let now = clock.now();
        Self {
            clock,
            timeout,
            last_mark: Mutex::new(now),
        }
    }

    /// Records progress at the current time.
    pub fn mark_healthy(&self) {
        let now = self.clock.now();
        *self.last_mark.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    /// Returns true if progress was recorded within the timeout.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let last_mark = *self.last_mark.lock().unwrap_or_else(PoisonError::into_inner);
        self.clock.since(last_mark) < self.timeout
    }

    /// Returns the configured timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn test_health_expires_without_marks() {
        let clock = Arc::new(FakeClock::default());
        let timer = HealthTimer::new(clock.clone(), Duration::from_secs(60));
        assert!(timer.is_healthy());

        clock.advance(Duration::from_secs(59));
        assert!(timer.is_healthy());

        clock.advance(Duration::from_secs(1));
        assert!(!timer.is_healthy());

        timer.mark_healthy();
        assert!(timer.is_healthy());
    }
}
