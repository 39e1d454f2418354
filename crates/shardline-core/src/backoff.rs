//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Base backoff duration for retries.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff duration.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Tuning for [`ExponentialBackoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    /// First interval.
    pub initial_interval: Duration,
    /// Upper bound for any interval.
    pub max_interval: Duration,
    /// Growth factor between intervals.
    pub multiplier: u32,
    /// Fraction of the interval added or removed at random, in `[0, 1]`.
    pub randomization_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_interval: BACKOFF_BASE,
            max_interval: BACKOFF_MAX,
            multiplier: 2,
            randomization_factor: 0.5,
        }
    }
}

/// Produces growing, jittered pause durations.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at the initial interval.
    #[must_use]
    pub const fn new(settings: BackoffSettings) -> Self {
        Self {
            current: settings.initial_interval,
            settings,
        }
    }

    /// Returns the next pause and grows the interval.
    pub fn next_backoff(&mut self) -> Duration {
        let interval = self.current.min(self.settings.max_interval);
        self.current = self
            .current
            .saturating_mul(self.settings.multiplier)
            .min(self.settings.max_interval);

        let factor = self.settings.randomization_factor.clamp(0.0, 1.0);
        if factor <= 0.0 {
            return interval;
        }
        let jitter = rand::thread_rng().gen_range(-factor..=factor);
        interval.mul_f64(1.0 + jitter).min(self.settings.max_interval)
    }

    /// Starts over from the initial interval.
    pub fn reset(&mut self) {
        self.current = self.settings.initial_interval;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffSettings::default())
    }
}
