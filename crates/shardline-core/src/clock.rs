//! Clock abstraction with a real and a deterministic fake implementation.
//!
//! Every component that sleeps, ticks or reads the time receives a
//! [`SharedClock`]. Production code uses [`SystemClock`]; tests drive a
//! [`FakeClock`] by hand and synchronize with the tasks sleeping on it
//! through [`FakeClock::block_until_waiters`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use shardline_core::clock::{Clock, FakeClock};
//!
//! let clock = Arc::new(FakeClock::default());
//! let sleeper = {
//!     let clock = Arc::clone(&clock);
//!     tokio::spawn(async move { clock.sleep(Duration::from_secs(10)).await })
//! };
//!
//! clock.block_until_waiters(1).await;
//! clock.advance(Duration::from_secs(10));
//! sleeper.await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};

/// A clock shared between tasks.
pub type SharedClock = Arc<dyn Clock>;

/// Source of wall-clock time and sleeps.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the time elapsed since `t`, or zero if `t` lies in the future.
    fn since(&self, t: DateTime<Utc>) -> Duration {
        (self.now() - t).to_std().unwrap_or(Duration::ZERO)
    }

    /// Sleeps until `deadline` has been reached.
    async fn sleep_until(&self, deadline: DateTime<Utc>);

    /// Sleeps for `duration`.
    async fn sleep(&self, duration: Duration) {
        let deadline = add(self.now(), duration);
        self.sleep_until(deadline).await;
    }
}

/// Adds a std duration to a timestamp, saturating at the maximum timestamp.
#[must_use]
pub fn add(t: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Subtracts a std duration from a timestamp, saturating at the minimum timestamp.
#[must_use]
pub fn sub(t: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| t.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Returns a shared system clock.
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock whose time only moves when [`FakeClock::advance`] is called.
pub struct FakeClock {
    state: Mutex<FakeState>,
    waiters: watch::Sender<usize>,
}

struct FakeState {
    now: DateTime<Utc>,
    next_id: u64,
    sleepers: BTreeMap<u64, Sleeper>,
}

struct Sleeper {
    deadline: DateTime<Utc>,
    wake: oneshot::Sender<()>,
}

impl FakeClock {
    /// Creates a fake clock starting at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        let (waiters, _) = watch::channel(0);
        Self {
            state: Mutex::new(FakeState {
                now,
                next_id: 0,
                sleepers: BTreeMap::new(),
            }),
            waiters,
        }
    }

    /// Moves the clock forward and wakes every sleeper whose deadline passed.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now = add(state.now, duration);
        let now = state.now;

        let due: Vec<u64> = state
            .sleepers
            .iter()
            .filter(|(_, sleeper)| sleeper.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(sleeper) = state.sleepers.remove(&id) {
                let _ = sleeper.wake.send(());
            }
        }

        self.waiters.send_replace(state.sleepers.len());
    }

    /// Returns the number of tasks currently sleeping on this clock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        *self.waiters.borrow()
    }

    /// Waits until at least `count` tasks are sleeping on this clock.
    pub async fn block_until_waiters(&self, count: usize) {
        let mut rx = self.waiters.subscribe();
        let _ = rx.wait_for(|current| *current >= count).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, id: u64) {
        let mut state = self.lock();
        if state.sleepers.remove(&id).is_some() {
            self.waiters.send_replace(state.sleepers.len());
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default())
    }
}

impl fmt::Debug for FakeClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeClock")
            .field("now", &self.now())
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// Removes an abandoned sleeper when its future is dropped before waking.
struct SleeperGuard<'a> {
    clock: &'a FakeClock,
    id: u64,
}

impl Drop for SleeperGuard<'_> {
    fn drop(&mut self) {
        self.clock.forget(self.id);
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let (wake, woken) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            if deadline <= state.now {
                return;
            }
            let id = state.next_id;
            state.next_id += 1;
            state.sleepers.insert(id, Sleeper { deadline, wake });
            self.waiters.send_replace(state.sleepers.len());
            id
        };

        let _guard = SleeperGuard { clock: self, id };
        let _ = woken.await;
    }
}

/// A resettable one-shot timer.
#[derive(Debug)]
pub struct Timer {
    clock: SharedClock,
    deadline: DateTime<Utc>,
}

impl Timer {
    /// Creates a timer firing `duration` from now.
    #[must_use]
    pub fn new(clock: SharedClock, duration: Duration) -> Self {
        let deadline = add(clock.now(), duration);
        Self { clock, deadline }
    }

    /// Re-arms the timer to fire `duration` from now.
    pub fn reset(&mut self, duration: Duration) {
        self.deadline = add(self.clock.now(), duration);
    }

    /// Returns the instant the timer fires at.
    #[must_use]
    pub const fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Waits for the timer to fire. Cancel safe.
    pub async fn wait(&self) {
        self.clock.sleep_until(self.deadline).await;
    }
}

/// A periodic ticker. Ticks missed while the consumer was busy are dropped.
#[derive(Debug)]
pub struct Ticker {
    clock: SharedClock,
    period: Duration,
    next: DateTime<Utc>,
}

impl Ticker {
    /// Creates a ticker whose first tick fires one `period` from now.
    #[must_use]
    pub fn new(clock: SharedClock, period: Duration) -> Self {
        let next = add(clock.now(), period);
        Self {
            clock,
            period,
            next,
        }
    }

    /// Restarts the ticker with a new period, counting from now.
    pub fn reset(&mut self, period: Duration) {
        self.period = period;
        self.next = add(self.clock.now(), period);
    }

    /// Waits for the next tick. Cancel safe: a dropped wait does not consume a tick.
    pub async fn tick(&mut self) {
        self.clock.sleep_until(self.next).await;

        let now = self.clock.now();
        self.next = add(self.next, self.period);
        if self.next <= now {
            self.next = add(now, self.period);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake() -> Arc<FakeClock> {
        Arc::new(FakeClock::default())
    }

    #[tokio::test]
    async fn test_fake_clock_only_moves_on_advance() {
        let clock = fake();
        let start = clock.now();

        clock.advance(Duration::from_secs(3));

        assert_eq!(clock.since(start), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_sleep_wakes_after_advance() {
        let clock = fake();
        let sleeper = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move { clock.sleep(Duration::from_secs(10)).await })
        };

        clock.block_until_waiters(1).await;
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.waiters(), 1);

        clock.advance(Duration::from_secs(5));
        sleeper.await.expect("sleeper should finish");
        assert_eq!(clock.waiters(), 0);
    }

    #[tokio::test]
    async fn test_dropped_sleep_is_forgotten() {
        let clock = fake();
        let sleeper = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move { clock.sleep(Duration::from_secs(10)).await })
        };

        clock.block_until_waiters(1).await;
        sleeper.abort();
        let _ = sleeper.await;

        assert_eq!(clock.waiters(), 0);
    }

    #[tokio::test]
    async fn test_past_deadline_returns_immediately() {
        let clock = fake();
        let past = sub(clock.now(), Duration::from_secs(1));

        clock.sleep_until(past).await;
        clock.sleep(Duration::ZERO).await;

        assert_eq!(clock.waiters(), 0);
    }

    #[tokio::test]
    async fn test_timer_reset_moves_deadline() {
        let clock = fake();
        let shared: SharedClock = clock.clone();
        let mut timer = Timer::new(shared, Duration::ZERO);
        timer.wait().await;

        timer.reset(Duration::from_secs(2));
        assert_eq!(timer.deadline(), add(clock.now(), Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_ticker_drops_missed_ticks() {
        let clock = fake();
        let shared: SharedClock = clock.clone();
        let mut ticker = Ticker::new(shared, Duration::from_secs(1));

        clock.advance(Duration::from_secs(5));
        ticker.tick().await;

        // The next tick is one period after the late tick, not a burst of catch-up ticks.
        assert_eq!(ticker.next, add(clock.now(), Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_system_clock_since_is_non_negative() {
        let clock = SystemClock;
        let future = add(clock.now(), Duration::from_secs(60));

        assert_eq!(clock.since(future), Duration::ZERO);
    }
}
