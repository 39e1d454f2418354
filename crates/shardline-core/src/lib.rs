//! # shardline-core
//!
//! Leaf primitives shared by every shardline component.
//!
//! - **Clock**: wall-clock time, sleeps, timers and tickers with a deterministic fake
//! - **Cancellation**: hierarchical cancel tokens, including delayed cancellation
//! - **Supervision**: task groups that cancel siblings on the first failure
//! - **Poisoned Lock**: a single-writer lock that refuses all use once retired
//! - **KV Store**: the conditional-write key-value contract and an in-memory store
//! - **Metrics**: a non-blocking metric sink contract with facade and memory writers
//! - **Error Types**: shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use shardline_core::prelude::*;
//!
//! let clock = Arc::new(FakeClock::default());
//! let token = CancelToken::new();
//!
//! clock.advance(Duration::from_secs(5));
//! assert!(!token.is_cancelled());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backoff;
pub mod cancel;
pub mod clock;
pub mod error;
pub mod health;
pub mod kv;
pub mod metrics;
pub mod observability;
pub mod poison;
pub mod supervisor;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use shardline_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cancel::{CancelToken, DelayedCancel};
    pub use crate::clock::{Clock, FakeClock, SharedClock, SystemClock, Ticker, Timer};
    pub use crate::error::{Error, Result};
    pub use crate::health::HealthTimer;
    pub use crate::kv::{Condition, Item, ItemKey, KvStore, MemoryKvStore, UpdateAction, WriteResult};
    pub use crate::metrics::{Datum, MetricWriter, Priority, Unit};
    pub use crate::poison::{LockError, PoisonedLock};
    pub use crate::supervisor::TaskGroup;
}

pub use backoff::{BackoffSettings, ExponentialBackoff};
pub use cancel::{CancelToken, DelayedCancel};
pub use clock::{Clock, FakeClock, SharedClock, SystemClock, Ticker, Timer};
pub use error::{Error, Result};
pub use health::HealthTimer;
pub use kv::{Condition, Item, ItemKey, KvStore, MemoryKvStore, UpdateAction, WriteResult};
pub use metrics::{
    Datum, FacadeMetricWriter, MemoryMetricWriter, MetricWriter, NoopMetricWriter, Priority, Unit,
};
pub use observability::{LogFormat, init_logging};
pub use poison::{LockError, PoisonedGuard, PoisonedLock};
pub use supervisor::TaskGroup;
