//! Shared test utilities for shardline integration tests.
//!
//! This crate provides:
//! - [`MemoryStreamClient`]: an in-memory log service with fault injection
//! - [`CollectingHandler`]: a message handler recording every payload
//! - Settings and clock fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use shardline_test_utils::{MemoryStreamClient, test_settings};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let client = MemoryStreamClient::new();
//!     client.add_shard("shardId-000000000000");
//!     let settings = test_settings("events");
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod client;
pub mod fixtures;
pub mod handler;

pub use client::*;
pub use fixtures::*;
pub use handler::*;

/// Directives used by [`init_test_logging`] unless `SHARDLINE_TEST_LOG` is set.
pub const TEST_LOG_DIRECTIVES: &str = "shardline_core=debug,shardline_stream=debug,shardline_test_utils=debug";

/// Routes the logs of the crates under test to the test output.
///
/// Safe to call from every test; only the first call installs the subscriber.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_env("SHARDLINE_TEST_LOG").unwrap_or_else(|_| EnvFilter::new(TEST_LOG_DIRECTIVES));

    // Already installed by an earlier test of the same binary.
    let _ = fmt()
        .compact()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
