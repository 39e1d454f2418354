//! Settings and clock fixtures.

use std::sync::Arc;
use std::time::Duration;

use shardline_core::FakeClock;
use shardline_core::backoff::BackoffSettings;
use shardline_stream::{AppId, NamingSettings, RecordWriterSettings, Settings};

/// Returns the identity every test consumer runs as.
pub fn test_app_id() -> AppId {
    AppId::new("shardline", "test", "platform", "consumers", "reader")
}

/// Returns consumer settings for `stream_name` with short intervals.
///
/// The full stream name is `shardline-test-platform-consumers-{stream_name}`.
pub fn test_settings(stream_name: &str) -> Settings {
    Settings {
        app_id: test_app_id(),
        consumer_app_id: test_app_id(),
        name: "test".to_string(),
        stream_name: stream_name.to_string(),
        wait_time: Duration::from_millis(100),
        persist_frequency: Duration::from_secs(1),
        discover_frequency: Duration::from_secs(10),
        release_delay: Duration::from_secs(1),
        ..Settings::default()
    }
}

/// Returns record writer settings for `stream_name` with a fast backoff.
pub fn test_writer_settings(stream_name: &str) -> RecordWriterSettings {
    RecordWriterSettings {
        app_id: test_app_id(),
        client_name: "default".to_string(),
        stream_name: stream_name.to_string(),
        naming: NamingSettings::default(),
        backoff: BackoffSettings {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(100),
            multiplier: 2,
            randomization_factor: 0.0,
        },
    }
}

/// Returns a fake clock at its default instant.
pub fn test_clock() -> Arc<FakeClock> {
    Arc::new(FakeClock::default())
}
