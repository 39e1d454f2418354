//! Consumer and writer settings.
//!
//! Settings start from [`Settings::default`] and can be overlaid with
//! `SHARDLINE_*` environment variables through [`Settings::from_env`].
//! [`Settings::validate`] enforces the lower bounds every consumer relies on.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_core::BackoffSettings;

use crate::error::{Error, Result};

/// Default stream naming pattern.
pub const DEFAULT_NAMING_PATTERN: &str = "{realm}-{streamName}";

/// Default realm pattern.
pub const DEFAULT_REALM_PATTERN: &str = "{project}-{env}-{family}-{group}";

/// Largest batch a single read may return.
pub const MAX_BATCH_SIZE_LIMIT: usize = 10_000;

const MIN_WAIT_TIME: Duration = Duration::from_millis(1);
const MIN_PERSIST_FREQUENCY: Duration = Duration::from_millis(100);
const MIN_DISCOVER_FREQUENCY: Duration = Duration::from_secs(1);
const MIN_RELEASE_DELAY: Duration = Duration::from_secs(1);

/// Identity of an application, used to name streams and to scope metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppId {
    /// Project name.
    pub project: String,
    /// Deployment environment.
    pub environment: String,
    /// Application family.
    pub family: String,
    /// Application group.
    pub group: String,
    /// Application name.
    pub application: String,
    /// Optional realm override; defaults to `{project}-{env}-{family}-{group}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

impl AppId {
    /// Creates an app id from its parts.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        environment: impl Into<String>,
        family: impl Into<String>,
        group: impl Into<String>,
        application: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
            family: family.into(),
            group: group.into(),
            application: application.into(),
            realm: None,
        }
    }

    /// Reads the app id from `SHARDLINE_PROJECT`, `SHARDLINE_ENV`,
    /// `SHARDLINE_FAMILY`, `SHARDLINE_GROUP`, `SHARDLINE_APP` and `SHARDLINE_REALM`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            project: env_string("SHARDLINE_PROJECT").unwrap_or_default(),
            environment: env_string("SHARDLINE_ENV").unwrap_or_default(),
            family: env_string("SHARDLINE_FAMILY").unwrap_or_default(),
            group: env_string("SHARDLINE_GROUP").unwrap_or_default(),
            application: env_string("SHARDLINE_APP").unwrap_or_default(),
            realm: env_string("SHARDLINE_REALM"),
        }
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.project, self.environment, self.family, self.group, self.application
        )
    }
}

/// Where a consumer starts reading a shard it has no checkpoint for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type", content = "timestamp")]
pub enum InitialPosition {
    /// The oldest record still retained.
    #[default]
    TrimHorizon,
    /// Only records written after the consumer started.
    Latest,
    /// The first record written at or after the timestamp.
    AtTimestamp(DateTime<Utc>),
}

impl std::str::FromStr for InitialPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim();
        match value.to_ascii_uppercase().as_str() {
            "TRIM_HORIZON" => Ok(Self::TrimHorizon),
            "LATEST" => Ok(Self::Latest),
            _ => {
                let timestamp = value
                    .strip_prefix("AT_TIMESTAMP:")
                    .or_else(|| value.strip_prefix("at_timestamp:"))
                    .ok_or_else(|| {
                        invalid(format!(
                            "initial position must be TRIM_HORIZON, LATEST or AT_TIMESTAMP:<rfc3339>, got '{value}'"
                        ))
                    })?;
                DateTime::parse_from_rfc3339(timestamp.trim())
                    .map(|t| Self::AtTimestamp(t.with_timezone(&Utc)))
                    .map_err(|e| invalid(format!("invalid initial position timestamp: {e}")))
            }
        }
    }
}

/// Stream naming configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamingSettings {
    /// Pattern expanded into the full stream name.
    pub pattern: String,
}

impl Default for NamingSettings {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_NAMING_PATTERN.to_string(),
        }
    }
}

/// Settings of one consumer group member.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Identity used to expand the stream name.
    pub app_id: AppId,
    /// Identity of the running application, scoping client and checkpoint records.
    ///
    /// Differs from `app_id` when consuming a stream owned by another application.
    pub consumer_app_id: AppId,
    /// Human readable name of this consumer.
    pub name: String,
    /// Name of the stream before expansion.
    pub stream_name: String,
    /// Name of the wire client configuration to use.
    pub client_name: String,
    /// Stream naming.
    pub naming: NamingSettings,
    /// Records younger than this are held back until they reach this age.
    pub consume_delay: Duration,
    /// Start position for shards without a checkpoint.
    pub initial_position: InitialPosition,
    /// Records fetched per read.
    pub max_batch_size: usize,
    /// Pause between reads of a caught-up shard and between acquisition attempts.
    pub wait_time: Duration,
    /// Interval between checkpoint writes; bounds how much work can be replayed.
    pub persist_frequency: Duration,
    /// Interval between shard and client discovery.
    pub discover_frequency: Duration,
    /// Grace period for releasing shards and deregistering after shutdown.
    pub release_delay: Duration,
    /// Only consume a child shard once its parent is finished.
    pub keep_shard_order: bool,
    /// Duplicate reader metrics with a shard dimension.
    pub shard_level_metrics: bool,
    /// A consumer without progress for this long reports unhealthy.
    pub healthcheck_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_id: AppId::default(),
            consumer_app_id: AppId::default(),
            name: "default".to_string(),
            stream_name: String::new(),
            client_name: "default".to_string(),
            naming: NamingSettings::default(),
            consume_delay: Duration::ZERO,
            initial_position: InitialPosition::TrimHorizon,
            max_batch_size: MAX_BATCH_SIZE_LIMIT,
            wait_time: Duration::from_secs(1),
            persist_frequency: Duration::from_secs(5),
            discover_frequency: Duration::from_secs(60),
            release_delay: Duration::from_secs(5),
            keep_shard_order: true,
            shard_level_metrics: false,
            healthcheck_timeout: Duration::from_secs(300),
        }
    }
}

impl Settings {
    /// Loads settings from `SHARDLINE_*` environment variables on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        settings.app_id = AppId::from_env();
        settings.consumer_app_id = settings.app_id.clone();

        if let Some(name) = env_string("SHARDLINE_NAME") {
            settings.name = name;
        }
        if let Some(stream_name) = env_string("SHARDLINE_STREAM_NAME") {
            settings.stream_name = stream_name;
        }
        if let Some(client_name) = env_string("SHARDLINE_CLIENT_NAME") {
            settings.client_name = client_name;
        }
        if let Some(pattern) = env_string("SHARDLINE_NAMING_PATTERN") {
            settings.naming.pattern = pattern;
        }
        if let Some(delay) = env_millis("SHARDLINE_CONSUME_DELAY_MS")? {
            settings.consume_delay = delay;
        }
        if let Some(position) = env_string("SHARDLINE_INITIAL_POSITION") {
            settings.initial_position = position.parse()?;
        }
        if let Some(size) = env_usize("SHARDLINE_MAX_BATCH_SIZE")? {
            settings.max_batch_size = size;
        }
        if let Some(wait) = env_millis("SHARDLINE_WAIT_TIME_MS")? {
            settings.wait_time = wait;
        }
        if let Some(persist) = env_millis("SHARDLINE_PERSIST_FREQUENCY_MS")? {
            settings.persist_frequency = persist;
        }
        if let Some(discover) = env_millis("SHARDLINE_DISCOVER_FREQUENCY_MS")? {
            settings.discover_frequency = discover;
        }
        if let Some(delay) = env_millis("SHARDLINE_RELEASE_DELAY_MS")? {
            settings.release_delay = delay;
        }
        if let Some(keep) = env_bool("SHARDLINE_KEEP_SHARD_ORDER")? {
            settings.keep_shard_order = keep;
        }
        if let Some(shard_level) = env_bool("SHARDLINE_SHARD_LEVEL_METRICS")? {
            settings.shard_level_metrics = shard_level;
        }
        if let Some(timeout) = env_millis("SHARDLINE_HEALTHCHECK_TIMEOUT_MS")? {
            settings.healthcheck_timeout = timeout;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks the settings against their lower and upper bounds.
    ///
    /// # Errors
    ///
    /// Returns an invalid input error naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(invalid("stream_name is required"));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(invalid(format!(
                "max_batch_size must be within 1..={MAX_BATCH_SIZE_LIMIT}, got {}",
                self.max_batch_size
            )));
        }
        check_min("wait_time", self.wait_time, MIN_WAIT_TIME)?;
        check_min("persist_frequency", self.persist_frequency, MIN_PERSIST_FREQUENCY)?;
        check_min("discover_frequency", self.discover_frequency, MIN_DISCOVER_FREQUENCY)?;
        check_min("release_delay", self.release_delay, MIN_RELEASE_DELAY)?;
        if self.healthcheck_timeout.is_zero() {
            return Err(invalid("healthcheck_timeout must be positive"));
        }
        Ok(())
    }

    /// How long a client registration lives without being refreshed.
    #[must_use]
    pub fn client_timeout(&self) -> Duration {
        (self.discover_frequency * 5).max(Duration::from_secs(60))
    }

    /// How long a checkpoint lease lives without being persisted.
    #[must_use]
    pub fn checkpoint_timeout(&self) -> Duration {
        (self.persist_frequency * 5).max(Duration::from_secs(60))
    }
}

/// Settings of a record writer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWriterSettings {
    /// Identity used to expand the stream name.
    pub app_id: AppId,
    /// Name of the wire client configuration to use.
    pub client_name: String,
    /// Name of the stream before expansion.
    pub stream_name: String,
    /// Stream naming.
    pub naming: NamingSettings,
    /// Pauses between resubmissions of failed records.
    pub backoff: BackoffSettings,
}

impl Default for RecordWriterSettings {
    fn default() -> Self {
        Self {
            app_id: AppId::default(),
            client_name: "default".to_string(),
            stream_name: String::new(),
            naming: NamingSettings::default(),
            backoff: BackoffSettings::default(),
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Core(shardline_core::Error::InvalidInput(message.into()))
}

fn check_min(name: &str, value: Duration, min: Duration) -> Result<()> {
    if value < min {
        return Err(invalid(format!("{name} must be at least {min:?}, got {value:?}")));
    }
    Ok(())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| invalid(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| invalid(format!("{name} must be a usize: {e}")))
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_u64(name)?.map(Duration::from_millis))
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(Some(true)),
        "false" | "0" | "no" | "n" => Ok(Some(false)),
        _ => Err(invalid(format!("{name} must be a boolean (true/false/1/0)"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        Settings {
            stream_name: "events".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_defaults_are_valid_once_stream_is_named() {
        assert!(Settings::default().validate().is_err());
        valid().validate().expect("defaults should be valid");
    }

    #[test]
    fn test_lower_bounds_are_enforced() {
        let cases = [
            Settings { wait_time: Duration::ZERO, ..valid() },
            Settings { persist_frequency: Duration::from_millis(99), ..valid() },
            Settings { discover_frequency: Duration::from_millis(999), ..valid() },
            Settings { release_delay: Duration::from_millis(999), ..valid() },
            Settings { max_batch_size: 0, ..valid() },
            Settings { max_batch_size: 10_001, ..valid() },
        ];
        for settings in cases {
            assert!(settings.validate().is_err(), "{settings:?} should be invalid");
        }
    }

    #[test]
    fn test_timeouts_have_a_one_minute_floor() {
        let settings = Settings {
            discover_frequency: Duration::from_secs(1),
            persist_frequency: Duration::from_secs(30),
            ..valid()
        };

        assert_eq!(settings.client_timeout(), Duration::from_secs(60));
        assert_eq!(settings.checkpoint_timeout(), Duration::from_secs(150));
    }

    #[test]
    fn test_initial_position_parses() {
        assert_eq!("trim_horizon".parse::<InitialPosition>().ok(), Some(InitialPosition::TrimHorizon));
        assert_eq!("LATEST".parse::<InitialPosition>().ok(), Some(InitialPosition::Latest));

        let at = "AT_TIMESTAMP:2024-01-01T00:00:00Z"
            .parse::<InitialPosition>()
            .expect("timestamp should parse");
        assert!(matches!(at, InitialPosition::AtTimestamp(t) if t.timestamp() == 1_704_067_200));

        assert!("SOMEWHERE".parse::<InitialPosition>().is_err());
    }

    #[test]
    fn test_app_id_display() {
        let app_id = AppId::new("acme", "env", "billing", "grp", "producer");
        assert_eq!(app_id.to_string(), "acme-env-billing-grp-producer");
    }
}
