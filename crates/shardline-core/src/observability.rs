//! Observability infrastructure for shardline.
//!
//! Structured logging through `tracing` with consistent spans. Consumers
//! attach the stream and client id to every line, shard readers add the
//! shard id on top.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown log format '{other}', expected json or pretty"
            ))),
        }
    }
}

/// Directives used when neither `SHARDLINE_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_DIRECTIVES: &str = "warn,shardline_core=info,shardline_stream=info";

/// Initializes the logging subsystem.
///
/// Call once at application startup. Later calls are no-ops.
///
/// JSON lines carry the fields of the innermost span (`stream`, `client_id`,
/// `shard_id`) next to the event fields.
///
/// # Environment Variables
///
/// - `SHARDLINE_LOG`: filter directives, e.g. `shardline_stream=debug`
/// - `RUST_LOG`: used if `SHARDLINE_LOG` is unset
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let filter = env_filter();

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .json()
                            .flatten_event(true)
                            .with_current_span(true)
                            .with_span_list(false),
                    )
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().pretty().with_file(false).with_line_number(false))
                    .init();
            }
        }
    });
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SHARDLINE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Creates the span a consumer group member runs in.
#[must_use]
pub fn consumer_span(stream: &str, client_id: &str) -> Span {
    tracing::info_span!("consumer", stream = stream, client_id = client_id)
}

/// Creates the span a single shard reader runs in.
#[must_use]
pub fn shard_span(stream: &str, shard_id: &str) -> Span {
    tracing::info_span!("shard", stream = stream, shard_id = shard_id)
}

/// Creates the span of one batched write.
#[must_use]
pub fn writer_span(stream: &str, request_id: &str) -> Span {
    tracing::info_span!("record_writer", stream = stream, request_id = request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_default_directives_are_valid() {
        let filter = EnvFilter::try_new(DEFAULT_DIRECTIVES).expect("directives should parse");
        let rendered = filter.to_string();
        assert!(rendered.contains("shardline_stream=info"));
        assert!(rendered.contains("warn"));
    }

    #[test]
    fn test_log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert_eq!(" pretty ".parse::<LogFormat>().ok(), Some(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_spans_accept_events() {
        let span = shard_span("project-env-family-group-events", "shardId-000000000000");
        let _guard = span.enter();
        tracing::info!("message in shard span");
    }
}
