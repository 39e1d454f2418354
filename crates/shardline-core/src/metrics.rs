//! Metric sink abstraction.
//!
//! Components describe measurements as [`Datum`] values and hand them to a
//! [`MetricWriter`]. Writers never block the caller. Three writers ship with
//! this crate:
//!
//! | Writer | Use |
//! |--------|-----|
//! | [`FacadeMetricWriter`] | Forwards to the `metrics` crate facade (Prometheus etc.) |
//! | [`MemoryMetricWriter`] | Keeps every datum in memory for assertions |
//! | [`NoopMetricWriter`] | Discards everything |
//!
//! ## Unit mapping for the facade
//!
//! | Unit | Facade instrument |
//! |------|-------------------|
//! | `Count` | counter |
//! | `CountAverage`, `CountMaximum`, `MillisecondsMaximum` | gauge |
//! | `Milliseconds`, `MillisecondsAverage`, `Seconds` | histogram |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use metrics::{Label, counter, gauge, histogram};

/// Dimensions attached to a datum.
pub type Dimensions = BTreeMap<String, String>;

/// Delivery priority of a datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// May be sampled or dropped under pressure.
    #[default]
    Low,
    /// Always delivered.
    High,
}

/// Unit and aggregation of a datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unit {
    /// A count, summed.
    #[default]
    Count,
    /// A count, averaged.
    CountAverage,
    /// A count, maximum taken.
    CountMaximum,
    /// Milliseconds, summed.
    Milliseconds,
    /// Milliseconds, averaged.
    MillisecondsAverage,
    /// Milliseconds, maximum taken.
    MillisecondsMaximum,
    /// Seconds.
    Seconds,
}

/// A single measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    /// Delivery priority.
    pub priority: Priority,
    /// Time of the measurement; `None` means "now".
    pub timestamp: Option<DateTime<Utc>>,
    /// Metric name.
    pub name: String,
    /// Dimensions.
    pub dimensions: Dimensions,
    /// Measured value.
    pub value: f64,
    /// Unit and aggregation.
    pub unit: Unit,
}

impl Datum {
    /// Creates a high priority datum without dimensions.
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64, unit: Unit) -> Self {
        Self {
            priority: Priority::High,
            timestamp: None,
            name: name.into(),
            dimensions: Dimensions::new(),
            value,
            unit,
        }
    }

    /// Adds a dimension.
    #[must_use]
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Fire-and-forget sink for metric data.
pub trait MetricWriter: Send + Sync + fmt::Debug {
    /// Writes a batch of data.
    fn write(&self, data: Vec<Datum>);

    /// Writes a single datum.
    fn write_one(&self, datum: Datum) {
        self.write(vec![datum]);
    }
}

/// Forwards data to the `metrics` crate facade.
///
/// Metric names are prefixed and converted to snake case, dimensions become labels.
#[derive(Debug, Clone)]
pub struct FacadeMetricWriter {
    prefix: String,
}

impl FacadeMetricWriter {
    /// Creates a writer emitting `<prefix>_<snake_case_name>`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn metric_name(&self, name: &str) -> String {
        let mut out = String::with_capacity(self.prefix.len() + name.len() + 8);
        out.push_str(&self.prefix);
        out.push('_');
        for (i, c) in name.chars().enumerate() {
            if c.is_ascii_uppercase() {
                if i > 0 {
                    out.push('_');
                }
                out.push(c.to_ascii_lowercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl Default for FacadeMetricWriter {
    fn default() -> Self {
        Self::new("shardline")
    }
}

impl MetricWriter for FacadeMetricWriter {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn write(&self, data: Vec<Datum>) {
        for datum in data {
            let name = self.metric_name(&datum.name);
            let labels: Vec<Label> = datum
                .dimensions
                .iter()
                .map(|(k, v)| Label::new(k.clone(), v.clone()))
                .collect();

            match datum.unit {
                Unit::Count => counter!(name, labels).increment(datum.value.max(0.0).round() as u64),
                Unit::CountAverage | Unit::CountMaximum | Unit::MillisecondsMaximum => {
                    gauge!(name, labels).set(datum.value);
                }
                Unit::Milliseconds | Unit::MillisecondsAverage | Unit::Seconds => {
                    histogram!(name, labels).record(datum.value);
                }
            }
        }
    }
}

/// Records every datum in memory.
#[derive(Debug, Default)]
pub struct MemoryMetricWriter {
    data: Mutex<Vec<Datum>>,
}

impl MemoryMetricWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything written so far.
    #[must_use]
    pub fn data(&self) -> Vec<Datum> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns every datum with the given name.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<Datum> {
        self.data()
            .into_iter()
            .filter(|datum| datum.name == name)
            .collect()
    }

    /// Returns the sum of all values written under `name`.
    #[must_use]
    pub fn sum(&self, name: &str) -> f64 {
        self.named(name).iter().map(|datum| datum.value).sum()
    }
}

impl MetricWriter for MemoryMetricWriter {
    fn write(&self, data: Vec<Datum>) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(data);
    }
}

/// Discards every datum.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricWriter;

impl MetricWriter for NoopMetricWriter {
    fn write(&self, _data: Vec<Datum>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_writer_collects_data() {
        let writer = MemoryMetricWriter::new();
        writer.write_one(Datum::new("ReadCount", 1.0, Unit::Count));
        writer.write(vec![
            Datum::new("ReadCount", 2.0, Unit::Count).with_dimension("StreamName", "s"),
            Datum::new("ReadRecords", 5.0, Unit::Count),
        ]);

        assert_eq!(writer.named("ReadCount").len(), 2);
        assert!((writer.sum("ReadCount") - 3.0).abs() < f64::EPSILON);
        assert_eq!(
            writer.named("ReadCount")[1].dimensions.get("StreamName"),
            Some(&"s".to_string())
        );
    }

    #[test]
    fn test_facade_metric_names_are_snake_case() {
        let writer = FacadeMetricWriter::default();
        assert_eq!(writer.metric_name("MillisecondsBehind"), "shardline_milliseconds_behind");
        assert_eq!(writer.metric_name("ReadCount"), "shardline_read_count");
    }

    #[test]
    fn test_facade_writer_accepts_all_units() {
        // No recorder installed: the facade must accept the calls without panicking.
        let writer = FacadeMetricWriter::default();
        for unit in [
            Unit::Count,
            Unit::CountAverage,
            Unit::CountMaximum,
            Unit::Milliseconds,
            Unit::MillisecondsAverage,
            Unit::MillisecondsMaximum,
            Unit::Seconds,
        ] {
            writer.write_one(Datum::new("ShardTaskRatio", 100.0, unit).with_dimension("StreamName", "s"));
        }
    }
}
