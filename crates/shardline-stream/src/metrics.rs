//! Metrics written by consumers and record writers.
//!
//! ## Metrics Written
//!
//! | Metric | Unit | Dimensions | Description |
//! |--------|------|------------|-------------|
//! | `ReadCount` | Count | `StreamName` (+ `ShardId`) | Reads issued |
//! | `ReadRecords` | Count | `StreamName` (+ `ShardId`) | Records read |
//! | `FailedRecords` | Count | `StreamName` (+ `ShardId`) | Records the handler rejected |
//! | `ProcessDuration` | Milliseconds (avg) | `StreamName` (+ `ShardId`) | Handler time per batch |
//! | `WaitDuration` | Milliseconds (avg) | `StreamName` (+ `ShardId`) | Pause between reads |
//! | `SleepDuration` | Milliseconds (avg) | `StreamName` (+ `ShardId`) | Consume delay waits |
//! | `MillisecondsBehind` | Milliseconds (max) | `StreamName` (+ `ShardId`) | Lag behind the shard tip |
//! | `AcquireShardDelaySeconds` | Seconds | `StreamName` (+ `ShardId`) | Time until a shard was claimed |
//! | `ShardTaskRatio` | Count (max / avg) | none / `StreamName` | Eligible shards per client, in percent |
//! | `PutRecords` | Count | `StreamName` | Records written |
//! | `PutRecordsFailure` | Count | `StreamName` | Records rejected in a round |
//! | `PutRecordsBatchSize` | Count (avg) | `StreamName` | Records submitted per round |

use shardline_core::{Datum, Unit};

use crate::id::{ShardId, Stream};

/// Metric names.
pub mod names {
    /// Reads issued.
    pub const READ_COUNT: &str = "ReadCount";
    /// Records read.
    pub const READ_RECORDS: &str = "ReadRecords";
    /// Records the handler rejected.
    pub const FAILED_RECORDS: &str = "FailedRecords";
    /// Handler time per batch.
    pub const PROCESS_DURATION: &str = "ProcessDuration";
    /// Pause between reads.
    pub const WAIT_DURATION: &str = "WaitDuration";
    /// Consume delay waits.
    pub const SLEEP_DURATION: &str = "SleepDuration";
    /// Lag behind the shard tip.
    pub const MILLISECONDS_BEHIND: &str = "MillisecondsBehind";
    /// Time until a shard was claimed.
    pub const ACQUIRE_SHARD_DELAY_SECONDS: &str = "AcquireShardDelaySeconds";
    /// Eligible shards per client, in percent.
    pub const SHARD_TASK_RATIO: &str = "ShardTaskRatio";
    /// Records written.
    pub const PUT_RECORDS: &str = "PutRecords";
    /// Records rejected in a round.
    pub const PUT_RECORDS_FAILURE: &str = "PutRecordsFailure";
    /// Records submitted per round.
    pub const PUT_RECORDS_BATCH_SIZE: &str = "PutRecordsBatchSize";
}

/// Dimension names.
pub mod dimensions {
    /// Full stream name.
    pub const STREAM_NAME: &str = "StreamName";
    /// Shard id, only with shard level metrics.
    pub const SHARD_ID: &str = "ShardId";
}

/// Builds a datum carrying the stream dimension.
#[must_use]
pub fn stream_datum(stream: &Stream, name: &str, value: f64, unit: Unit) -> Datum {
    Datum::new(name, value, unit).with_dimension(dimensions::STREAM_NAME, stream.as_str())
}

/// Returns `data` plus a copy of every datum with a shard dimension when `shard_level` is set.
#[must_use]
pub fn with_shard_level(mut data: Vec<Datum>, shard_id: &ShardId, shard_level: bool) -> Vec<Datum> {
    if shard_level {
        let shard_data: Vec<Datum> = data
            .iter()
            .cloned()
            .map(|datum| datum.with_dimension(dimensions::SHARD_ID, shard_id.as_str()))
            .collect();
        data.extend(shard_data);
    }
    data
}

/// Zero data written when a shard reader is created, so idle streams report values.
#[must_use]
pub fn reader_defaults(stream: &Stream) -> Vec<Datum> {
    [names::READ_COUNT, names::READ_RECORDS, names::FAILED_RECORDS]
        .into_iter()
        .map(|name| stream_datum(stream, name, 0.0, Unit::Count))
        .collect()
}

/// Zero data written when a record writer is created.
#[must_use]
pub fn writer_defaults(stream: &Stream) -> Vec<Datum> {
    vec![
        stream_datum(stream, names::PUT_RECORDS, 0.0, Unit::Count),
        stream_datum(stream, names::PUT_RECORDS_FAILURE, 0.0, Unit::Count),
        stream_datum(stream, names::PUT_RECORDS_BATCH_SIZE, 0.0, Unit::CountAverage),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_level_duplicates_data() {
        let stream = Stream::from("events");
        let shard = ShardId::from("shardId-000000000000");
        let data = vec![stream_datum(&stream, names::READ_COUNT, 1.0, Unit::Count)];

        assert_eq!(with_shard_level(data.clone(), &shard, false).len(), 1);

        let duplicated = with_shard_level(data, &shard, true);
        assert_eq!(duplicated.len(), 2);
        assert!(!duplicated[0].dimensions.contains_key(dimensions::SHARD_ID));
        assert_eq!(
            duplicated[1].dimensions.get(dimensions::SHARD_ID).map(String::as_str),
            Some("shardId-000000000000")
        );
    }

    #[test]
    fn test_defaults_are_zero() {
        let stream = Stream::from("events");
        assert!(reader_defaults(&stream).iter().all(|d| d.value.abs() < f64::EPSILON));
        assert_eq!(writer_defaults(&stream)[2].unit, Unit::CountAverage);
    }
}
