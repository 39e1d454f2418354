//! Batched appends to a stream.
//!
//! Records are submitted in sub-batches of at most [`MAX_BATCH_SIZE`]. The
//! log service accepts or rejects every entry of a sub-batch individually, so
//! a round only resubmits the rejected entries, pausing with exponential
//! backoff in between, until none are left.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use shardline_core::{ExponentialBackoff, MetricWriter, SharedClock, Unit};
use tracing::Instrument;
use ulid::Ulid;

use crate::client::{PutRecordsEntry, StreamClient};
use crate::config::RecordWriterSettings;
use crate::error::{Error, Result};
use crate::id::Stream;
use crate::metrics::{self as stream_metrics, names};
use crate::naming;

/// Maximum number of entries in one put request.
pub const MAX_BATCH_SIZE: usize = 500;

/// A record to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Payload.
    pub data: Bytes,
    /// Routes the record to a shard. Generated if neither key is set.
    pub partition_key: Option<String>,
    /// Routes the record to the shard owning this hash.
    pub explicit_hash_key: Option<String>,
}

impl WriteRecord {
    /// Creates a record routed by a generated partition key.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            partition_key: None,
            explicit_hash_key: None,
        }
    }

    /// Routes the record by `partition_key`.
    #[must_use]
    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }
}

/// Appends records to a stream.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Appends a single record.
    ///
    /// # Errors
    ///
    /// Returns an error if the put request fails.
    async fn put_record(&self, record: WriteRecord) -> Result<()> {
        self.put_records(vec![record]).await
    }

    /// Appends `records`, retrying rejected entries until all are accepted.
    ///
    /// # Errors
    ///
    /// Returns the failures of all sub-batches whose put request failed.
    async fn put_records(&self, records: Vec<WriteRecord>) -> Result<()>;
}

/// [`RecordWriter`] on top of a [`StreamClient`].
pub struct ClientRecordWriter {
    stream: Stream,
    settings: RecordWriterSettings,
    client: Arc<dyn StreamClient>,
    metric_writer: Arc<dyn MetricWriter>,
    clock: SharedClock,
}

impl std::fmt::Debug for ClientRecordWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecordWriter")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl ClientRecordWriter {
    /// Creates a writer for the stream named by `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream name can not be expanded.
    pub fn new(
        settings: RecordWriterSettings,
        client: Arc<dyn StreamClient>,
        metric_writer: Arc<dyn MetricWriter>,
        clock: SharedClock,
    ) -> Result<Self> {
        let stream = naming::stream_name(&settings.app_id, &settings.naming, &settings.stream_name)?;
        metric_writer.write(stream_metrics::writer_defaults(&stream));

        Ok(Self {
            stream,
            settings,
            client,
            metric_writer,
            clock,
        })
    }

    /// Returns the expanded stream name.
    #[must_use]
    pub const fn stream(&self) -> &Stream {
        &self.stream
    }

    async fn put_batch(&self, batch: &[WriteRecord]) -> Result<()> {
        let mut entries: Vec<PutRecordsEntry> = batch
            .iter()
            .map(|record| PutRecordsEntry {
                data: record.data.clone(),
                partition_key: match (&record.partition_key, &record.explicit_hash_key) {
                    (Some(key), _) => key.clone(),
                    (None, None) => Ulid::new().to_string(),
                    (None, Some(_)) => String::new(),
                },
                explicit_hash_key: record.explicit_hash_key.clone(),
            })
            .collect();

        let batch_id = Ulid::new().to_string();
        let started = self.clock.now();
        let mut backoff = ExponentialBackoff::new(self.settings.backoff);
        let mut attempt = 1;

        loop {
            let submitted = entries.len();
            let (failed, reason) = self.put_and_collect_failed(entries).await?;
            self.write_metrics(submitted, failed.len());
            let took = self.clock.since(started);

            if failed.is_empty() {
                if attempt > 1 {
                    tracing::warn!(batch_id = %batch_id, "PutRecords successful after {attempt} attempts in {took:?}");
                }
                return Ok(());
            }

            tracing::warn!(
                batch_id = %batch_id,
                "PutRecords failed {} of {submitted} records with reason: {reason}: after {attempt} attempts in {took:?}",
                failed.len()
            );

            entries = failed;
            self.clock.sleep(backoff.next_backoff()).await;
            attempt += 1;
        }
    }

    /// Submits `entries` and returns the rejected ones with a summary of the reasons.
    async fn put_and_collect_failed(&self, entries: Vec<PutRecordsEntry>) -> Result<(Vec<PutRecordsEntry>, String)> {
        let results = self.client.put_records(&self.stream, entries.clone()).await?;
        if results.len() != entries.len() {
            return Err(Error::Client(format!(
                "PutRecords returned {} results for {} records",
                results.len(),
                entries.len()
            )));
        }

        let mut failed = Vec::new();
        let mut reasons: BTreeMap<String, usize> = BTreeMap::new();
        for (entry, result) in entries.into_iter().zip(results) {
            if let Some(code) = result.error_code {
                failed.push(entry);
                *reasons.entry(code).or_default() += 1;
            }
        }

        let reason = reasons
            .iter()
            .map(|(code, count)| format!("{count} {code} errors"))
            .collect::<Vec<_>>()
            .join(", ");

        Ok((failed, reason))
    }

    #[allow(clippy::cast_precision_loss)]
    fn write_metrics(&self, submitted: usize, failed: usize) {
        self.metric_writer.write(vec![
            stream_metrics::stream_datum(&self.stream, names::PUT_RECORDS, (submitted - failed) as f64, Unit::Count),
            stream_metrics::stream_datum(&self.stream, names::PUT_RECORDS_FAILURE, failed as f64, Unit::Count),
            stream_metrics::stream_datum(
                &self.stream,
                names::PUT_RECORDS_BATCH_SIZE,
                submitted as f64,
                Unit::CountAverage,
            ),
        ]);
    }
}

#[async_trait]
impl RecordWriter for ClientRecordWriter {
    async fn put_records(&self, records: Vec<WriteRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let request_id = Ulid::new().to_string();
        let span = shardline_core::observability::writer_span(self.stream.as_str(), &request_id);

        async {
            let mut errors: Option<Error> = None;
            for chunk in records.chunks(MAX_BATCH_SIZE) {
                if let Err(err) = self.put_batch(chunk).await {
                    tracing::error!(error = %err, "can not write batch to stream");
                    errors = Some(match errors {
                        Some(previous) => previous.append(err),
                        None => err,
                    });
                }
            }
            errors.map_or(Ok(()), Err)
        }
        .instrument(span)
        .await
    }
}
