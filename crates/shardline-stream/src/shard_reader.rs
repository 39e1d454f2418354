//! Consumption of a single shard.
//!
//! A [`ShardReader`] claims its shard through the metadata repository, reads
//! it batch by batch and hands every record to the handler. Three tasks run
//! while the shard is claimed:
//!
//! - the read loop, which advances the checkpoint after every record
//! - the persister, which writes the checkpoint every `persist_frequency`
//! - the lag reporter, which writes `MillisecondsBehind` on change and every 15 s
//!
//! The checkpoint is released on every exit path. Releasing swaps the active
//! checkpoint for [`CheckpointSlot::Released`], so whichever task releases
//! first does the work and the others see a no-op.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use shardline_core::clock::{self, SharedClock};
use shardline_core::{CancelToken, HealthTimer, MetricWriter, TaskGroup, Ticker, Timer, Unit};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::checkpoint::Checkpoint;
use crate::client::{IteratorPosition, Record, StreamClient};
use crate::config::{InitialPosition, Settings};
use crate::error::{Error, Result, merge};
use crate::handler::MessageHandler;
use crate::id::{SequenceNumber, ShardId, ShardIterator, Stream};
use crate::metadata::MetadataRepository;
use crate::metrics::{self as stream_metrics, names};

const MILLISECONDS_BEHIND_INTERVAL: Duration = Duration::from_secs(15);

/// The checkpoint a reader currently works with.
#[derive(Debug, Clone)]
pub enum CheckpointSlot {
    /// A claimed checkpoint.
    Active(Arc<dyn Checkpoint>),
    /// Nothing claimed, or already handed back. Every operation is a no-op.
    Released,
}

/// Collaborators a shard reader needs.
#[derive(Clone)]
pub struct ReaderResources {
    /// Wire client.
    pub client: Arc<dyn StreamClient>,
    /// Leases and checkpoints.
    pub metadata: Arc<dyn MetadataRepository>,
    /// Metric sink.
    pub metric_writer: Arc<dyn MetricWriter>,
    /// Time source.
    pub clock: SharedClock,
    /// Liveness of the consumer the reader belongs to.
    pub health: Arc<HealthTimer>,
}

enum Claim {
    Acquired(Arc<dyn Checkpoint>),
    Finished,
    Canceled,
}

/// Reads one shard until it is finished, the reader is canceled, or an error occurs.
pub struct ShardReader {
    stream: Stream,
    shard_id: ShardId,
    settings: Arc<Settings>,
    resources: ReaderResources,
    checkpoint: Mutex<CheckpointSlot>,
}

impl ShardReader {
    /// Creates a reader for `shard_id`.
    #[must_use]
    pub fn new(stream: Stream, shard_id: ShardId, settings: Arc<Settings>, resources: ReaderResources) -> Self {
        resources.metric_writer.write(stream_metrics::with_shard_level(
            stream_metrics::reader_defaults(&stream),
            &shard_id,
            settings.shard_level_metrics,
        ));

        Self {
            stream,
            shard_id,
            settings,
            resources,
            checkpoint: Mutex::new(CheckpointSlot::Released),
        }
    }

    /// Returns the shard this reader consumes.
    #[must_use]
    pub const fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Consumes the shard.
    ///
    /// Returns `Ok(())` when the shard is finished (by this or another
    /// client), when the reader is canceled, or when it could not claim the
    /// shard before cancellation.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error, merged with any error from releasing
    /// the checkpoint.
    pub async fn run(self: Arc<Self>, token: CancelToken, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let span = shardline_core::observability::shard_span(self.stream.as_str(), self.shard_id.as_str());
        self.run_in_span(token, handler).instrument(span).await
    }

    async fn run_in_span(self: Arc<Self>, token: CancelToken, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let checkpoint = match self.acquire(&token).await? {
            Claim::Acquired(checkpoint) => checkpoint,
            Claim::Finished => {
                tracing::info!("shard is already finished");
                return Ok(());
            }
            Claim::Canceled => {
                tracing::info!("could not acquire shard, leaving");
                return Ok(());
            }
        };

        tracing::info!("acquired shard");
        self.set_checkpoint(CheckpointSlot::Active(checkpoint));

        let release = token.delayed(Arc::clone(&self.resources.clock), self.settings.release_delay);
        let result = Arc::clone(&self).consume(&token, release.token(), handler).await;
        let released = self.release_checkpoint(release.token()).await;

        tracing::info!("released shard");
        merge(result, released)
    }

    async fn acquire(&self, token: &CancelToken) -> Result<Claim> {
        let started = self.resources.clock.now();

        loop {
            self.resources.health.mark_healthy();

            let acquired = match token
                .run_until_cancelled(self.resources.metadata.acquire_shard(&self.shard_id))
                .await
            {
                None => return Ok(Claim::Canceled),
                Some(Err(Error::ShardAlreadyFinished)) => return Ok(Claim::Finished),
                Some(Err(err)) if err.is_canceled() => return Ok(Claim::Canceled),
                Some(result) => result?,
            };

            if let Some(checkpoint) = acquired {
                let delay = self.resources.clock.since(started);
                self.write_metric(names::ACQUIRE_SHARD_DELAY_SECONDS, delay.as_secs_f64(), Unit::Seconds);
                return Ok(Claim::Acquired(checkpoint));
            }

            let wait = self.resources.clock.sleep(self.settings.wait_time);
            if token.run_until_cancelled(wait).await.is_none() {
                return Ok(Claim::Canceled);
            }
        }
    }

    async fn consume(
        self: Arc<Self>,
        token: &CancelToken,
        release_token: &CancelToken,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let iterator = match token.run_until_cancelled(self.start_iterator()).await {
            None => return Ok(()),
            Some(Err(err)) if err.is_canceled() => return Ok(()),
            Some(result) => result?,
        };

        let mut group: TaskGroup<Error> = TaskGroup::new(token.child());
        let (lag_tx, lag_rx) = mpsc::unbounded_channel();

        {
            // Drains the channel until the read loop drops its sender, even after cancellation.
            let reader = Arc::clone(&self);
            group.spawn(
                async move {
                    reader.report_milliseconds_behind(lag_rx).await;
                    Ok(())
                }
                .in_current_span(),
            );
        }

        let persister_token = group.token().child();
        {
            let reader = Arc::clone(&self);
            let persister_token = persister_token.clone();
            let release_token = release_token.clone();
            group.spawn(
                async move { reader.run_persister(&persister_token, &release_token).await }.in_current_span(),
            );
        }

        {
            let reader = Arc::clone(&self);
            let iterate_token = group.token().clone();
            let release_token = release_token.clone();
            group.spawn(
                async move {
                    let result = reader.iterate(&iterate_token, lag_tx, iterator, handler).await;
                    persister_token.cancel();
                    let released = reader.release_checkpoint(&release_token).await;
                    merge(result, released)
                }
                .in_current_span(),
            );
        }

        group.wait().await
    }

    async fn start_iterator(&self) -> Result<Option<ShardIterator>> {
        let sequence_number = self.sequence_number().await?;

        if let Some(saved) = self.shard_iterator().await? {
            match self.resources.client.get_records(&saved, 1).await {
                Ok(probe) if probe.records.is_empty() => {
                    tracing::debug!("reusing stored shard iterator, nothing new since it was stored");
                    return Ok(probe.next_iterator);
                }
                Ok(_) => {
                    tracing::debug!("reusing stored shard iterator");
                    return Ok(Some(saved));
                }
                Err(Error::ExpiredIterator) => {
                    tracing::info!("stored shard iterator expired, resolving from sequence number");
                }
                Err(err) => return Err(err),
            }
        }

        self.resolve_iterator(sequence_number).await
    }

    async fn resolve_iterator(&self, sequence_number: Option<SequenceNumber>) -> Result<Option<ShardIterator>> {
        let position = match sequence_number {
            Some(sequence_number) => IteratorPosition::AfterSequenceNumber(sequence_number),
            None => match self.settings.initial_position {
                InitialPosition::TrimHorizon => IteratorPosition::TrimHorizon,
                InitialPosition::Latest => IteratorPosition::Latest,
                InitialPosition::AtTimestamp(timestamp) => IteratorPosition::AtTimestamp(timestamp),
            },
        };

        self.resources
            .client
            .get_shard_iterator(&self.stream, &self.shard_id, position)
            .await
    }

    async fn iterate(
        &self,
        token: &CancelToken,
        lag: mpsc::UnboundedSender<u64>,
        mut iterator: Option<ShardIterator>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let clock = &self.resources.clock;
        let mut timer = Timer::new(Arc::clone(clock), Duration::ZERO);
        let mut last_sequence_number = self.sequence_number().await?;

        loop {
            self.resources.health.mark_healthy();

            let Some(current) = iterator.clone() else {
                self.done(last_sequence_number).await?;
                tracing::info!("shard is finished");
                return Ok(());
            };

            if token.run_until_cancelled(timer.wait()).await.is_none() {
                return Ok(());
            }

            let started = clock.now();
            let response = match token
                .run_until_cancelled(self.resources.client.get_records(&current, self.settings.max_batch_size))
                .await
            {
                None => return Ok(()),
                Some(Err(Error::ExpiredIterator)) => {
                    tracing::info!("shard iterator expired, requesting a new one");
                    let sequence_number = self.sequence_number().await?;
                    iterator = match token.run_until_cancelled(self.resolve_iterator(sequence_number)).await {
                        None => return Ok(()),
                        Some(result) => result?,
                    };
                    timer.reset(Duration::ZERO);
                    continue;
                }
                Some(Err(err)) if err.is_canceled() => return Ok(()),
                Some(result) => result?,
            };

            self.write_metric(names::READ_COUNT, 1.0, Unit::Count);
            if lag.send(response.millis_behind_latest).is_err() {
                tracing::debug!("milliseconds behind reporter is gone, dropping lag sample");
            }

            let process_started = clock.now();
            let mut processed = 0usize;
            for record in &response.records {
                if !self.delay(token, record).await {
                    break;
                }

                if let Err(err) = handler.handle(&record.data).await {
                    tracing::error!(sequence_number = %record.sequence_number, error = %err, "failed to handle record");
                    self.write_metric(names::FAILED_RECORDS, 1.0, Unit::Count);
                }

                last_sequence_number = Some(record.sequence_number.clone());
                self.advance(last_sequence_number.clone(), None).await?;
                processed += 1;

                if token.is_cancelled() {
                    break;
                }
            }

            tracing::info!(records = processed, "processed batch of {processed} records");
            self.write_metric(names::READ_RECORDS, count(processed), Unit::Count);
            self.write_metric(
                names::PROCESS_DURATION,
                millis(clock.since(process_started)),
                Unit::MillisecondsAverage,
            );

            if processed < response.records.len() {
                // Canceled mid-batch; the stored sequence number marks the resume point.
                return Ok(());
            }

            if response.records.is_empty() {
                self.advance(last_sequence_number.clone(), Some(current)).await?;
            } else {
                self.advance(last_sequence_number.clone(), response.next_iterator.clone())
                    .await?;
            }

            let wait = self.pause(response.millis_behind_latest, clock.since(started));
            self.write_metric(names::WAIT_DURATION, millis(wait), Unit::MillisecondsAverage);
            timer.reset(wait);

            iterator = response.next_iterator;
        }
    }

    fn pause(&self, millis_behind_latest: u64, elapsed: Duration) -> Duration {
        let caught_up = self.settings.wait_time + self.settings.consume_delay;
        if u128::from(millis_behind_latest) > caught_up.as_millis() {
            return Duration::ZERO;
        }
        self.settings.wait_time.saturating_sub(elapsed)
    }

    /// Holds a record back until it is older than the consume delay. Returns false if canceled.
    async fn delay(&self, token: &CancelToken, record: &Record) -> bool {
        if self.settings.consume_delay.is_zero() {
            return true;
        }
        let Some(arrival) = record.approximate_arrival else {
            return true;
        };

        let clock = &self.resources.clock;
        let ready_at = clock::add(arrival, self.settings.consume_delay);
        let sleep = (ready_at - clock.now()).to_std().unwrap_or(Duration::ZERO);
        if sleep.is_zero() {
            return true;
        }

        self.write_metric(names::SLEEP_DURATION, millis(sleep), Unit::MillisecondsAverage);
        token.run_until_cancelled(clock.sleep_until(ready_at)).await.is_some()
    }

    async fn run_persister(&self, token: &CancelToken, release_token: &CancelToken) -> Result<()> {
        let mut ticker = Ticker::new(Arc::clone(&self.resources.clock), self.settings.persist_frequency);

        loop {
            if token.run_until_cancelled(ticker.tick()).await.is_none() {
                return Ok(());
            }

            let should_release = match token.run_until_cancelled(self.persist()).await {
                // Canceled while writing; releasing is the successful way out.
                None => true,
                Some(Err(err)) if err.is_canceled() => true,
                Some(result) => result?,
            };

            if should_release {
                return self.release_checkpoint(release_token).await;
            }
        }
    }

    async fn report_milliseconds_behind(&self, mut lag: mpsc::UnboundedReceiver<u64>) {
        let mut ticker = Ticker::new(Arc::clone(&self.resources.clock), MILLISECONDS_BEHIND_INTERVAL);
        let mut current = 0;
        self.write_metric(names::MILLISECONDS_BEHIND, 0.0, Unit::MillisecondsMaximum);

        loop {
            tokio::select! {
                () = ticker.tick() => {}
                next = lag.recv() => match next {
                    Some(next) => current = next,
                    None => return,
                },
            }
            self.write_metric(names::MILLISECONDS_BEHIND, count_u64(current), Unit::MillisecondsMaximum);
        }
    }

    async fn release_checkpoint(&self, token: &CancelToken) -> Result<()> {
        let CheckpointSlot::Active(checkpoint) = self.take_checkpoint() else {
            return Ok(());
        };

        // Persist first so progress made since the last tick is not lost.
        token
            .run_until_cancelled(checkpoint.persist())
            .await
            .ok_or_else(Error::canceled)??;
        token
            .run_until_cancelled(checkpoint.release())
            .await
            .ok_or_else(Error::canceled)?
    }

    fn write_metric(&self, name: &str, value: f64, unit: Unit) {
        let datum = stream_metrics::stream_datum(&self.stream, name, value, unit);
        self.resources.metric_writer.write(stream_metrics::with_shard_level(
            vec![datum],
            &self.shard_id,
            self.settings.shard_level_metrics,
        ));
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, CheckpointSlot> {
        self.checkpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkpoint(&self) -> CheckpointSlot {
        self.slot().clone()
    }

    fn set_checkpoint(&self, slot: CheckpointSlot) {
        *self.slot() = slot;
    }

    fn take_checkpoint(&self) -> CheckpointSlot {
        std::mem::replace(&mut *self.slot(), CheckpointSlot::Released)
    }

    async fn sequence_number(&self) -> Result<Option<SequenceNumber>> {
        match self.checkpoint() {
            CheckpointSlot::Active(checkpoint) => checkpoint.sequence_number().await,
            CheckpointSlot::Released => Ok(None),
        }
    }

    async fn shard_iterator(&self) -> Result<Option<ShardIterator>> {
        match self.checkpoint() {
            CheckpointSlot::Active(checkpoint) => checkpoint.shard_iterator().await,
            CheckpointSlot::Released => Ok(None),
        }
    }

    async fn advance(&self, sequence_number: Option<SequenceNumber>, iterator: Option<ShardIterator>) -> Result<()> {
        match self.checkpoint() {
            CheckpointSlot::Active(checkpoint) => checkpoint.advance(sequence_number, iterator).await,
            CheckpointSlot::Released => Ok(()),
        }
    }

    async fn done(&self, sequence_number: Option<SequenceNumber>) -> Result<()> {
        match self.checkpoint() {
            CheckpointSlot::Active(checkpoint) => checkpoint.done(sequence_number).await,
            CheckpointSlot::Released => Ok(()),
        }
    }

    async fn persist(&self) -> Result<bool> {
        match self.checkpoint() {
            CheckpointSlot::Active(checkpoint) => checkpoint.persist().await,
            CheckpointSlot::Released => Ok(false),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn millis(duration: Duration) -> f64 {
    duration.as_millis() as f64
}

#[allow(clippy::cast_precision_loss)]
fn count(value: usize) -> f64 {
    value as f64
}

#[allow(clippy::cast_precision_loss)]
fn count_u64(value: u64) -> f64 {
    value as f64
}
