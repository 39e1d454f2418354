//! The consumer group member.
//!
//! A [`Coordinator`] registers its client, discovers the shards of the
//! stream and runs one [`ShardReader`] per shard assigned to it. Discovery
//! repeats every `discover_frequency`; whenever the client index, the
//! number of clients or the eligible shards change, the running readers are
//! drained and a new set is started.
//!
//! ## Partitioning
//!
//! Eligible shards are sorted by id. The shard at position `j` belongs to
//! the client with index `j mod totalClients`. Every client computes the same
//! assignment from the same client list, so no coordination beyond the
//! registrations is needed. A client list that is briefly out of date only
//! leads to contention on the checkpoints, which the leases resolve.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use shardline_core::{
    CancelToken, Datum, HealthTimer, KvStore, MetricWriter, SharedClock, TaskGroup, Ticker, Unit,
};
use tracing::Instrument;

use crate::client::StreamClient;
use crate::config::{AppId, Settings};
use crate::error::{Error, Result, merge};
use crate::handler::MessageHandler;
use crate::id::{ClientId, ShardId, Stream};
use crate::metadata::{KvMetadataRepository, MetadataRepository};
use crate::metrics::{self as stream_metrics, names};
use crate::naming;
use crate::shard_reader::{ReaderResources, ShardReader};

const SHARD_TASK_RATIO_INTERVAL: Duration = Duration::from_secs(60);

/// Diagnostic description of a running consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMetadata {
    /// Id of this client.
    pub client_id: ClientId,
    /// Configured consumer name.
    pub name: String,
    /// Identity the stream name was expanded with.
    pub stream_app_id: AppId,
    /// Stream name before expansion.
    pub stream_name: String,
    /// Expanded stream name.
    pub stream_name_full: Stream,
}

/// What one discovery pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContext {
    /// Position of this client among the live clients.
    pub client_index: usize,
    /// Number of live clients.
    pub total_clients: usize,
    /// Eligible shards, sorted.
    pub shard_ids: Vec<ShardId>,
}

/// State of one shard during discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardInfo {
    /// Some client consumed the shard completely.
    pub finished: bool,
    /// Shard this one was split or merged from.
    pub parent_shard_id: Option<ShardId>,
}

/// One member of a consumer group.
pub struct Coordinator {
    settings: Arc<Settings>,
    stream: Stream,
    client_id: ClientId,
    client: Arc<dyn StreamClient>,
    metadata: Arc<dyn MetadataRepository>,
    metric_writer: Arc<dyn MetricWriter>,
    clock: SharedClock,
    health: Arc<HealthTimer>,
    stop: CancelToken,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("stream", &self.stream)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator with a fresh client id, keeping its state in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the stream name can
    /// not be expanded.
    pub fn new(
        settings: Settings,
        client: Arc<dyn StreamClient>,
        store: Arc<dyn KvStore>,
        metric_writer: Arc<dyn MetricWriter>,
        clock: SharedClock,
    ) -> Result<Self> {
        let stream = naming::stream_name(&settings.app_id, &settings.naming, &settings.stream_name)?;
        let client_id = ClientId::generate();
        let metadata = Arc::new(KvMetadataRepository::new(
            store,
            Arc::clone(&clock),
            &stream,
            client_id,
            &settings,
        ));

        Self::with_metadata(settings, client_id, client, metadata, metric_writer, clock)
    }

    /// Creates a coordinator on top of an existing metadata repository.
    ///
    /// `client_id` has to be the id `metadata` registers and claims shards as.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the stream name can
    /// not be expanded.
    pub fn with_metadata(
        settings: Settings,
        client_id: ClientId,
        client: Arc<dyn StreamClient>,
        metadata: Arc<dyn MetadataRepository>,
        metric_writer: Arc<dyn MetricWriter>,
        clock: SharedClock,
    ) -> Result<Self> {
        settings.validate()?;

        let stream = naming::stream_name(&settings.app_id, &settings.naming, &settings.stream_name)?;
        let health = Arc::new(HealthTimer::new(Arc::clone(&clock), settings.healthcheck_timeout));

        Ok(Self {
            settings: Arc::new(settings),
            stream,
            client_id,
            client,
            metadata,
            metric_writer,
            clock,
            health,
            stop: CancelToken::new(),
        })
    }

    /// Returns the expanded stream name.
    #[must_use]
    pub const fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Returns the id of this client.
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Describes this consumer.
    #[must_use]
    pub fn consumer_metadata(&self) -> ConsumerMetadata {
        ConsumerMetadata {
            client_id: self.client_id,
            name: self.settings.name.clone(),
            stream_app_id: self.settings.app_id.clone(),
            stream_name: self.settings.stream_name.clone(),
            stream_name_full: self.stream.clone(),
        }
    }

    /// Returns true if the consumer made progress within the healthcheck timeout.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Asks a running [`Coordinator::run`] to wind down.
    ///
    /// Stopping is permanent: a later `run` only registers, deregisters
    /// again and returns.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Consumes the stream until `token` is canceled, [`Coordinator::stop`]
    /// is called, or a reader fails.
    ///
    /// The registration is removed on the way out, within `release_delay`
    /// of cancellation. The handler's `done` hook runs once before returning.
    ///
    /// # Errors
    ///
    /// Returns the first reader or discovery failure, merged with a failed
    /// deregistration. Cancellation alone is not an error.
    pub async fn run(&self, token: &CancelToken, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let span = shardline_core::observability::consumer_span(self.stream.as_str(), &self.client_id.to_string());
        self.run_in_span(token, handler).instrument(span).await
    }

    async fn run_in_span(&self, token: &CancelToken, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let token = token.child();
        let deregister = token.delayed(Arc::clone(&self.clock), self.settings.release_delay);

        tracing::info!("starting consumer");
        let result = self.discover(&token, &handler).await;
        token.cancel();

        let deregistered = deregister
            .token()
            .run_until_cancelled(self.metadata.deregister_client())
            .await
            .unwrap_or_else(|| Err(Error::canceled()));
        if let Err(err) = &deregistered {
            tracing::warn!(error = %err, "failed to deregister client");
        }

        handler.done();
        tracing::info!("consumer stopped");

        match merge(result, deregistered) {
            Err(err) if err.is_canceled() => Ok(()),
            other => other,
        }
    }

    async fn discover(&self, token: &CancelToken, handler: &Arc<dyn MessageHandler>) -> Result<()> {
        let mut context = RuntimeContext::default();

        match token.run_until_cancelled(self.refresh(&mut context)).await {
            None => return Ok(()),
            Some(Err(err)) if err.is_canceled() => return Ok(()),
            Some(Err(err)) => {
                tracing::error!(error = %err, "failed to load first list of shard ids and register as client");
                return Err(err);
            }
            Some(Ok(_)) => {}
        }

        let mut workers = self.start_workers(token, &context, handler);
        let mut ticker = Ticker::new(Arc::clone(&self.clock), self.settings.discover_frequency);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = self.stop.cancelled() => break,
                Some(result) = workers.join_next() => match result {
                    Err(err) if !err.is_canceled() => {
                        let drained = workers.shutdown().await;
                        return merge(Err(err), drained);
                    }
                    _ => {}
                },
                () = ticker.tick() => {
                    let changed = match token.run_until_cancelled(self.refresh(&mut context)).await {
                        None => break,
                        Some(Err(err)) if err.is_canceled() => break,
                        Some(Err(err)) => {
                            let drained = workers.shutdown().await;
                            return merge(Err(err), drained);
                        }
                        Some(Ok(changed)) => changed,
                    };

                    if changed {
                        tracing::info!(
                            client_index = context.client_index,
                            total_clients = context.total_clients,
                            shards = context.shard_ids.len(),
                            "shard assignment changed, restarting consumers"
                        );
                        match workers.shutdown().await {
                            Err(err) if !err.is_canceled() => return Err(err),
                            _ => {}
                        }
                        workers = self.start_workers(token, &context, handler);
                        ticker.reset(self.settings.discover_frequency);
                    }
                }
            }
        }

        match workers.shutdown().await {
            Err(err) if !err.is_canceled() => Err(err),
            _ => Ok(()),
        }
    }

    /// Registers the client and lists the shards. Returns true if the assignment changed.
    async fn refresh(&self, context: &mut RuntimeContext) -> Result<bool> {
        let (client_index, total_clients) = self.metadata.register_client().await?;
        let shard_ids = self.list_shard_ids().await?;

        let changed = context.client_index != client_index
            || context.total_clients != total_clients
            || context.shard_ids != shard_ids;

        context.client_index = client_index;
        context.total_clients = total_clients;
        if changed {
            context.shard_ids = shard_ids;
        }

        Ok(changed)
    }

    async fn list_shard_ids(&self) -> Result<Vec<ShardId>> {
        let mut shards = BTreeMap::new();
        let mut next_token = None;

        loop {
            let response = self.client.list_shards(&self.stream, next_token.take()).await?;
            for shard in response.shards {
                let finished = self.metadata.is_shard_finished(&shard.shard_id).await?;
                shards.insert(
                    shard.shard_id,
                    ShardInfo {
                        finished,
                        parent_shard_id: shard.parent_shard_id,
                    },
                );
            }

            match response.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        Ok(eligible_shards(&shards, self.settings.keep_shard_order))
    }

    fn start_workers(
        &self,
        token: &CancelToken,
        context: &RuntimeContext,
        handler: &Arc<dyn MessageHandler>,
    ) -> TaskGroup<Error> {
        let mut workers = TaskGroup::new(token.child());
        let assigned = assigned_shards(&context.shard_ids, context.client_index, context.total_clients);

        tracing::info!(
            assigned = assigned.len(),
            eligible = context.shard_ids.len(),
            "starting consumers"
        );

        let resources = ReaderResources {
            client: Arc::clone(&self.client),
            metadata: Arc::clone(&self.metadata),
            metric_writer: Arc::clone(&self.metric_writer),
            clock: Arc::clone(&self.clock),
            health: Arc::clone(&self.health),
        };

        let active = Arc::new(AtomicUsize::new(assigned.len()));

        for shard_id in assigned {
            let reader = Arc::new(ShardReader::new(
                self.stream.clone(),
                shard_id.clone(),
                Arc::clone(&self.settings),
                resources.clone(),
            ));
            let reader_token = workers.token().clone();
            let handler = Arc::clone(handler);
            let active = Arc::clone(&active);

            workers.spawn(
                async move {
                    tracing::info!(shard_id = %shard_id, "started consuming shard");
                    let result = reader.run(reader_token, handler).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    match &result {
                        Ok(()) => tracing::info!(shard_id = %shard_id, "done consuming shard"),
                        Err(err) => tracing::error!(shard_id = %shard_id, error = %err, "failed to consume from shard"),
                    }
                    result
                }
                .in_current_span(),
            );
        }

        // Readers mark the consumer healthy while they run; once none is left this takes over.
        let health = Arc::clone(&self.health);
        let mut ticker = Ticker::new(Arc::clone(&self.clock), self.settings.healthcheck_timeout / 2);
        let keepalive_token = workers.token().clone();
        workers.spawn(async move {
            loop {
                if active.load(Ordering::SeqCst) == 0 {
                    health.mark_healthy();
                }
                if keepalive_token.run_until_cancelled(ticker.tick()).await.is_none() {
                    return Ok(());
                }
            }
        });

        let ratio = shard_task_ratio(context.shard_ids.len(), context.total_clients);
        let metric_writer = Arc::clone(&self.metric_writer);
        let stream = self.stream.clone();
        let mut ticker = Ticker::new(Arc::clone(&self.clock), SHARD_TASK_RATIO_INTERVAL);
        let ratio_token = workers.token().clone();
        workers.spawn(async move {
            loop {
                metric_writer.write(vec![
                    Datum::new(names::SHARD_TASK_RATIO, ratio, Unit::CountMaximum),
                    stream_metrics::stream_datum(&stream, names::SHARD_TASK_RATIO, ratio, Unit::CountAverage),
                ]);
                if ratio_token.run_until_cancelled(ticker.tick()).await.is_none() {
                    return Ok(());
                }
            }
        });

        workers
    }
}

/// Returns the shards that may be consumed now, sorted.
///
/// Finished shards are never eligible. With `keep_shard_order`, a shard
/// whose parent is listed and unfinished has to wait; a parent missing from
/// the listing counts as no parent.
#[must_use]
pub fn eligible_shards(shards: &BTreeMap<ShardId, ShardInfo>, keep_shard_order: bool) -> Vec<ShardId> {
    shards
        .iter()
        .filter(|(_, info)| !info.finished)
        .filter(|(_, info)| {
            if !keep_shard_order {
                return true;
            }
            info.parent_shard_id
                .as_ref()
                .and_then(|parent| shards.get(parent))
                .is_none_or(|parent| parent.finished)
        })
        .map(|(shard_id, _)| shard_id.clone())
        .collect()
}

/// Returns the shards of `shard_ids` owned by the client at `client_index`.
#[must_use]
pub fn assigned_shards(shard_ids: &[ShardId], client_index: usize, total_clients: usize) -> Vec<ShardId> {
    if total_clients == 0 {
        return Vec::new();
    }
    shard_ids
        .iter()
        .skip(client_index)
        .step_by(total_clients)
        .cloned()
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn shard_task_ratio(eligible: usize, total_clients: usize) -> f64 {
    if total_clients == 0 {
        return 0.0;
    }
    eligible as f64 / total_clients as f64 * 100.0
}
