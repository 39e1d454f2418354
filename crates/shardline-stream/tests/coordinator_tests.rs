//! End-to-end consumer group tests with a fake clock.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use shardline_core::{CancelToken, FakeClock, KvStore, MemoryKvStore, MemoryMetricWriter};
use shardline_stream::checkpoint::{Checkpoint, CheckpointRecord};
use shardline_stream::metadata::{checkpoint_namespace, client_namespace};
use shardline_stream::metrics::names;
use shardline_stream::{
    ClientId, Coordinator, Error, KvMetadataRepository, MetadataRepository, Result, Settings, ShardId, Stream,
};
use shardline_test_utils::{
    CollectingHandler, Fault, MemoryStreamClient, init_test_logging, test_app_id, test_clock, test_settings,
};

#[derive(Debug, Clone, Copy)]
enum Deregistration {
    Fail,
    Hang,
}

/// Key-value backed metadata whose deregistration fails or never completes.
struct ScriptedMetadata {
    inner: KvMetadataRepository,
    deregistration: Deregistration,
    deregister_calls: AtomicUsize,
}

impl ScriptedMetadata {
    fn deregister_calls(&self) -> usize {
        self.deregister_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataRepository for ScriptedMetadata {
    async fn register_client(&self) -> Result<(usize, usize)> {
        self.inner.register_client().await
    }

    async fn deregister_client(&self) -> Result<()> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        match self.deregistration {
            Deregistration::Fail => Err(Error::Client("metadata store unavailable".to_string())),
            Deregistration::Hang => std::future::pending().await,
        }
    }

    async fn is_shard_finished(&self, shard_id: &ShardId) -> Result<bool> {
        self.inner.is_shard_finished(shard_id).await
    }

    async fn acquire_shard(&self, shard_id: &ShardId) -> Result<Option<Arc<dyn Checkpoint>>> {
        self.inner.acquire_shard(shard_id).await
    }
}

struct Harness {
    clock: Arc<FakeClock>,
    store: Arc<MemoryKvStore>,
    client: MemoryStreamClient,
    metrics: Arc<MemoryMetricWriter>,
}

impl Harness {
    fn new() -> Self {
        init_test_logging();
        let clock = test_clock();
        Self {
            store: Arc::new(MemoryKvStore::new(clock.clone())),
            clock,
            client: MemoryStreamClient::new(),
            metrics: Arc::new(MemoryMetricWriter::new()),
        }
    }

    fn coordinator(&self, settings: Settings) -> Arc<Coordinator> {
        Arc::new(
            Coordinator::new(
                settings,
                Arc::new(self.client.clone()),
                self.store.clone(),
                self.metrics.clone(),
                self.clock.clone(),
            )
            .expect("coordinator should build"),
        )
    }

    fn scripted_coordinator(&self, deregistration: Deregistration) -> (Arc<Coordinator>, Arc<ScriptedMetadata>) {
        let settings = test_settings("events");
        let client_id = ClientId::generate();
        let metadata = Arc::new(ScriptedMetadata {
            inner: KvMetadataRepository::new(
                self.store.clone(),
                self.clock.clone(),
                &Stream::from("shardline-test-platform-consumers-events"),
                client_id,
                &settings,
            ),
            deregistration,
            deregister_calls: AtomicUsize::new(0),
        });

        let coordinator = Coordinator::with_metadata(
            settings,
            client_id,
            Arc::new(self.client.clone()),
            metadata.clone(),
            self.metrics.clone(),
            self.clock.clone(),
        )
        .expect("coordinator should build");

        (Arc::new(coordinator), metadata)
    }

    async fn checkpoints(&self, coordinator: &Coordinator) -> Vec<CheckpointRecord> {
        self.store
            .query(&checkpoint_namespace(&test_app_id(), coordinator.stream()), true)
            .await
            .expect("query should succeed")
            .iter()
            .map(|item| item.to_record().expect("checkpoint should decode"))
            .collect()
    }
}

#[tokio::test]
async fn test_consumes_all_shards_and_releases_on_cancel() {
    let harness = Harness::new();
    for shard in ["shardId-000000000000", "shardId-000000000001"] {
        harness.client.add_shard(shard);
        for i in 0..3 {
            harness.client.append(shard, format!("{shard}/{i}"));
        }
    }

    let coordinator = harness.coordinator(test_settings("events"));
    let handler = Arc::new(CollectingHandler::new());
    let token = CancelToken::new();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        let token = token.clone();
        let handler = handler.clone();
        tokio::spawn(async move { coordinator.run(&token, handler).await })
    };

    tokio::time::timeout(Duration::from_secs(5), handler.wait_for(6))
        .await
        .expect("records should arrive");
    assert!(coordinator.is_healthy());
    token.cancel();

    task.await.expect("coordinator should not panic").expect("coordinator should succeed");
    assert!(handler.is_done());
    assert_eq!(handler.payloads().len(), 6);

    let checkpoints = harness.checkpoints(&coordinator).await;
    assert_eq!(checkpoints.len(), 2);
    for checkpoint in &checkpoints {
        assert!(checkpoint.owning_client_id.is_none());
        assert!(checkpoint.sequence_number.is_some());
    }

    let clients = harness
        .store
        .query(&client_namespace(&test_app_id(), coordinator.stream()), true)
        .await
        .expect("query should succeed");
    assert!(clients.is_empty());

    let ratio = harness.metrics.named(names::SHARD_TASK_RATIO);
    assert!(ratio.iter().any(|datum| (datum.value - 200.0).abs() < f64::EPSILON));
}

#[tokio::test]
async fn test_stop_ends_run() {
    let harness = Harness::new();
    harness.client.add_shard("shardId-000000000000");
    harness.client.append("shardId-000000000000", "a");

    let coordinator = harness.coordinator(test_settings("events"));
    let handler = Arc::new(CollectingHandler::new());

    let task = {
        let coordinator = Arc::clone(&coordinator);
        let handler = handler.clone();
        tokio::spawn(async move { coordinator.run(&CancelToken::new(), handler).await })
    };

    tokio::time::timeout(Duration::from_secs(5), handler.wait_for(1))
        .await
        .expect("records should arrive");
    coordinator.stop();

    task.await.expect("coordinator should not panic").expect("coordinator should succeed");
    assert!(handler.is_done());
}

#[tokio::test]
async fn test_missing_stream_fails_run() {
    let harness = Harness::new();
    harness.client.inject_list_fault(Fault::NoSuchStream);

    let coordinator = harness.coordinator(test_settings("events"));
    let handler = Arc::new(CollectingHandler::new());

    let err = coordinator
        .run(&CancelToken::new(), handler.clone())
        .await
        .expect_err("run should fail");

    assert!(matches!(err, Error::NoSuchStream(_)));
    assert!(handler.is_done());
}

#[tokio::test]
async fn test_children_are_consumed_after_parent() {
    let harness = Harness::new();
    harness.client.add_shard("shard-0");
    harness.client.append("shard-0", "parent");
    harness.client.close_shard("shard-0");
    harness.client.add_child_shard("shard-1", "shard-0");
    harness.client.append("shard-1", "child");

    let settings = test_settings("events");
    let discover_frequency = settings.discover_frequency;
    let coordinator = harness.coordinator(settings);
    let handler = Arc::new(CollectingHandler::new());
    let token = CancelToken::new();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        let token = token.clone();
        let handler = handler.clone();
        tokio::spawn(async move { coordinator.run(&token, handler).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.payloads().len() < 2 {
            harness.clock.advance(discover_frequency);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("child records should arrive");
    token.cancel();

    task.await.expect("coordinator should not panic").expect("coordinator should succeed");
    assert_eq!(handler.payloads(), vec![b"parent".to_vec(), b"child".to_vec()]);
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() {
    let harness = Harness::new();
    let settings = Settings {
        max_batch_size: 0,
        ..test_settings("events")
    };

    let result = Coordinator::new(
        settings,
        Arc::new(harness.client.clone()),
        harness.store.clone(),
        harness.metrics.clone(),
        harness.clock.clone(),
    );

    assert!(result.is_err());
}

#[tokio::test]
async fn test_consumer_metadata_names_the_full_stream() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(test_settings("events"));

    let metadata = coordinator.consumer_metadata();

    assert_eq!(metadata.client_id, coordinator.client_id());
    assert_eq!(metadata.stream_name, "events");
    assert_eq!(
        metadata.stream_name_full.as_str(),
        "shardline-test-platform-consumers-events"
    );
}

#[tokio::test]
async fn test_failed_deregistration_is_reported_with_run_error() {
    let harness = Harness::new();
    harness.client.inject_list_fault(Fault::NoSuchStream);
    let (coordinator, metadata) = harness.scripted_coordinator(Deregistration::Fail);
    let handler = Arc::new(CollectingHandler::new());

    let err = coordinator
        .run(&CancelToken::new(), handler.clone())
        .await
        .expect_err("run should fail");

    match err {
        Error::Multiple(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(matches!(errors[0], Error::NoSuchStream(_)));
            assert!(matches!(errors[1], Error::Client(_)));
        }
        other => panic!("expected multiple errors, got {other:?}"),
    }
    assert_eq!(metadata.deregister_calls(), 1);
    assert!(handler.is_done());
}

#[tokio::test]
async fn test_deregistration_is_abandoned_after_release_delay() {
    let harness = Harness::new();
    let (coordinator, metadata) = harness.scripted_coordinator(Deregistration::Hang);
    let release_delay = test_settings("events").release_delay;
    let handler = Arc::new(CollectingHandler::new());
    let token = CancelToken::new();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        let token = token.clone();
        let handler = handler.clone();
        tokio::spawn(async move { coordinator.run(&token, handler).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.client.list_shards_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer should start");
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), async {
        while metadata.deregister_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("deregistration should start after cancel");
    // Nothing but the grace period sleeps on the clock once the workers are gone.
    tokio::time::timeout(Duration::from_secs(5), harness.clock.block_until_waiters(1))
        .await
        .expect("grace period should start");

    harness.clock.advance(release_delay - Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!task.is_finished());

    harness.clock.advance(Duration::from_millis(1));
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("run should return once the grace period is over")
        .expect("coordinator should not panic")
        .expect("cancellation alone is not an error");
    assert_eq!(metadata.deregister_calls(), 1);
    assert!(handler.is_done());
}

#[tokio::test]
async fn test_stopped_coordinator_stays_stopped() {
    let harness = Harness::new();
    harness.client.add_shard("shardId-000000000000");

    let coordinator = harness.coordinator(test_settings("events"));
    coordinator.stop();

    for _ in 0..2 {
        let handler = Arc::new(CollectingHandler::new());
        tokio::time::timeout(Duration::from_secs(5), coordinator.run(&CancelToken::new(), handler.clone()))
            .await
            .expect("run should return without being canceled")
            .expect("coordinator should succeed");
        assert!(handler.is_done());
    }

    let clients = harness
        .store
        .query(&client_namespace(&test_app_id(), coordinator.stream()), true)
        .await
        .expect("query should succeed");
    assert!(clients.is_empty());
}

#[tokio::test]
async fn test_consumer_stays_healthy_after_its_shards_are_finished() {
    let harness = Harness::new();
    harness.client.add_shard("shardId-000000000000");
    harness.client.append("shardId-000000000000", "a");
    harness.client.close_shard("shardId-000000000000");

    let settings = Settings {
        healthcheck_timeout: Duration::from_secs(4),
        ..test_settings("events")
    };
    let discover_frequency = settings.discover_frequency;
    let coordinator = harness.coordinator(settings);
    let handler = Arc::new(CollectingHandler::new());
    let token = CancelToken::new();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        let token = token.clone();
        let handler = handler.clone();
        tokio::spawn(async move { coordinator.run(&token, handler).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let checkpoints = harness.checkpoints(&coordinator).await;
            if checkpoints
                .iter()
                .any(|checkpoint| checkpoint.finished_at.is_some() && checkpoint.owning_client_id.is_none())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("shard should be finished and released");

    // Twice the healthcheck timeout, but short of the next discovery.
    let step = Duration::from_secs(1);
    for _ in 0..8 {
        harness.clock.advance(step);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(step * 8 < discover_frequency);
    assert!(coordinator.is_healthy());

    token.cancel();
    task.await.expect("coordinator should not panic").expect("coordinator should succeed");
}
