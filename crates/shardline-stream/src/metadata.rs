//! Client registrations and shard checkpoints on a conditional-write KV store.
//!
//! ## Layout
//!
//! | Namespace | Resource | Record |
//! |-----------|----------|--------|
//! | `client:{appId}:{stream}` | client id | [`ClientRecord`] |
//! | `checkpoint:{appId}:{stream}` | shard id | [`CheckpointRecord`] |
//!
//! `{appId}` is the identity of the running application, so two applications
//! consuming the same stream keep independent progress.
//!
//! ## Leases
//!
//! A client owns a shard while its checkpoint names it as `owningClientId`
//! and `updatedAt` is younger than the checkpoint timeout. Takeover of a
//! stale or released record is a conditional put, so two clients racing for
//! the same shard can never both win.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_core::clock::{self, SharedClock};
use shardline_core::{Condition, Item, ItemKey, KvStore};

use crate::checkpoint::{Checkpoint, CheckpointRecord, KvCheckpoint, OWNING_CLIENT_ID, SHARD_TIMEOUT, UPDATED_AT};
use crate::config::{AppId, Settings};
use crate::error::{Error, Result};
use crate::id::{ClientId, ShardId, Stream};

/// Presence of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    /// Last registration.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Expiry in epoch seconds.
    pub ttl: i64,
}

/// Coordination state shared by all clients of a stream.
#[async_trait]
pub trait MetadataRepository: Send + Sync + 'static {
    /// Creates or refreshes the own registration.
    ///
    /// Returns the index of this client among all live clients and their count.
    async fn register_client(&self) -> Result<(usize, usize)>;

    /// Removes the own registration so other clients take over sooner.
    async fn deregister_client(&self) -> Result<()>;

    /// Returns true if some client consumed the shard completely.
    async fn is_shard_finished(&self, shard_id: &ShardId) -> Result<bool>;

    /// Tries to take ownership of a shard.
    ///
    /// Returns `None` if another client holds it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShardAlreadyFinished`] if the shard needs no more work.
    async fn acquire_shard(&self, shard_id: &ShardId) -> Result<Option<Arc<dyn Checkpoint>>>;
}

/// [`MetadataRepository`] backed by a [`KvStore`].
pub struct KvMetadataRepository {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    client_id: ClientId,
    client_namespace: String,
    checkpoint_namespace: String,
    client_timeout: Duration,
    checkpoint_timeout: Duration,
    // Shards never leave the finished state, so this only grows.
    finished: Mutex<HashSet<ShardId>>,
}

impl std::fmt::Debug for KvMetadataRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvMetadataRepository")
            .field("client_id", &self.client_id)
            .field("client_namespace", &self.client_namespace)
            .field("checkpoint_namespace", &self.checkpoint_namespace)
            .finish_non_exhaustive()
    }
}

impl KvMetadataRepository {
    /// Creates a repository for `client_id` consuming `stream`.
    ///
    /// Records are scoped by `settings.consumer_app_id`.
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: SharedClock,
        stream: &Stream,
        client_id: ClientId,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            clock,
            client_id,
            client_namespace: client_namespace(&settings.consumer_app_id, stream),
            checkpoint_namespace: checkpoint_namespace(&settings.consumer_app_id, stream),
            client_timeout: settings.client_timeout(),
            checkpoint_timeout: settings.checkpoint_timeout(),
            finished: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the namespace of the checkpoint records.
    #[must_use]
    pub fn checkpoint_namespace(&self) -> &str {
        &self.checkpoint_namespace
    }

    /// Returns the namespace of the client records.
    #[must_use]
    pub fn client_namespace(&self) -> &str {
        &self.client_namespace
    }

    fn checkpoint_key(&self, shard_id: &ShardId) -> ItemKey {
        ItemKey::new(&self.checkpoint_namespace, shard_id.as_str())
    }

    fn finished(&self) -> std::sync::MutexGuard<'_, HashSet<ShardId>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Namespace of the client records of an application consuming a stream.
#[must_use]
pub fn client_namespace(app_id: &AppId, stream: &Stream) -> String {
    format!("client:{app_id}:{stream}")
}

/// Namespace of the checkpoint records of an application consuming a stream.
#[must_use]
pub fn checkpoint_namespace(app_id: &AppId, stream: &Stream) -> String {
    format!("checkpoint:{app_id}:{stream}")
}

#[async_trait]
impl MetadataRepository for KvMetadataRepository {
    async fn register_client(&self) -> Result<(usize, usize)> {
        let now = self.clock.now();
        let record = ClientRecord {
            updated_at: now,
            ttl: clock::add(now, self.client_timeout).timestamp(),
        };
        let key = ItemKey::new(&self.client_namespace, self.client_id.to_string());
        self.store
            .put(Item::from_record(key, &record)?, None)
            .await
            .map_err(|e| Error::storage("failed to register client", e))?;

        let clients = self
            .store
            .query(&self.client_namespace, true)
            .await
            .map_err(|e| Error::storage("failed to list clients", e))?;

        // Resources sort by client id.
        let own = self.client_id.to_string();
        clients
            .iter()
            .position(|item| item.key.resource == own)
            .map(|index| (index, clients.len()))
            .ok_or(Error::ClientNotRegistered(self.client_id))
    }

    async fn deregister_client(&self) -> Result<()> {
        let key = ItemKey::new(&self.client_namespace, self.client_id.to_string());
        self.store
            .delete(&key)
            .await
            .map_err(|e| Error::storage("failed to deregister client", e))
    }

    async fn is_shard_finished(&self, shard_id: &ShardId) -> Result<bool> {
        if self.finished().contains(shard_id) {
            return Ok(true);
        }

        let item = self
            .store
            .get(&self.checkpoint_key(shard_id), false)
            .await
            .map_err(|e| Error::storage("failed to check if shard is finished", e))?;

        let Some(item) = item else {
            return Ok(false);
        };
        let record: CheckpointRecord = item.to_record()?;
        if record.finished_at.is_none() {
            return Ok(false);
        }

        self.finished().insert(shard_id.clone());
        Ok(true)
    }

    async fn acquire_shard(&self, shard_id: &ShardId) -> Result<Option<Arc<dyn Checkpoint>>> {
        let now = self.clock.now();
        let timed_out_before = clock::sub(now, self.checkpoint_timeout);
        let ttl = clock::add(now, SHARD_TIMEOUT).timestamp();

        let existing = self
            .store
            .get(&self.checkpoint_key(shard_id), true)
            .await
            .map_err(|e| Error::storage("failed to read checkpoint record", e))?;

        let record = match existing {
            None => {
                tracing::info!(shard_id = %shard_id, "trying to use unused shard");
                CheckpointRecord {
                    owning_client_id: Some(self.client_id),
                    sequence_number: None,
                    last_shard_iterator: None,
                    finished_at: None,
                    updated_at: now,
                    ttl,
                }
            }
            Some(item) => {
                let mut record: CheckpointRecord = item.to_record()?;

                if let Some(owner) = record.owning_client_id {
                    if record.updated_at > timed_out_before {
                        tracing::info!(shard_id = %shard_id, owner = %owner, "not trying to take over shard, it is still in use");
                        return Ok(None);
                    }
                }

                if record.finished_at.is_some() {
                    tracing::info!(shard_id = %shard_id, "not trying to take over shard, it is already finished");
                    return Err(Error::ShardAlreadyFinished);
                }

                let owner = record
                    .owning_client_id
                    .map_or_else(|| "nobody".to_string(), |owner| owner.to_string());
                tracing::info!(shard_id = %shard_id, owner = %owner, "trying to take over shard");

                record.owning_client_id = Some(self.client_id);
                record.updated_at = now;
                record.ttl = ttl;
                record
            }
        };

        let condition = Condition::not_exists(OWNING_CLIENT_ID)
            .or(Condition::lte(UPDATED_AT, timed_out_before.timestamp_millis()));
        let item = Item::from_record(self.checkpoint_key(shard_id), &record)?;
        let result = self
            .store
            .put(item, Some(condition))
            .await
            .map_err(|e| Error::storage("failed to write checkpoint record", e))?;

        if result.is_condition_failed() {
            tracing::info!(shard_id = %shard_id, "failed to acquire shard");
            return Ok(None);
        }

        Ok(Some(Arc::new(KvCheckpoint::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            &self.checkpoint_namespace,
            shard_id,
            self.client_id,
            record,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use shardline_core::{FakeClock, MemoryKvStore};

    use super::*;

    fn settings() -> Settings {
        Settings {
            consumer_app_id: AppId::new("acme", "test", "analytics", "grp", "consumer"),
            stream_name: "events".to_string(),
            ..Settings::default()
        }
    }

    fn repository(clock: &Arc<FakeClock>, store: &Arc<MemoryKvStore>, client_id: ClientId) -> KvMetadataRepository {
        KvMetadataRepository::new(
            store.clone(),
            clock.clone(),
            &Stream::from("acme-test-analytics-grp-events"),
            client_id,
            &settings(),
        )
    }

    fn shard() -> ShardId {
        ShardId::from("shardId-000000000000")
    }

    #[test]
    fn test_namespaces_use_running_application() {
        let app_id = AppId::new("p", "e", "f", "g", "a");
        let stream = Stream::from("stream");

        assert_eq!(client_namespace(&app_id, &stream), "client:p-e-f-g-a:stream");
        assert_eq!(checkpoint_namespace(&app_id, &stream), "checkpoint:p-e-f-g-a:stream");
    }

    #[tokio::test]
    async fn test_register_client_reports_index_by_sorted_id() {
        let clock = Arc::new(FakeClock::default());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));

        let mut ids = [ClientId::generate(), ClientId::generate(), ClientId::generate()];
        ids.sort();
        let repos: Vec<_> = ids.iter().map(|id| repository(&clock, &store, *id)).collect();

        for repo in &repos {
            repo.register_client().await.expect("register should succeed");
        }

        for (expected, repo) in repos.iter().enumerate() {
            let (index, total) = repo.register_client().await.expect("register should succeed");
            assert_eq!((index, total), (expected, 3));
        }

        repos[0].deregister_client().await.expect("deregister should succeed");
        let (index, total) = repos[2].register_client().await.expect("register should succeed");
        assert_eq!((index, total), (1, 2));
    }

    #[tokio::test]
    async fn test_client_registration_expires() {
        let clock = Arc::new(FakeClock::default());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));
        let stale = repository(&clock, &store, ClientId::generate());
        let live = repository(&clock, &store, ClientId::generate());

        stale.register_client().await.expect("register should succeed");
        clock.advance(settings().client_timeout());

        let (_, total) = live.register_client().await.expect("register should succeed");
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_new_shard_starts_without_sequence_number() {
        let clock = Arc::new(FakeClock::default());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));
        let repo = repository(&clock, &store, ClientId::generate());

        let checkpoint = repo
            .acquire_shard(&shard())
            .await
            .expect("acquire should succeed")
            .expect("shard should be free");

        assert_eq!(checkpoint.sequence_number().await.expect("read"), None);
        assert_eq!(checkpoint.shard_iterator().await.expect("read"), None);
        assert!(!repo.is_shard_finished(&shard()).await.expect("lookup should succeed"));
    }

    #[tokio::test]
    async fn test_owned_shard_is_refused_until_stale() {
        let clock = Arc::new(FakeClock::default());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));
        let first = repository(&clock, &store, ClientId::generate());
        let second = repository(&clock, &store, ClientId::generate());

        let checkpoint = first
            .acquire_shard(&shard())
            .await
            .expect("acquire should succeed")
            .expect("shard should be free");
        checkpoint
            .advance(Some("1234".into()), Some("1234==".into()))
            .await
            .expect("advance should succeed");
        checkpoint.persist().await.expect("persist should succeed");

        let refused = second.acquire_shard(&shard()).await.expect("acquire should succeed");
        assert!(refused.is_none());

        clock.advance(settings().checkpoint_timeout());
        let taken = second
            .acquire_shard(&shard())
            .await
            .expect("acquire should succeed")
            .expect("stale shard should be taken over");

        assert_eq!(taken.sequence_number().await.expect("read"), Some("1234".into()));
        assert_eq!(taken.shard_iterator().await.expect("read"), Some("1234==".into()));
        assert!(matches!(
            checkpoint.persist().await,
            Err(Error::CheckpointNoLongerOwned)
        ));
    }

    #[tokio::test]
    async fn test_released_shard_is_taken_over_immediately() {
        let clock = Arc::new(FakeClock::default());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));
        let first = repository(&clock, &store, ClientId::generate());
        let second = repository(&clock, &store, ClientId::generate());

        let checkpoint = first
            .acquire_shard(&shard())
            .await
            .expect("acquire should succeed")
            .expect("shard should be free");
        checkpoint.release().await.expect("release should succeed");

        let taken = second.acquire_shard(&shard()).await.expect("acquire should succeed");
        assert!(taken.is_some());
    }

    #[tokio::test]
    async fn test_finished_shard_is_cached_and_not_acquired() {
        let clock = Arc::new(FakeClock::default());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));
        let repo = repository(&clock, &store, ClientId::generate());

        let checkpoint = repo
            .acquire_shard(&shard())
            .await
            .expect("acquire should succeed")
            .expect("shard should be free");
        checkpoint
            .advance(Some("2000".into()), None)
            .await
            .expect("advance should succeed");
        checkpoint.done(Some("2000".into())).await.expect("done should succeed");
        assert!(checkpoint.persist().await.expect("persist should succeed"));
        checkpoint.release().await.expect("release should succeed");

        assert!(repo.is_shard_finished(&shard()).await.expect("lookup should succeed"));

        let other = repository(&clock, &store, ClientId::generate());
        assert!(matches!(
            other.acquire_shard(&shard()).await,
            Err(Error::ShardAlreadyFinished)
        ));

        store
            .delete(&ItemKey::new(repo.checkpoint_namespace(), shard().as_str()))
            .await
            .expect("delete should succeed");
        assert!(repo.is_shard_finished(&shard()).await.expect("lookup should be cached"));
    }
}
