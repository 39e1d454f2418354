//! Ownership lease and progress of one shard.
//!
//! A [`KvCheckpoint`] is handed out by
//! [`MetadataRepository::acquire_shard`](crate::metadata::MetadataRepository::acquire_shard)
//! once this client owns the shard. All operations share a poisoned lock:
//! after a successful (or refused) release every further call fails instead
//! of writing to a record another client may own by now.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardline_core::clock::{self, SharedClock};
use shardline_core::kv::TTL_ATTRIBUTE;
use shardline_core::{Condition, Item, ItemKey, KvStore, LockError, PoisonedLock, UpdateAction};

use crate::error::{Error, Result};
use crate::id::{ClientId, SequenceNumber, ShardId, ShardIterator};

/// How long checkpoint records outlive their last write.
///
/// Longer than the maximum retention of a stream (7 days), so a record
/// never expires while its shard can still be read.
pub const SHARD_TIMEOUT: Duration = Duration::from_secs(8 * 24 * 60 * 60);

/// Attribute naming the current owner of a checkpoint record.
pub const OWNING_CLIENT_ID: &str = "owningClientId";
/// Attribute holding the last write time of a record.
pub const UPDATED_AT: &str = "updatedAt";
/// Attribute holding the checkpointed sequence number.
pub const SEQUENCE_NUMBER: &str = "sequenceNumber";

/// Stored form of a shard checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    /// Current owner; absent once released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owning_client_id: Option<ClientId>,
    /// Last processed record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<SequenceNumber>,
    /// Iterator to continue from, if still fresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_shard_iterator: Option<ShardIterator>,
    /// Set once the shard was consumed completely.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last write.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Expiry in epoch seconds.
    pub ttl: i64,
}

/// Progress of a claimed shard.
#[async_trait]
pub trait Checkpoint: Send + Sync + fmt::Debug {
    /// Returns the last processed sequence number.
    async fn sequence_number(&self) -> Result<Option<SequenceNumber>>;

    /// Returns the iterator stored with the checkpoint.
    async fn shard_iterator(&self) -> Result<Option<ShardIterator>>;

    /// Moves the checkpoint to include everything up to `sequence_number`.
    async fn advance(
        &self,
        sequence_number: Option<SequenceNumber>,
        shard_iterator: Option<ShardIterator>,
    ) -> Result<()>;

    /// Marks the shard as consumed completely up to `sequence_number`.
    async fn done(&self, sequence_number: Option<SequenceNumber>) -> Result<()>;

    /// Writes the checkpoint and renews the lease.
    ///
    /// Returns true once the shard is finished and should be released.
    async fn persist(&self) -> Result<bool>;

    /// Gives up ownership. The checkpoint can not be used afterwards.
    async fn release(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct CheckpointState {
    sequence_number: Option<SequenceNumber>,
    shard_iterator: Option<ShardIterator>,
    final_sequence_number: Option<SequenceNumber>,
    finished_at: Option<DateTime<Utc>>,
}

/// Checkpoint stored in a [`KvStore`].
pub struct KvCheckpoint {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    key: ItemKey,
    owning_client_id: ClientId,
    state: PoisonedLock<CheckpointState>,
}

impl fmt::Debug for KvCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvCheckpoint")
            .field("key", &self.key)
            .field("owning_client_id", &self.owning_client_id)
            .field("released", &self.state.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl KvCheckpoint {
    /// Wraps a record this client just acquired.
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: SharedClock,
        namespace: &str,
        shard_id: &ShardId,
        owning_client_id: ClientId,
        record: CheckpointRecord,
    ) -> Self {
        let final_sequence_number = record
            .finished_at
            .and(record.sequence_number.clone());

        Self {
            store,
            clock,
            key: ItemKey::new(namespace, shard_id.as_str()),
            owning_client_id,
            state: PoisonedLock::new(CheckpointState {
                sequence_number: record.sequence_number,
                shard_iterator: record.last_shard_iterator,
                final_sequence_number,
                finished_at: record.finished_at,
            }),
        }
    }

    fn owner_condition(&self) -> Condition {
        Condition::equals(OWNING_CLIENT_ID, self.owning_client_id.to_string())
    }
}

fn released(operation: &'static str) -> impl FnOnce(LockError) -> Error {
    move |_| Error::CheckpointReleased { operation }
}

#[async_trait]
impl Checkpoint for KvCheckpoint {
    async fn sequence_number(&self) -> Result<Option<SequenceNumber>> {
        let state = self.state.lock().await.map_err(released("read"))?;
        Ok(state.sequence_number.clone())
    }

    async fn shard_iterator(&self) -> Result<Option<ShardIterator>> {
        let state = self.state.lock().await.map_err(released("read"))?;
        Ok(state.shard_iterator.clone())
    }

    async fn advance(
        &self,
        sequence_number: Option<SequenceNumber>,
        shard_iterator: Option<ShardIterator>,
    ) -> Result<()> {
        let mut state = self.state.lock().await.map_err(released("advance"))?;
        state.sequence_number = sequence_number;
        state.shard_iterator = shard_iterator;
        Ok(())
    }

    async fn done(&self, sequence_number: Option<SequenceNumber>) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .await
            .map_err(released("mark as done"))?;
        state.finished_at = Some(self.clock.now());
        state.final_sequence_number = sequence_number;
        Ok(())
    }

    async fn persist(&self) -> Result<bool> {
        let state = self.state.lock().await.map_err(released("persist"))?;

        let now = self.clock.now();
        let mut record = CheckpointRecord {
            owning_client_id: Some(self.owning_client_id),
            sequence_number: state.sequence_number.clone(),
            last_shard_iterator: state.shard_iterator.clone(),
            finished_at: state.finished_at,
            updated_at: now,
            ttl: clock::add(now, SHARD_TIMEOUT).timestamp(),
        };

        // A later batch may still be in flight after done() was recorded.
        if state.final_sequence_number.is_some() && state.final_sequence_number != state.sequence_number {
            record.finished_at = None;
        }

        let item = Item::from_record(self.key.clone(), &record)?;
        let result = self
            .store
            .put(item, Some(self.owner_condition()))
            .await
            .map_err(|e| Error::storage("failed to persist checkpoint", e))?;

        if result.is_condition_failed() {
            return Err(Error::CheckpointNoLongerOwned);
        }

        Ok(record.finished_at.is_some())
    }

    async fn release(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .await
            .map_err(|_| Error::CheckpointAlreadyReleased)?;

        let now = self.clock.now();
        let mut actions = vec![
            UpdateAction::remove(OWNING_CLIENT_ID),
            UpdateAction::set(UPDATED_AT, now.timestamp_millis()),
            UpdateAction::set(TTL_ATTRIBUTE, clock::add(now, SHARD_TIMEOUT).timestamp()),
        ];
        actions.push(match &state.sequence_number {
            Some(sequence_number) => UpdateAction::set(SEQUENCE_NUMBER, Value::from(sequence_number.as_str())),
            None => UpdateAction::remove(SEQUENCE_NUMBER),
        });

        let result = self
            .store
            .update(&self.key, actions, Some(self.owner_condition()))
            .await
            .map_err(|e| Error::storage("failed to release checkpoint", e))?;

        // Released either way; the record belongs to someone else or to nobody now.
        state.poison();

        if result.is_condition_failed() {
            return Err(Error::CheckpointAlreadyReleased);
        }
        Ok(())
    }
}
