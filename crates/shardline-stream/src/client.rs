//! Contract of the wire client talking to the log service.
//!
//! Implementations translate service failures into the typed variants of
//! [`Error`](crate::Error): [`StreamBusy`](crate::Error::StreamBusy),
//! [`NoSuchStream`](crate::Error::NoSuchStream),
//! [`ExpiredIterator`](crate::Error::ExpiredIterator) and
//! [`ThroughputExceeded`](crate::Error::ThroughputExceeded). Everything else
//! becomes [`Client`](crate::Error::Client).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::id::{SequenceNumber, ShardId, ShardIterator, Stream};

/// A shard as reported by the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Shard identifier.
    pub shard_id: ShardId,
    /// The shard this one was split or merged from.
    pub parent_shard_id: Option<ShardId>,
}

impl Shard {
    /// Creates a shard without parent.
    #[must_use]
    pub fn new(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
        }
    }

    /// Sets the parent shard.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<ShardId>) -> Self {
        self.parent_shard_id = Some(parent.into());
        self
    }
}

/// One page of a shard listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListShardsResponse {
    /// Shards of this page.
    pub shards: Vec<Shard>,
    /// Token of the next page, `None` on the last page.
    pub next_token: Option<String>,
}

/// Where a new shard iterator points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// The oldest retained record.
    TrimHorizon,
    /// Just after the newest record.
    Latest,
    /// The first record written at or after the timestamp.
    AtTimestamp(DateTime<Utc>),
    /// Just after the given record.
    AfterSequenceNumber(SequenceNumber),
}

/// A record read from a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Payload.
    pub data: Bytes,
    /// Position within the shard.
    pub sequence_number: SequenceNumber,
    /// Key the writer partitioned the record by.
    pub partition_key: String,
    /// When the service accepted the record.
    pub approximate_arrival: Option<DateTime<Utc>>,
}

/// Result of one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetRecordsResponse {
    /// Records in shard order.
    pub records: Vec<Record>,
    /// Iterator for the next read; `None` once a closed shard is exhausted.
    pub next_iterator: Option<ShardIterator>,
    /// Distance of this read from the tip of the shard.
    pub millis_behind_latest: u64,
}

/// A record submitted for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordsEntry {
    /// Payload.
    pub data: Bytes,
    /// Key deciding the shard.
    pub partition_key: String,
    /// Explicit hash overriding the partition key hash.
    pub explicit_hash_key: Option<String>,
}

/// Per-entry outcome of a batched write, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutRecordsResultEntry {
    /// Assigned position on success.
    pub sequence_number: Option<SequenceNumber>,
    /// Service error code on failure.
    pub error_code: Option<String>,
    /// Service error message on failure.
    pub error_message: Option<String>,
}

impl PutRecordsResultEntry {
    /// Returns true if the entry was rejected.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Wire client of the log service.
#[async_trait]
pub trait StreamClient: Send + Sync + 'static {
    /// Lists one page of shards. Pass the previous `next_token` to continue.
    async fn list_shards(&self, stream: &Stream, next_token: Option<String>) -> Result<ListShardsResponse>;

    /// Creates an iterator. Returns `None` if the shard has nothing left to read from that position.
    async fn get_shard_iterator(
        &self,
        stream: &Stream,
        shard_id: &ShardId,
        position: IteratorPosition,
    ) -> Result<Option<ShardIterator>>;

    /// Reads up to `limit` records.
    async fn get_records(&self, iterator: &ShardIterator, limit: usize) -> Result<GetRecordsResponse>;

    /// Writes a batch of records. The result has one entry per submitted record.
    async fn put_records(&self, stream: &Stream, entries: Vec<PutRecordsEntry>) -> Result<Vec<PutRecordsResultEntry>>;
}
