//! In-memory log service.
//!
//! Shard iterators have the form `{shardId}:{position}`, where the position
//! is the index of the next record to read. Sequence numbers are numeric
//! strings, unique across all shards of one client.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shardline_stream::client::{
    GetRecordsResponse, IteratorPosition, ListShardsResponse, PutRecordsEntry, PutRecordsResultEntry, Record, Shard,
    StreamClient,
};
use shardline_stream::{Error, Result, SequenceNumber, ShardId, ShardIterator, Stream};

/// Failure injected into the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The stream is being modified.
    StreamBusy,
    /// The stream does not exist.
    NoSuchStream,
    /// The iterator expired.
    ExpiredIterator,
    /// Throughput limit hit.
    ThroughputExceeded,
    /// Any other client failure.
    Client(String),
}

impl Fault {
    fn into_error(self, stream: &Stream) -> Error {
        match self {
            Self::StreamBusy => Error::StreamBusy(stream.clone()),
            Self::NoSuchStream => Error::NoSuchStream(stream.clone()),
            Self::ExpiredIterator => Error::ExpiredIterator,
            Self::ThroughputExceeded => Error::ThroughputExceeded("rate exceeded for shard".to_string()),
            Self::Client(message) => Error::Client(message),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryShard {
    parent: Option<ShardId>,
    records: Vec<Record>,
    closed: bool,
}

#[derive(Debug, Default)]
struct State {
    stream: Stream,
    shards: BTreeMap<ShardId, MemoryShard>,
    page_size: Option<usize>,
    next_sequence: u64,
    list_faults: VecDeque<Fault>,
    get_records_faults: VecDeque<Fault>,
    put_faults: VecDeque<Fault>,
    expired: HashSet<ShardIterator>,
    failing_entries: usize,
    failing_code: String,
    get_records_calls: usize,
    read_iterators: Vec<ShardIterator>,
    list_shards_calls: usize,
    put_requests: Vec<usize>,
}

/// In-memory [`StreamClient`].
///
/// Clones share state, so a test can keep a handle while the code under
/// test owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStreamClient {
    state: Arc<Mutex<State>>,
}

impl MemoryStreamClient {
    /// Creates a client without shards.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists at most `page_size` shards per call.
    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = Some(page_size);
        self
    }

    /// Adds an open shard.
    pub fn add_shard(&self, shard_id: &str) {
        self.lock()
            .shards
            .insert(ShardId::from(shard_id), MemoryShard::default());
    }

    /// Adds an open shard created from `parent`.
    pub fn add_child_shard(&self, shard_id: &str, parent: &str) {
        self.lock().shards.insert(
            ShardId::from(shard_id),
            MemoryShard {
                parent: Some(ShardId::from(parent)),
                ..MemoryShard::default()
            },
        );
    }

    /// Closes a shard; reads past its last record return no next iterator.
    pub fn close_shard(&self, shard_id: &str) {
        if let Some(shard) = self.lock().shards.get_mut(&ShardId::from(shard_id)) {
            shard.closed = true;
        }
    }

    /// Appends a record to a shard and returns its sequence number.
    pub fn append(&self, shard_id: &str, data: impl Into<Bytes>) -> SequenceNumber {
        self.append_at(shard_id, data, None)
    }

    /// Appends a record with an arrival time.
    pub fn append_at(&self, shard_id: &str, data: impl Into<Bytes>, arrival: Option<DateTime<Utc>>) -> SequenceNumber {
        let mut state = self.lock();
        let sequence_number = next_sequence_number(&mut state);
        let shard = state
            .shards
            .get_mut(&ShardId::from(shard_id))
            .expect("shard should exist");
        shard.records.push(Record {
            data: data.into(),
            sequence_number: sequence_number.clone(),
            partition_key: shard_id.to_string(),
            approximate_arrival: arrival,
        });
        sequence_number
    }

    /// Returns the records of a shard.
    pub fn records(&self, shard_id: &str) -> Vec<Record> {
        self.lock()
            .shards
            .get(&ShardId::from(shard_id))
            .map(|shard| shard.records.clone())
            .unwrap_or_default()
    }

    /// Fails the next `list_shards` call.
    pub fn inject_list_fault(&self, fault: Fault) {
        self.lock().list_faults.push_back(fault);
    }

    /// Fails the next `get_records` call.
    pub fn inject_get_records_fault(&self, fault: Fault) {
        self.lock().get_records_faults.push_back(fault);
    }

    /// Fails the next `put_records` call as a whole.
    pub fn inject_put_fault(&self, fault: Fault) {
        self.lock().put_faults.push_back(fault);
    }

    /// Rejects the next `count` submitted entries with `code`.
    pub fn fail_next_entries(&self, count: usize, code: &str) {
        let mut state = self.lock();
        state.failing_entries = count;
        state.failing_code = code.to_string();
    }

    /// Makes `iterator` expired.
    pub fn expire_iterator(&self, iterator: &ShardIterator) {
        self.lock().expired.insert(iterator.clone());
    }

    /// Returns the iterator pointing at `position` of `shard_id`.
    pub fn iterator(shard_id: &str, position: usize) -> ShardIterator {
        ShardIterator::new(format!("{shard_id}:{position}"))
    }

    /// Returns the number of `get_records` calls.
    pub fn get_records_calls(&self) -> usize {
        self.lock().get_records_calls
    }

    /// Returns the iterator of every `get_records` call, in call order.
    pub fn read_iterators(&self) -> Vec<ShardIterator> {
        self.lock().read_iterators.clone()
    }

    /// Returns the number of `list_shards` calls.
    pub fn list_shards_calls(&self) -> usize {
        self.lock().list_shards_calls
    }

    /// Returns the size of every `put_records` request.
    pub fn put_requests(&self) -> Vec<usize> {
        self.lock().put_requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("lock")
    }
}

fn next_sequence_number(state: &mut State) -> SequenceNumber {
    state.next_sequence += 1;
    SequenceNumber::new(format!("{:020}", state.next_sequence))
}

fn parse_iterator(iterator: &ShardIterator) -> Result<(ShardId, usize)> {
    iterator
        .as_str()
        .rsplit_once(':')
        .and_then(|(shard_id, position)| Some((ShardId::from(shard_id), position.parse().ok()?)))
        .ok_or_else(|| Error::Client(format!("invalid shard iterator {iterator}")))
}

#[async_trait]
impl StreamClient for MemoryStreamClient {
    async fn list_shards(&self, stream: &Stream, next_token: Option<String>) -> Result<ListShardsResponse> {
        let mut state = self.lock();
        state.list_shards_calls += 1;
        state.stream = stream.clone();
        if let Some(fault) = state.list_faults.pop_front() {
            return Err(fault.into_error(stream));
        }

        let start: usize = next_token.and_then(|token| token.parse().ok()).unwrap_or(0);
        let page_size = state.page_size.unwrap_or(usize::MAX);

        let shards: Vec<Shard> = state
            .shards
            .iter()
            .skip(start)
            .take(page_size)
            .map(|(shard_id, shard)| Shard {
                shard_id: shard_id.clone(),
                parent_shard_id: shard.parent.clone(),
            })
            .collect();

        let end = start + shards.len();
        let next_token = (end < state.shards.len()).then(|| end.to_string());

        Ok(ListShardsResponse { shards, next_token })
    }

    async fn get_shard_iterator(
        &self,
        stream: &Stream,
        shard_id: &ShardId,
        position: IteratorPosition,
    ) -> Result<Option<ShardIterator>> {
        let state = self.lock();
        let shard = state
            .shards
            .get(shard_id)
            .ok_or_else(|| Error::NoSuchStream(stream.clone()))?;

        let index = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => shard.records.len(),
            IteratorPosition::AtTimestamp(timestamp) => shard
                .records
                .iter()
                .position(|record| record.approximate_arrival.is_some_and(|arrival| arrival >= timestamp))
                .unwrap_or(shard.records.len()),
            IteratorPosition::AfterSequenceNumber(sequence_number) => shard
                .records
                .iter()
                .position(|record| record.sequence_number == sequence_number)
                .map(|index| index + 1)
                .ok_or_else(|| Error::Client(format!("unknown sequence number {sequence_number}")))?,
        };

        Ok(Some(Self::iterator(shard_id.as_str(), index)))
    }

    async fn get_records(&self, iterator: &ShardIterator, limit: usize) -> Result<GetRecordsResponse> {
        let mut state = self.lock();
        state.get_records_calls += 1;
        state.read_iterators.push(iterator.clone());
        if let Some(fault) = state.get_records_faults.pop_front() {
            let stream = state.stream.clone();
            return Err(fault.into_error(&stream));
        }
        if state.expired.contains(iterator) {
            return Err(Error::ExpiredIterator);
        }

        let (shard_id, position) = parse_iterator(iterator)?;
        let shard = state
            .shards
            .get(&shard_id)
            .ok_or_else(|| Error::Client(format!("unknown shard {shard_id}")))?;

        let end = shard.records.len().min(position.saturating_add(limit));
        let records = shard.records.get(position..end).map(<[Record]>::to_vec).unwrap_or_default();
        let next_position = position.max(end);

        let next_iterator = if shard.closed && next_position >= shard.records.len() {
            None
        } else {
            Some(Self::iterator(shard_id.as_str(), next_position))
        };
        let behind = shard.records.len().saturating_sub(next_position) as u64;

        Ok(GetRecordsResponse {
            records,
            next_iterator,
            millis_behind_latest: behind * 1000,
        })
    }

    async fn put_records(&self, stream: &Stream, entries: Vec<PutRecordsEntry>) -> Result<Vec<PutRecordsResultEntry>> {
        let mut state = self.lock();
        state.put_requests.push(entries.len());
        if let Some(fault) = state.put_faults.pop_front() {
            return Err(fault.into_error(stream));
        }

        let open: Vec<ShardId> = state
            .shards
            .iter()
            .filter(|(_, shard)| !shard.closed)
            .map(|(shard_id, _)| shard_id.clone())
            .collect();

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            if state.failing_entries > 0 {
                state.failing_entries -= 1;
                results.push(PutRecordsResultEntry {
                    sequence_number: None,
                    error_code: Some(state.failing_code.clone()),
                    error_message: Some("injected failure".to_string()),
                });
                continue;
            }

            if open.is_empty() {
                return Err(Error::Client("no open shard to write to".to_string()));
            }
            let hash: usize = entry.partition_key.bytes().map(usize::from).sum();
            let shard_id = open[hash % open.len()].clone();

            let sequence_number = next_sequence_number(&mut state);
            if let Some(shard) = state.shards.get_mut(&shard_id) {
                shard.records.push(Record {
                    data: entry.data,
                    sequence_number: sequence_number.clone(),
                    partition_key: entry.partition_key,
                    approximate_arrival: None,
                });
            }
            results.push(PutRecordsResultEntry {
                sequence_number: Some(sequence_number),
                ..PutRecordsResultEntry::default()
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_follow_iterators() {
        let client = MemoryStreamClient::new();
        client.add_shard("shard-0");
        client.append("shard-0", "a");
        client.append("shard-0", "b");
        client.close_shard("shard-0");

        let stream = Stream::from("events");
        let iterator = client
            .get_shard_iterator(&stream, &ShardId::from("shard-0"), IteratorPosition::TrimHorizon)
            .await
            .expect("iterator should succeed")
            .expect("iterator should exist");

        let first = client.get_records(&iterator, 1).await.expect("read should succeed");
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.millis_behind_latest, 1000);

        let next = first.next_iterator.expect("shard should continue");
        let second = client.get_records(&next, 10).await.expect("read should succeed");
        assert_eq!(second.records[0].data, Bytes::from("b"));
        assert!(second.next_iterator.is_none());
        assert_eq!(client.read_iterators(), vec![iterator, next]);
    }

    #[tokio::test]
    async fn test_listing_pages() {
        let client = MemoryStreamClient::new().with_page_size(2);
        for shard in ["a", "b", "c"] {
            client.add_shard(shard);
        }

        let stream = Stream::from("events");
        let first = client.list_shards(&stream, None).await.expect("list should succeed");
        assert_eq!(first.shards.len(), 2);

        let second = client
            .list_shards(&stream, first.next_token)
            .await
            .expect("list should succeed");
        assert_eq!(second.shards.len(), 1);
        assert!(second.next_token.is_none());
    }
}
