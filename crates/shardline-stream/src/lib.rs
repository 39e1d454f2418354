//! # shardline-stream
//!
//! A checkpointed consumer group for sharded append logs, plus a batched
//! record writer.
//!
//! Any number of processes may run a [`Coordinator`] for the same stream.
//! They register in a shared KV store, split the shards of the stream
//! between them and record their progress per shard in checkpoints, so a
//! restarted or replacement process resumes where the previous owner stopped.
//!
//! ## Components
//!
//! - **Coordinator**: registration, shard discovery, partitioning, supervision
//! - **Shard Reader**: claims one shard, reads it, persists and releases the checkpoint
//! - **Metadata Repository**: client registrations and checkpoint leases on a [`shardline_core::KvStore`]
//! - **Checkpoint**: single-writer progress of one shard
//! - **Record Writer**: batched appends with per-entry retries
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use shardline_core::{CancelToken, MemoryKvStore, NoopMetricWriter, SystemClock};
//! use shardline_stream::{Coordinator, FnHandler, Settings, StreamClient};
//!
//! # async fn example(client: Arc<dyn StreamClient>) -> shardline_stream::Result<()> {
//! let clock = SystemClock::shared();
//! let settings = Settings::from_env()?;
//! let store = Arc::new(MemoryKvStore::new(Arc::clone(&clock)));
//! let coordinator = Coordinator::new(settings, client, store, Arc::new(NoopMetricWriter), clock)?;
//!
//! let handler = FnHandler::new(|data: Vec<u8>| async move {
//!     println!("{} bytes", data.len());
//!     Ok(())
//! });
//!
//! coordinator.run(&CancelToken::new(), Arc::new(handler)).await
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod id;
pub mod metadata;
pub mod metrics;
pub mod naming;
pub mod record_writer;
pub mod shard_reader;

pub use checkpoint::{Checkpoint, CheckpointRecord, KvCheckpoint};
pub use client::{
    GetRecordsResponse, IteratorPosition, ListShardsResponse, PutRecordsEntry, PutRecordsResultEntry, Record, Shard,
    StreamClient,
};
pub use config::{AppId, InitialPosition, NamingSettings, RecordWriterSettings, Settings};
pub use coordinator::{ConsumerMetadata, Coordinator, RuntimeContext, ShardInfo};
pub use error::{Error, Result};
pub use handler::{FnHandler, HandlerError, MessageHandler};
pub use id::{ClientId, SequenceNumber, ShardId, ShardIterator, Stream};
pub use metadata::{ClientRecord, KvMetadataRepository, MetadataRepository};
pub use record_writer::{ClientRecordWriter, RecordWriter, WriteRecord};
pub use shard_reader::{CheckpointSlot, ReaderResources, ShardReader};
