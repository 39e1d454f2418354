//! Error types for the consumer group and record writer.

use std::fmt;

use crate::id::{ClientId, Stream};

/// The result type used throughout shardline-stream.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while consuming from or writing to a stream.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error raised by a core primitive (storage, serialization, cancellation).
    #[error(transparent)]
    Core(#[from] shardline_core::Error),

    /// The stream is being created, deleted or resharded.
    #[error("stream {0} is busy")]
    StreamBusy(Stream),

    /// The stream does not exist.
    #[error("stream {0} does not exist")]
    NoSuchStream(Stream),

    /// The shard iterator is older than its maximum lifetime.
    #[error("shard iterator expired")]
    ExpiredIterator,

    /// The request exceeded the provisioned throughput of the stream.
    #[error("provisioned throughput exceeded: {0}")]
    ThroughputExceeded(String),

    /// Another client took over the shard since it was acquired.
    #[error("can not persist checkpoint which is no longer owned")]
    CheckpointNoLongerOwned,

    /// The checkpoint was released before.
    #[error("failed to release checkpoint, it was already released")]
    CheckpointAlreadyReleased,

    /// The shard was consumed completely by some client.
    #[error("shard was already finished")]
    ShardAlreadyFinished,

    /// A checkpoint was used after it was released.
    #[error("can not {operation} already released checkpoint")]
    CheckpointReleased {
        /// The refused operation.
        operation: &'static str,
    },

    /// The own client registration was missing right after writing it.
    #[error("failed to find client {0} just written to the metadata store")]
    ClientNotRegistered(ClientId),

    /// The wire client failed for a reason not covered by another variant.
    #[error("stream client error: {0}")]
    Client(String),

    /// Several independent failures.
    #[error("{} errors occurred: {}", .0.len(), DisplayAll(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// Returns the cancellation error.
    #[must_use]
    pub const fn canceled() -> Self {
        Self::Core(shardline_core::Error::Canceled)
    }

    /// Returns true if this error only signals cancellation.
    ///
    /// A [`Error::Multiple`] counts as canceled only if every contained error does.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Core(err) => err.is_canceled(),
            Self::Multiple(errors) => !errors.is_empty() && errors.iter().all(Self::is_canceled),
            _ => false,
        }
    }

    /// Wraps a failed store call, keeping cancellation recognizable.
    pub(crate) fn storage(message: &str, err: shardline_core::Error) -> Self {
        if err.is_canceled() {
            return Self::Core(err);
        }
        Self::Core(shardline_core::Error::storage_with_source(message, err))
    }

    /// Appends `other` to this error, flattening nested aggregates.
    #[must_use]
    pub fn append(self, other: Self) -> Self {
        let mut errors = match self {
            Self::Multiple(errors) => errors,
            err => vec![err],
        };
        match other {
            Self::Multiple(more) => errors.extend(more),
            err => errors.push(err),
        }
        Self::Multiple(errors)
    }
}

/// Combines a primary result with a secondary one without masking the primary error.
///
/// # Errors
///
/// Returns the primary error, the secondary error, or both aggregated.
pub fn merge(primary: Result<()>, secondary: Result<()>) -> Result<()> {
    match (primary, secondary) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        (Err(primary), Err(secondary)) => Err(primary.append(secondary)),
    }
}

struct DisplayAll<'a>(&'a [Error]);

impl fmt::Display for DisplayAll<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_is_canceled_only_if_all_are() {
        let all_canceled = Error::canceled().append(Error::canceled());
        assert!(all_canceled.is_canceled());

        let mixed = Error::canceled().append(Error::CheckpointNoLongerOwned);
        assert!(!mixed.is_canceled());
    }

    #[test]
    fn test_append_flattens() {
        let err = Error::ExpiredIterator
            .append(Error::ShardAlreadyFinished)
            .append(Error::ExpiredIterator.append(Error::CheckpointAlreadyReleased));

        match err {
            Error::Multiple(errors) => assert_eq!(errors.len(), 4),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_keeps_primary_first() {
        let merged = merge(
            Err(Error::CheckpointNoLongerOwned),
            Err(Error::CheckpointAlreadyReleased),
        )
        .expect_err("merge should fail");

        assert_eq!(
            merged.to_string(),
            "2 errors occurred: can not persist checkpoint which is no longer owned; \
             failed to release checkpoint, it was already released"
        );
        assert!(merge(Ok(()), Ok(())).is_ok());
        assert!(matches!(
            merge(Ok(()), Err(Error::ExpiredIterator)),
            Err(Error::ExpiredIterator)
        ));
    }
}
