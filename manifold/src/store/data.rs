//! The [DataStore] contract: append and read raw events for one stream,
//! chunk-aware, preserving or assigning timestamps.

use async_trait::async_trait;
use futures::{StreamExt, TryFutureExt};

use crate::document::ObjectDocument;
use crate::error::{codes, ErrorCode};
use crate::event::{Event, EventStream, ReadSelect};
use crate::stream::StreamInfo;
use crate::version::Version;

/// All possible error types returned by a [DataStore].
#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    /// The target stream's last committed event closes it; appends must
    /// move to the continuation stream when one is carried.
    #[error("stream {stream_id} is closed")]
    StreamClosed {
        stream_id: String,
        continuation: Option<String>,
    },

    /// Another writer appended to the stream after this writer read the
    /// manifest: the stored tail no longer matches the manifest-visible
    /// position. Nothing has been written when this is returned.
    #[error("concurrent append detected on stream {stream_id}: expected tail {expected}, found {found}")]
    ConcurrentAppend {
        stream_id: String,
        expected: Version,
        found: Version,
    },

    /// The events handed to `append` do not continue the stream's dense
    /// version sequence.
    #[error("append to {stream_id} is not contiguous: expected version {expected}, found {found}")]
    NonContiguousAppend {
        stream_id: String,
        expected: Version,
        found: Version,
    },

    /// Persisted event data could not be deserialized.
    #[error("failed to decode events of stream {stream_id}: {source}")]
    Deserialize {
        stream_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transient I/O failure while talking to the backend.
    #[error("data store failed while processing stream {stream_id}: {source}")]
    Processing {
        stream_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ErrorCode for DataStoreError {
    fn error_code(&self) -> &'static str {
        match self {
            DataStoreError::StreamClosed { .. } => codes::STREAM_CLOSED,
            DataStoreError::ConcurrentAppend { .. } => codes::CONCURRENCY_CONFLICT,
            DataStoreError::NonContiguousAppend { .. } => codes::EXT_PROCESSING,
            DataStoreError::Deserialize { .. } => codes::VAL_DESERIALIZATION,
            DataStoreError::Processing { .. } => codes::EXT_PROCESSING,
        }
    }
}

/// Interface to the chunked append log backing one stream of an object.
///
/// Events carry their final `event_version` when they reach the store:
/// the leased session assigns positions before calling `append`. Reads
/// are bounded by the manifest: events beyond the [StreamInfo]'s
/// `current_stream_version` (orphans of failed commits) stay invisible
/// until a later commit references their versions again.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Writes events in order at their pre-assigned versions, returning
    /// the new stream version.
    ///
    /// With `preserve_timestamp` unset, the store stamps its own write
    /// time on each event; the restore path sets it to keep the
    /// original history timestamps.
    ///
    /// Fails with [DataStoreError::StreamClosed] when the stream's last
    /// visible event closes it.
    async fn append(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        preserve_timestamp: bool,
        events: Vec<Event>,
    ) -> Result<Version, DataStoreError>;

    /// Returns the selected events in version order. A stream with no
    /// stored events reads as empty, not as an error.
    async fn read(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        select: ReadSelect,
    ) -> Result<Vec<Event>, DataStoreError>;

    /// Same semantics as [DataStore::read], yielded lazily. Each call
    /// creates a fresh, finite stream; dropping it cancels the read.
    fn read_as_stream<'a>(
        &'a self,
        document: &'a ObjectDocument,
        stream: &'a StreamInfo,
        select: ReadSelect,
    ) -> EventStream<'a> {
        self.read(document, stream, select)
            .map_ok(|events| futures::stream::iter(events.into_iter().map(Ok)))
            .try_flatten_stream()
            .boxed()
    }

    /// Idempotently deletes the contiguous `[from, to]` version range
    /// written by a commit that failed to publish its manifest, returning
    /// the count actually removed. Events outside the range are never
    /// affected. Called only by the session cleanup path.
    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        from: Version,
        to: Version,
    ) -> Result<usize, DataStoreError>;
}
