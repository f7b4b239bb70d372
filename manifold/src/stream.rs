//! Stream descriptors embedded in the object-document manifest: the
//! active stream, its terminated predecessors, chunking configuration
//! and the stream-identifier format shared by every backend.

use serde::{Deserialize, Serialize};

use crate::error::{codes, ErrorCode};
use crate::version::{Version, EMPTY_STREAM_VERSION};

/// Backend tag of a stream, persisted in the manifest.
///
/// Only [StreamType::InMemory] and [StreamType::Blob] ship with the
/// engine; the remaining tags are wire-compatible for manifests written
/// by other deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Blob,
    Table,
    Cosmos,
    S3,
    InMemory,
}

/// Controls how a stream's events are grouped into storage chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSettings {
    /// Whether events are split into bounded chunks at all.
    pub enabled: bool,

    /// Number of events per chunk. The default of 1000 keeps chunks in
    /// the 1-5 MB range for typical payloads; tune per workload.
    pub size: u64,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 1000,
        }
    }
}

impl ChunkSettings {
    /// Returns the chunk index covering the given event version.
    ///
    /// With chunking disabled every event lives in chunk 0.
    pub fn chunk_index(&self, version: Version) -> u64 {
        if !self.enabled || self.size == 0 {
            return 0;
        }

        (version.max(0) as u64) / self.size
    }

    /// Returns the inclusive `[first, last]` version range covered by the
    /// given chunk index, or `None` when chunking is disabled (chunk 0
    /// then covers the whole stream).
    pub fn chunk_range(&self, chunk: u64) -> Option<(Version, Version)> {
        if !self.enabled || self.size == 0 {
            return None;
        }

        let first = (chunk * self.size) as Version;
        let last = first + self.size as Version - 1;
        Some((first, last))
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), StreamIdentifierError> {
        if self.enabled && self.size == 0 {
            return Err(StreamIdentifierError::InvalidChunkSettings);
        }

        Ok(())
    }
}

/// Describes one event stream of an object: its identity, position and
/// the connection names of every store involved with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    /// Stream identifier, `<object-id-sans-dashes>-<zero-padded-generation>`.
    pub stream_identifier: String,

    /// Version of the most recently committed event, or
    /// [EMPTY_STREAM_VERSION] for an empty stream.
    pub current_stream_version: Version,

    /// Backend tag of this stream.
    pub stream_type: StreamType,

    /// Connection name of the data store holding the events.
    pub data_store: String,

    /// Connection name of the document store holding the manifest.
    pub document_store: String,

    /// Connection name of the snapshot store.
    #[serde(rename = "snapShotStore")]
    pub snapshot_store: String,

    /// Connection name of the stream-tag store.
    pub stream_tag_store: String,

    /// Connection name of the document-tag store.
    pub document_tag_store: String,

    /// Chunking configuration for this stream.
    pub chunk_settings: ChunkSettings,
}

impl StreamInfo {
    /// Whether no event has been committed to this stream yet.
    pub fn is_empty(&self) -> bool {
        self.current_stream_version == EMPTY_STREAM_VERSION
    }

    /// Number of events committed to this stream.
    pub fn event_count(&self) -> u64 {
        (self.current_stream_version + 1).max(0) as u64
    }
}

/// A closed stream retained in the manifest for history: the stream
/// attributes at the moment of closure, the closure reason and the
/// identifier of the continuation stream that succeeded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedStream {
    #[serde(flatten)]
    pub stream: StreamInfo,

    /// Why the stream was closed.
    pub reason: String,

    /// The stream that continues this one.
    pub continuation_stream_id: String,
}

/// Errors raised by the stream-identifier helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamIdentifierError {
    /// The identifier did not match `<id-sans-dashes>-<generation>`.
    #[error("stream identifier {0:?} does not end in a -<generation> suffix")]
    MalformedIdentifier(String),

    /// Chunking is enabled with a chunk size of zero.
    #[error("chunk settings are invalid: chunking is enabled with size 0")]
    InvalidChunkSettings,
}

impl ErrorCode for StreamIdentifierError {
    fn error_code(&self) -> &'static str {
        match self {
            StreamIdentifierError::MalformedIdentifier(_) => codes::CFG_INVALID_STREAM_IDENTIFIER,
            StreamIdentifierError::InvalidChunkSettings => codes::CFG_INVALID_CHUNK_SETTINGS,
        }
    }
}

/// Builds the stream identifier for the given object id and generation.
pub fn stream_identifier(object_id: &str, generation: u32) -> String {
    format!("{}-{:04}", object_id.replace('-', ""), generation)
}

/// Extracts the generation number from a stream identifier.
pub fn generation(stream_identifier: &str) -> Result<u32, StreamIdentifierError> {
    stream_identifier
        .rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .ok_or_else(|| StreamIdentifierError::MalformedIdentifier(stream_identifier.to_owned()))
}

/// Derives the identifier of the continuation stream succeeding the
/// given one: same object, next generation.
pub fn continuation_identifier(stream_identifier: &str) -> Result<String, StreamIdentifierError> {
    let (prefix, _) = stream_identifier
        .rsplit_once('-')
        .ok_or_else(|| StreamIdentifierError::MalformedIdentifier(stream_identifier.to_owned()))?;

    let next = generation(stream_identifier)? + 1;
    Ok(format!("{}-{:04}", prefix, next))
}
