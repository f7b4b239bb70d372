//! The object-document manifest: one per (object name, object id),
//! tracking the active stream, its terminated predecessors, the schema
//! version and the content hash that guards every write.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{codes, ErrorCode};
use crate::stream::{
    self, ChunkSettings, StreamInfo, StreamType, TerminatedStream,
};
use crate::version::{Version, VersionToken, EMPTY_STREAM_VERSION};

/// Error returned when an object name or id is not safe to use as a
/// storage key component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object name or id {value:?}: only [A-Za-z0-9._-] is allowed")]
pub struct InvalidObjectId {
    pub value: String,
}

impl ErrorCode for InvalidObjectId {
    fn error_code(&self) -> &'static str {
        codes::CFG_INVALID_OBJECT_ID
    }
}

/// Validates a path component used in storage keys.
///
/// Both the object name and the object id must match `^[A-Za-z0-9._-]+$`;
/// anything else is rejected before touching storage.
pub fn validate_key_component(value: &str) -> Result<(), InvalidObjectId> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if !valid {
        return Err(InvalidObjectId {
            value: value.to_owned(),
        });
    }

    Ok(())
}

/// Attributes applied to the manifest and its first stream when an
/// object is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDefaults {
    pub stream_type: StreamType,
    pub data_store: String,
    pub document_store: String,
    pub snapshot_store: String,
    pub stream_tag_store: String,
    pub document_tag_store: String,
    pub chunk_settings: ChunkSettings,
    pub schema_version: String,
}

impl StreamDefaults {
    /// Defaults pointing every connection name at the same named store.
    pub fn for_store(stream_type: StreamType, store_name: impl Into<String>) -> Self {
        let name = store_name.into();
        Self {
            stream_type,
            data_store: name.clone(),
            document_store: name.clone(),
            snapshot_store: name.clone(),
            stream_tag_store: name.clone(),
            document_tag_store: name,
            chunk_settings: ChunkSettings::default(),
            schema_version: "1".to_owned(),
        }
    }
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self::for_store(StreamType::InMemory, "default")
    }
}

/// The per-object manifest.
///
/// A manifest is created on first get-or-create, mutated only through a
/// leased session's commit (or the migration executor), and never
/// deleted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDocument {
    /// Identifier of the object within its object name.
    pub object_id: String,

    /// Lowercased logical name of the object (the aggregate name).
    pub object_name: String,

    /// Schema version of the manifest itself.
    pub schema_version: String,

    /// Content hash over (active, terminated streams, schema version).
    pub hash: String,

    /// Hash the manifest carried before the most recent write.
    pub prev_hash: String,

    /// The one stream currently accepting appends. Never absent.
    pub active: StreamInfo,

    /// Previously active streams, newest first.
    pub terminated_streams: Vec<TerminatedStream>,

    /// Storage-level concurrency token. Not part of the document body.
    #[serde(skip)]
    pub etag: Option<String>,
}

impl ObjectDocument {
    /// Builds the manifest for a new object with an empty generation-0
    /// stream. The caller persists it through a document store.
    pub fn new(
        object_name: &str,
        object_id: &str,
        defaults: &StreamDefaults,
    ) -> Result<Self, InvalidObjectId> {
        validate_key_component(object_name)?;
        validate_key_component(object_id)?;

        let active = StreamInfo {
            stream_identifier: stream::stream_identifier(object_id, 0),
            current_stream_version: EMPTY_STREAM_VERSION,
            stream_type: defaults.stream_type,
            data_store: defaults.data_store.clone(),
            document_store: defaults.document_store.clone(),
            snapshot_store: defaults.snapshot_store.clone(),
            stream_tag_store: defaults.stream_tag_store.clone(),
            document_tag_store: defaults.document_tag_store.clone(),
            chunk_settings: defaults.chunk_settings,
        };

        let mut document = Self {
            object_id: object_id.to_owned(),
            object_name: object_name.to_lowercase(),
            schema_version: defaults.schema_version.clone(),
            hash: String::new(),
            prev_hash: String::new(),
            active,
            terminated_streams: Vec::new(),
            etag: None,
        };

        document.hash = document.compute_hash();
        Ok(document)
    }

    /// Storage key of this manifest: `<object_name>/<object_id>.json`.
    pub fn key(&self) -> String {
        format!("{}/{}.json", self.object_name, self.object_id)
    }

    /// Computes the content hash: SHA-256 (hex) over the canonical JSON
    /// of (active, terminated streams, schema version).
    pub fn compute_hash(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct HashBody<'a> {
            active: &'a StreamInfo,
            terminated_streams: &'a [TerminatedStream],
            schema_version: &'a str,
        }

        let body = serde_json::to_vec(&HashBody {
            active: &self.active,
            terminated_streams: &self.terminated_streams,
            schema_version: &self.schema_version,
        })
        .expect("manifest hash body serialization cannot fail");

        hex::encode(Sha256::digest(body))
    }

    /// Whether the stored hash matches the current content.
    pub fn hash_is_current(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Recomputes the content hash after a mutation, rotating the old
    /// hash into `prev_hash`. A no-op when the content did not change.
    pub fn seal(&mut self) {
        let next = self.compute_hash();
        if next != self.hash {
            self.prev_hash = std::mem::replace(&mut self.hash, next);
        }
    }

    /// Moves the active stream into the terminated list (newest first)
    /// and installs its successor as the new active stream.
    ///
    /// The caller is responsible for having appended the closing event to
    /// the outgoing stream, and for sealing + persisting the manifest.
    pub fn terminate_active(&mut self, reason: impl Into<String>, successor: StreamInfo) {
        let terminated = TerminatedStream {
            continuation_stream_id: successor.stream_identifier.clone(),
            reason: reason.into(),
            stream: std::mem::replace(&mut self.active, successor),
        };

        self.terminated_streams.insert(0, terminated);
    }

    /// Finds a stream by identifier among the active stream and the
    /// terminated predecessors.
    pub fn stream(&self, stream_identifier: &str) -> Option<&StreamInfo> {
        if self.active.stream_identifier == stream_identifier {
            return Some(&self.active);
        }

        self.terminated_streams
            .iter()
            .map(|t| &t.stream)
            .find(|s| s.stream_identifier == stream_identifier)
    }

    /// Builds the [VersionToken] for an event of the active stream.
    pub fn version_token(&self, event_version: Version) -> VersionToken {
        VersionToken {
            object_name: self.object_name.clone(),
            object_id: self.object_id.clone(),
            stream_identifier: self.active.stream_identifier.clone(),
            event_version,
        }
    }
}
