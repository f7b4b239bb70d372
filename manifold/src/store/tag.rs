//! The [TagStore] contract: a bidirectional index from tag to object or
//! stream identifiers.

use async_trait::async_trait;

use crate::document::ObjectDocument;
use crate::error::{codes, ErrorCode};

/// Which identifier a tag store records for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagScope {
    /// Tags map to object ids, scoped by object name.
    Document,
    /// Tags map to stream identifiers, scoped by object name.
    Stream,
}

impl TagScope {
    /// The identifier this scope records for the given manifest.
    pub fn identifier_of(&self, document: &ObjectDocument) -> String {
        match self {
            TagScope::Document => document.object_id.clone(),
            TagScope::Stream => document.active.stream_identifier.clone(),
        }
    }

    /// Directory component of the inverse-index key,
    /// `tags/<scope>-by-tag/<tag>.json`.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            TagScope::Document => "document-by-tag",
            TagScope::Stream => "stream-by-tag",
        }
    }
}

/// All possible error types returned by a [TagStore].
#[derive(Debug, thiserror::Error)]
pub enum TagStoreError {
    /// Persisted tag-index data could not be deserialized.
    #[error("failed to decode tag index {tag}: {source}")]
    Deserialize {
        tag: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transient I/O failure while talking to the backend.
    #[error("tag store failed while processing tag {tag}: {source}")]
    Processing {
        tag: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ErrorCode for TagStoreError {
    fn error_code(&self) -> &'static str {
        match self {
            TagStoreError::Deserialize { .. } => codes::VAL_DESERIALIZATION,
            TagStoreError::Processing { .. } => codes::EXT_PROCESSING,
        }
    }
}

/// Interface to one tag index (document-scoped or stream-scoped).
///
/// The inverse layout stores one entry per tag holding the sorted list
/// of identifiers: updates merge into the list, removes rewrite it.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Records the association between the document and the tag.
    /// Idempotent.
    async fn set(&self, document: &ObjectDocument, tag: &str) -> Result<(), TagStoreError>;

    /// Returns the identifiers associated with the tag, sorted. An
    /// unknown tag yields an empty list.
    async fn get(&self, object_name: &str, tag: &str) -> Result<Vec<String>, TagStoreError>;

    /// Removes the association. Removing an absent association is not an
    /// error.
    async fn remove(&self, document: &ObjectDocument, tag: &str) -> Result<(), TagStoreError>;
}
