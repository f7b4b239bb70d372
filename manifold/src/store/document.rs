//! The [DocumentStore] contract: persist and read the object-document
//! manifest with conditional-write (ETag / If-Match) semantics.

use async_trait::async_trait;

use crate::document::ObjectDocument;
use crate::error::{codes, ErrorCode};
use crate::version::ConflictError;

/// All possible error types returned by a [DocumentStore].
#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    /// `create` found the manifest key already present.
    #[error("object document {key} already exists")]
    AlreadyExists { key: String },

    /// `get` found no manifest under the key.
    #[error("object document {key} was not found")]
    DocumentNotFound { key: String },

    /// `set` lost the optimistic concurrency race: the stored manifest
    /// changed since this writer read it.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// `set` was handed a manifest whose content hash does not advance
    /// the stored one, or does not match its own content.
    #[error("manifest write for {key} does not advance the content hash")]
    StaleWrite { key: String },

    /// Persisted manifest data could not be deserialized.
    #[error("failed to decode object document {key}: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transient I/O failure while talking to the backend.
    #[error("document store failed while processing {key}: {source}")]
    Processing {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ErrorCode for DocumentStoreError {
    fn error_code(&self) -> &'static str {
        match self {
            DocumentStoreError::AlreadyExists { .. } => codes::EXT_DOCUMENT_ALREADY_EXISTS,
            DocumentStoreError::DocumentNotFound { .. } => codes::EXT_DOCUMENT_NOT_FOUND,
            DocumentStoreError::Conflict(_) => codes::CONCURRENCY_CONFLICT,
            DocumentStoreError::StaleWrite { .. } => codes::STALE_CHECKPOINT,
            DocumentStoreError::Deserialize { .. } => codes::VAL_DESERIALIZATION,
            DocumentStoreError::Processing { .. } => codes::EXT_PROCESSING,
        }
    }
}

/// Interface to the manifest store.
///
/// The manifest is the only shared mutable resource of an object; its
/// ETag is the single source of truth for concurrency control. Readers
/// are never blocked.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persists a freshly built manifest under
    /// `"<object_name>/<object_id>.json"`, assigning its first ETag.
    ///
    /// Fails with [DocumentStoreError::AlreadyExists] when the key is
    /// present (If-None-Match semantics).
    async fn create(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError>;

    /// Reads the manifest, or fails with
    /// [DocumentStoreError::DocumentNotFound].
    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, DocumentStoreError>;

    /// Conditionally replaces the stored manifest, keyed on the
    /// document's ETag (If-Match semantics), assigning a fresh ETag on
    /// success.
    ///
    /// Rejects writes that do not advance the content hash with
    /// [DocumentStoreError::StaleWrite]; rejects ETag mismatches with
    /// [DocumentStoreError::Conflict].
    async fn set(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError>;
}
