//! [DocumentStore] implementation: one manifest blob per object at
//! `<object_name>/<object_id>.json`, guarded by content-hash ETags.

use std::sync::Arc;

use async_trait::async_trait;
use manifold::document::ObjectDocument;
use manifold::store::{DocumentStore, DocumentStoreError};
use manifold::version::ConflictError;

use crate::container::{BlobError, Container, WriteCondition};

/// Manifest store over a blob [Container].
pub struct FsDocumentStore {
    container: Arc<Container>,
}

impl FsDocumentStore {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }

    fn processing(key: &str, source: impl Into<anyhow::Error>) -> DocumentStoreError {
        DocumentStoreError::Processing {
            key: key.to_owned(),
            source: source.into(),
        }
    }

    fn encode(document: &ObjectDocument) -> Result<Vec<u8>, DocumentStoreError> {
        serde_json::to_vec_pretty(document).map_err(|e| Self::processing(&document.key(), e))
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<ObjectDocument, DocumentStoreError> {
        serde_json::from_slice(bytes).map_err(|source| DocumentStoreError::Deserialize {
            key: key.to_owned(),
            source: source.into(),
        })
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    #[tracing::instrument(skip(self, document), fields(key = %document.key()))]
    async fn create(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError> {
        let key = document.key();
        let body = Self::encode(document)?;

        match self
            .container
            .write(&key, &body, WriteCondition::IfNoneMatch)
            .await
        {
            Ok(etag) => {
                document.etag = Some(etag);
                Ok(())
            }
            Err(BlobError::Conflict { .. }) => Err(DocumentStoreError::AlreadyExists { key }),
            Err(e) => Err(Self::processing(&key, e)),
        }
    }

    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, DocumentStoreError> {
        let key = format!("{object_name}/{object_id}.json");

        match self.container.try_read(&key).await {
            Ok(Some(blob)) => {
                let mut document = Self::decode(&key, &blob.bytes)?;
                document.etag = Some(blob.etag);
                Ok(document)
            }
            Ok(None) => Err(DocumentStoreError::DocumentNotFound { key }),
            Err(e) => Err(Self::processing(&key, e)),
        }
    }

    #[tracing::instrument(skip(self, document), fields(key = %document.key()))]
    async fn set(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError> {
        let key = document.key();

        let stored = match self.container.try_read(&key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Err(DocumentStoreError::DocumentNotFound { key }),
            Err(e) => return Err(Self::processing(&key, e)),
        };

        let Some(expected_etag) = document.etag.clone() else {
            return Err(DocumentStoreError::Conflict(ConflictError {
                stream_id: document.active.stream_identifier.clone(),
                expected: document.active.current_stream_version,
                actual: Self::decode(&key, &stored.bytes)?
                    .active
                    .current_stream_version,
            }));
        };

        if expected_etag != stored.etag {
            let current = Self::decode(&key, &stored.bytes)?;
            return Err(DocumentStoreError::Conflict(ConflictError {
                stream_id: document.active.stream_identifier.clone(),
                expected: document.active.current_stream_version,
                actual: current.active.current_stream_version,
            }));
        }

        // A write must advance the content hash, and carry one that
        // matches its own content.
        let current = Self::decode(&key, &stored.bytes)?;
        if !document.hash_is_current() || document.hash == current.hash {
            return Err(DocumentStoreError::StaleWrite { key });
        }

        let body = Self::encode(document)?;
        match self
            .container
            .write(&key, &body, WriteCondition::IfMatch(expected_etag))
            .await
        {
            Ok(etag) => {
                document.etag = Some(etag);
                Ok(())
            }
            Err(BlobError::Conflict { .. }) => {
                // Lost the race between the read above and the write.
                let actual = match self.container.try_read(&key).await {
                    Ok(Some(blob)) => {
                        Self::decode(&key, &blob.bytes)?.active.current_stream_version
                    }
                    _ => document.active.current_stream_version,
                };
                Err(DocumentStoreError::Conflict(ConflictError {
                    stream_id: document.active.stream_identifier.clone(),
                    expected: document.active.current_stream_version,
                    actual,
                }))
            }
            Err(e) => Err(Self::processing(&key, e)),
        }
    }
}
