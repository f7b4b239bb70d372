//! [StatusStore] implementation: one blob per (projection, object) at
//! `projection-status/<projection>_<object>.json`.

use std::sync::Arc;

use async_trait::async_trait;
use manifold::projection::{ProjectionStatusDocument, StatusStore, StatusStoreError};

use crate::container::{BlobError, Container, WriteCondition};

const STATUS_DIR: &str = "projection-status";

/// Projection-status store over a blob [Container].
pub struct FsStatusStore {
    container: Arc<Container>,
}

impl FsStatusStore {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }

    fn key(projection_name: &str, object_id: &str) -> String {
        format!("{STATUS_DIR}/{projection_name}_{object_id}.json")
    }

    fn processing(key: &str, source: impl Into<anyhow::Error>) -> StatusStoreError {
        StatusStoreError::Processing {
            key: key.to_owned(),
            source: source.into(),
        }
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<ProjectionStatusDocument, StatusStoreError> {
        serde_json::from_slice(bytes).map_err(|source| StatusStoreError::Deserialize {
            key: key.to_owned(),
            source: source.into(),
        })
    }
}

#[async_trait]
impl StatusStore for FsStatusStore {
    async fn get(
        &self,
        projection_name: &str,
        object_id: &str,
    ) -> Result<Option<ProjectionStatusDocument>, StatusStoreError> {
        let key = Self::key(projection_name, object_id);

        match self.container.try_read(&key).await {
            Ok(Some(blob)) => {
                let mut document = Self::decode(&key, &blob.bytes)?;
                document.etag = Some(blob.etag);
                Ok(Some(document))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Self::processing(&key, e)),
        }
    }

    async fn put(&self, document: &mut ProjectionStatusDocument) -> Result<(), StatusStoreError> {
        let key = Self::key(&document.projection_name, &document.object_id);
        let body = serde_json::to_vec_pretty(document).map_err(|e| Self::processing(&key, e))?;

        let condition = match &document.etag {
            Some(etag) => WriteCondition::IfMatch(etag.clone()),
            None => WriteCondition::IfNoneMatch,
        };

        match self.container.write(&key, &body, condition).await {
            Ok(etag) => {
                document.etag = Some(etag);
                Ok(())
            }
            Err(BlobError::Conflict { .. }) => Err(StatusStoreError::Conflict { key }),
            Err(e) => Err(Self::processing(&key, e)),
        }
    }

    async fn list(&self) -> Result<Vec<ProjectionStatusDocument>, StatusStoreError> {
        let names = self
            .container
            .list_dir(STATUS_DIR)
            .await
            .map_err(|e| Self::processing(STATUS_DIR, e))?;

        let mut documents = Vec::with_capacity(names.len());
        for name in names {
            let key = format!("{STATUS_DIR}/{name}");
            if let Some(blob) = self
                .container
                .try_read(&key)
                .await
                .map_err(|e| Self::processing(&key, e))?
            {
                let mut document = Self::decode(&key, &blob.bytes)?;
                document.etag = Some(blob.etag);
                documents.push(document);
            }
        }
        Ok(documents)
    }
}
