//! [TagStore] implementation: inverse index blobs at
//! `tags/<scope>-by-tag/<tag>.json`, one sorted identifier list per
//! object name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use manifold::document::ObjectDocument;
use manifold::store::{TagScope, TagStore, TagStoreError};

use crate::container::{Blob, BlobError, Container, WriteCondition};
use crate::encode_component;

type TagIndex = BTreeMap<String, Vec<String>>;

const UPDATE_ATTEMPTS: usize = 4;

/// One scope of the inverse tag index over a blob [Container].
pub struct FsTagStore {
    container: Arc<Container>,
    scope: TagScope,
}

impl FsTagStore {
    pub fn new(container: Arc<Container>, scope: TagScope) -> Self {
        Self { container, scope }
    }

    fn key(&self, tag: &str) -> String {
        format!("tags/{}/{}.json", self.scope.key_prefix(), encode_component(tag))
    }

    fn processing(tag: &str, source: impl Into<anyhow::Error>) -> TagStoreError {
        TagStoreError::Processing {
            tag: tag.to_owned(),
            source: source.into(),
        }
    }

    fn decode(tag: &str, blob: &Blob) -> Result<TagIndex, TagStoreError> {
        serde_json::from_slice(&blob.bytes).map_err(|source| TagStoreError::Deserialize {
            tag: tag.to_owned(),
            source: source.into(),
        })
    }

    /// Read-modify-write on the index blob, retried on conditional-write
    /// conflicts. Returns after `mutate` reports no change was needed.
    async fn update<F>(&self, tag: &str, mutate: F) -> Result<(), TagStoreError>
    where
        F: Fn(&mut TagIndex) -> bool + Send,
    {
        let key = self.key(tag);

        for _ in 0..UPDATE_ATTEMPTS {
            let current = self
                .container
                .try_read(&key)
                .await
                .map_err(|e| Self::processing(tag, e))?;

            let (mut index, condition) = match &current {
                Some(blob) => (
                    Self::decode(tag, blob)?,
                    WriteCondition::IfMatch(blob.etag.clone()),
                ),
                None => (TagIndex::new(), WriteCondition::IfNoneMatch),
            };

            if !mutate(&mut index) {
                return Ok(());
            }

            let body =
                serde_json::to_vec(&index).map_err(|e| Self::processing(tag, e))?;
            match self.container.write(&key, &body, condition).await {
                Ok(_) => return Ok(()),
                Err(BlobError::Conflict { .. }) => continue,
                Err(e) => return Err(Self::processing(tag, e)),
            }
        }

        Err(Self::processing(
            tag,
            anyhow::anyhow!("tag index stayed contended"),
        ))
    }
}

#[async_trait]
impl TagStore for FsTagStore {
    async fn set(&self, document: &ObjectDocument, tag: &str) -> Result<(), TagStoreError> {
        let object_name = document.object_name.clone();
        let id = self.scope.identifier_of(document);

        self.update(tag, move |index| {
            let ids = index.entry(object_name.clone()).or_default();
            match ids.binary_search(&id) {
                Ok(_) => false,
                Err(position) => {
                    ids.insert(position, id.clone());
                    true
                }
            }
        })
        .await
    }

    async fn get(&self, object_name: &str, tag: &str) -> Result<Vec<String>, TagStoreError> {
        let key = self.key(tag);

        let Some(blob) = self
            .container
            .try_read(&key)
            .await
            .map_err(|e| Self::processing(tag, e))?
        else {
            return Ok(Vec::new());
        };

        Ok(Self::decode(tag, &blob)?
            .remove(object_name)
            .unwrap_or_default())
    }

    async fn remove(&self, document: &ObjectDocument, tag: &str) -> Result<(), TagStoreError> {
        let object_name = document.object_name.clone();
        let id = self.scope.identifier_of(document);

        self.update(tag, move |index| {
            let Some(ids) = index.get_mut(&object_name) else {
                return false;
            };
            let Ok(position) = ids.binary_search(&id) else {
                return false;
            };

            ids.remove(position);
            if ids.is_empty() {
                index.remove(&object_name);
            }
            true
        })
        .await
    }
}
