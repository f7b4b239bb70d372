//! [SnapshotStore] implementation: one blob per snapshot at
//! `snapshots/<object_id>/<version>.json`.

use std::sync::Arc;

use async_trait::async_trait;
use manifold::snapshot::{Snapshot, SnapshotStore, SnapshotStoreError};
use manifold::version::Version;

use crate::container::{Container, WriteCondition};

/// Snapshot store over a blob [Container].
pub struct FsSnapshotStore {
    container: Arc<Container>,
}

impl FsSnapshotStore {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }

    fn dir(object_id: &str) -> String {
        format!("snapshots/{object_id}")
    }

    fn key(object_id: &str, version: Version) -> String {
        format!("snapshots/{object_id}/{version}.json")
    }

    fn processing(key: &str, source: impl Into<anyhow::Error>) -> SnapshotStoreError {
        SnapshotStoreError::Processing {
            key: key.to_owned(),
            source: source.into(),
        }
    }

    async fn versions(&self, object_id: &str) -> Result<Vec<Version>, SnapshotStoreError> {
        let dir = Self::dir(object_id);
        let names = self
            .container
            .list_dir(&dir)
            .await
            .map_err(|e| Self::processing(&dir, e))?;

        let mut versions: Vec<Version> = names
            .iter()
            .filter_map(|name| name.strip_suffix(".json")?.parse().ok())
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read(
        &self,
        object_id: &str,
        version: Version,
    ) -> Result<Option<Snapshot>, SnapshotStoreError> {
        let key = Self::key(object_id, version);

        let Some(blob) = self
            .container
            .try_read(&key)
            .await
            .map_err(|e| Self::processing(&key, e))?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&blob.bytes)
            .map(Some)
            .map_err(|source| SnapshotStoreError::Deserialize {
                key,
                source: source.into(),
            })
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
        let key = snapshot.key();
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| Self::processing(&key, e))?;

        self.container
            .write(&key, &body, WriteCondition::Any)
            .await
            .map_err(|e| Self::processing(&key, e))?;
        Ok(())
    }

    async fn load(
        &self,
        _object_name: &str,
        object_id: &str,
        version: Version,
    ) -> Result<Option<Snapshot>, SnapshotStoreError> {
        self.read(object_id, version).await
    }

    async fn latest(
        &self,
        _object_name: &str,
        object_id: &str,
    ) -> Result<Option<Snapshot>, SnapshotStoreError> {
        let Some(version) = self.versions(object_id).await?.pop() else {
            return Ok(None);
        };
        self.read(object_id, version).await
    }

    async fn list(
        &self,
        _object_name: &str,
        object_id: &str,
    ) -> Result<Vec<Snapshot>, SnapshotStoreError> {
        let mut snapshots = Vec::new();
        for version in self.versions(object_id).await?.into_iter().rev() {
            if let Some(snapshot) = self.read(object_id, version).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn delete(
        &self,
        _object_name: &str,
        object_id: &str,
        version: Version,
    ) -> Result<(), SnapshotStoreError> {
        let key = Self::key(object_id, version);
        self.container
            .delete(&key)
            .await
            .map_err(|e| Self::processing(&key, e))?;
        Ok(())
    }
}
