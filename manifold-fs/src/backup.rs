//! [BackupStore] implementation: artifacts under `backups/…` and the
//! shared registry blob at `backup-registry/backup-registry.json`.

use std::sync::Arc;

use async_trait::async_trait;
use manifold::backup::{BackupRegistry, BackupStore, BackupStoreError, REGISTRY_KEY};

use crate::container::{BlobError, Container, WriteCondition};

/// Backup artifact and registry store over a blob [Container].
pub struct FsBackupStore {
    container: Arc<Container>,
}

impl FsBackupStore {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }

    fn processing(key: &str, source: impl Into<anyhow::Error>) -> BackupStoreError {
        BackupStoreError::Processing {
            key: key.to_owned(),
            source: source.into(),
        }
    }
}

#[async_trait]
impl BackupStore for FsBackupStore {
    async fn write_artifact(
        &self,
        location: &str,
        body: Vec<u8>,
    ) -> Result<(), BackupStoreError> {
        self.container
            .write(location, &body, WriteCondition::Any)
            .await
            .map_err(|e| Self::processing(location, e))?;
        Ok(())
    }

    async fn read_artifact(&self, location: &str) -> Result<Vec<u8>, BackupStoreError> {
        match self.container.try_read(location).await {
            Ok(Some(blob)) => Ok(blob.bytes),
            Ok(None) => Err(BackupStoreError::ArtifactNotFound {
                location: location.to_owned(),
            }),
            Err(e) => Err(Self::processing(location, e)),
        }
    }

    async fn delete_artifact(&self, location: &str) -> Result<(), BackupStoreError> {
        self.container
            .delete(location)
            .await
            .map_err(|e| Self::processing(location, e))?;
        Ok(())
    }

    async fn read_registry(&self) -> Result<BackupRegistry, BackupStoreError> {
        let Some(blob) = self
            .container
            .try_read(REGISTRY_KEY)
            .await
            .map_err(|e| Self::processing(REGISTRY_KEY, e))?
        else {
            return Ok(BackupRegistry::default());
        };

        let mut registry: BackupRegistry =
            serde_json::from_slice(&blob.bytes).map_err(|source| {
                BackupStoreError::Deserialize {
                    key: REGISTRY_KEY.to_owned(),
                    source: source.into(),
                }
            })?;
        registry.etag = Some(blob.etag);
        Ok(registry)
    }

    async fn write_registry(&self, registry: &mut BackupRegistry) -> Result<(), BackupStoreError> {
        let body =
            serde_json::to_vec_pretty(&registry).map_err(|e| Self::processing(REGISTRY_KEY, e))?;

        let condition = match &registry.etag {
            Some(etag) => WriteCondition::IfMatch(etag.clone()),
            None => WriteCondition::IfNoneMatch,
        };

        match self.container.write(REGISTRY_KEY, &body, condition).await {
            Ok(etag) => {
                registry.etag = Some(etag);
                Ok(())
            }
            Err(BlobError::Conflict { .. }) => Err(BackupStoreError::RegistryConflict),
            Err(e) => Err(Self::processing(REGISTRY_KEY, e)),
        }
    }
}
