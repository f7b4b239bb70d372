//! [LockProvider] implementation: lease blobs under `leases/`, holding
//! the owner id and expiry, taken over when expired.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use manifold::lock::{DistributedLock, LockError, LockProvider};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container::{Blob, BlobError, Container, WriteCondition};
use crate::encode_component;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseBody {
    lock_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

fn lease_key(key: &str) -> String {
    format!("leases/{}.json", encode_component(key))
}

fn processing(key: &str, source: impl Into<anyhow::Error>) -> LockError {
    LockError::Processing {
        key: key.to_owned(),
        source: source.into(),
    }
}

fn decode(key: &str, blob: &Blob) -> Result<LeaseBody, LockError> {
    serde_json::from_slice(&blob.bytes).map_err(|e| processing(key, e))
}

fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// A lease held as a blob.
pub struct FsLock {
    container: Arc<Container>,
    key: String,
    lock_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl DistributedLock for FsLock {
    fn lock_key(&self) -> &str {
        &self.key
    }

    fn lock_id(&self) -> &str {
        &self.lock_id
    }

    fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    async fn renew(&mut self, ttl: Duration) -> Result<bool, LockError> {
        let blob_key = lease_key(&self.key);

        let Some(blob) = self
            .container
            .try_read(&blob_key)
            .await
            .map_err(|e| processing(&self.key, e))?
        else {
            return Ok(false);
        };

        let mut body = decode(&self.key, &blob)?;
        if body.lock_id != self.lock_id {
            return Ok(false);
        }

        body.expires_at = Utc::now() + ttl_to_chrono(ttl);
        let bytes = serde_json::to_vec(&body).map_err(|e| processing(&self.key, e))?;

        match self
            .container
            .write(&blob_key, &bytes, WriteCondition::IfMatch(blob.etag))
            .await
        {
            Ok(_) => {
                self.expires_at = body.expires_at;
                Ok(true)
            }
            // Someone took the lease over between the read and the write.
            Err(BlobError::Conflict { .. }) => Ok(false),
            Err(e) => Err(processing(&self.key, e)),
        }
    }

    async fn release(&mut self) -> Result<(), LockError> {
        let blob_key = lease_key(&self.key);

        let Some(blob) = self
            .container
            .try_read(&blob_key)
            .await
            .map_err(|e| processing(&self.key, e))?
        else {
            return Ok(());
        };

        if decode(&self.key, &blob)?.lock_id != self.lock_id {
            // Already taken over; treat as released.
            return Ok(());
        }

        self.container
            .delete(&blob_key)
            .await
            .map_err(|e| processing(&self.key, e))?;
        Ok(())
    }
}

/// Lease provider over a blob [Container].
pub struct FsLockProvider {
    container: Arc<Container>,
}

impl FsLockProvider {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }
}

#[async_trait]
impl LockProvider for FsLockProvider {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Box<dyn DistributedLock>, LockError> {
        let blob_key = lease_key(key);
        let now = Utc::now();

        let current = self
            .container
            .try_read(&blob_key)
            .await
            .map_err(|e| processing(key, e))?;

        let condition = match &current {
            Some(blob) => {
                let body = decode(key, blob)?;
                if body.expires_at > now {
                    return Err(LockError::AlreadyHeld {
                        key: key.to_owned(),
                    });
                }
                // Expired: take it over conditionally.
                WriteCondition::IfMatch(blob.etag.clone())
            }
            None => WriteCondition::IfNoneMatch,
        };

        let body = LeaseBody {
            lock_id: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + ttl_to_chrono(ttl),
        };
        let bytes = serde_json::to_vec(&body).map_err(|e| processing(key, e))?;

        match self.container.write(&blob_key, &bytes, condition).await {
            Ok(_) => Ok(Box::new(FsLock {
                container: Arc::clone(&self.container),
                key: key.to_owned(),
                lock_id: body.lock_id,
                acquired_at: body.acquired_at,
                expires_at: body.expires_at,
            })),
            Err(BlobError::Conflict { .. }) => Err(LockError::AlreadyHeld {
                key: key.to_owned(),
            }),
            Err(e) => Err(processing(key, e)),
        }
    }
}
