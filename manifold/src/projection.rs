//! Projection-status coordination: one status document per
//! (projection, object), moved through the rebuild state machine by
//! token-guarded transitions.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{codes, ErrorCode};

/// Current state of a projection for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionStatus {
    Active,
    Rebuilding,
    CatchingUp,
    Disabled,
    Failed,
}

/// How a rebuild replaces the projection's derived state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildStrategy {
    /// Writes are held off while the projection rebuilds, then a
    /// catch-up pass folds the tail.
    BlockingWithCatchUp,
    /// The rebuild populates a parallel copy which is swapped in on
    /// completion.
    BlueGreen,
}

/// Time-bounded capability to transition a projection through its
/// rebuild states. Expiry enables stuck-rebuild recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildToken {
    pub projection_name: String,
    pub object_id: String,
    pub token_id: Uuid,
    pub strategy: RebuildStrategy,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RebuildToken {
    /// Whether the token can no longer drive transitions.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    fn matches(&self, other: &RebuildToken) -> bool {
        self.token_id == other.token_id
            && self.projection_name == other.projection_name
            && self.object_id == other.object_id
    }
}

/// Rebuild bookkeeping kept on the status document while one is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildInfo {
    pub strategy: RebuildStrategy,
    pub started_at: DateTime<Utc>,
}

/// The per-(projection, object) status document, stored at
/// `projection-status/<projection>_<object>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionStatusDocument {
    pub projection_name: String,
    pub object_id: String,
    pub status: ProjectionStatus,
    pub last_updated: DateTime<Utc>,

    /// Monotonic write counter of this document.
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_info: Option<RebuildInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<RebuildToken>,

    /// Storage-level concurrency token. Not part of the document body.
    #[serde(skip)]
    pub etag: Option<String>,
}

impl ProjectionStatusDocument {
    /// A fresh status document in the [ProjectionStatus::Active] state.
    pub fn new(projection_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            object_id: object_id.into(),
            status: ProjectionStatus::Active,
            last_updated: Utc::now(),
            version: 0,
            rebuild_info: None,
            token: None,
            etag: None,
        }
    }

    /// Storage key of this document.
    pub fn key(&self) -> String {
        format!(
            "projection-status/{}_{}.json",
            self.projection_name, self.object_id
        )
    }
}

/// All possible error types returned by a [StatusStore].
#[derive(Debug, thiserror::Error)]
pub enum StatusStoreError {
    /// A conditional write lost against a concurrent writer: the
    /// decision was computed from a checkpoint that is no longer
    /// current.
    #[error("projection status {key} changed since it was read")]
    Conflict { key: String },

    /// Persisted status data could not be deserialized.
    #[error("failed to decode projection status {key}: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transient I/O failure while talking to the backend.
    #[error("status store failed while processing {key}: {source}")]
    Processing {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ErrorCode for StatusStoreError {
    fn error_code(&self) -> &'static str {
        match self {
            StatusStoreError::Conflict { .. } => codes::STALE_CHECKPOINT,
            StatusStoreError::Deserialize { .. } => codes::VAL_DESERIALIZATION,
            StatusStoreError::Processing { .. } => codes::EXT_PROCESSING,
        }
    }
}

/// Interface to the projection-status documents.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Reads the status document, or `None` when absent.
    async fn get(
        &self,
        projection_name: &str,
        object_id: &str,
    ) -> Result<Option<ProjectionStatusDocument>, StatusStoreError>;

    /// Writes the status document conditionally: If-Match on the carried
    /// ETag, If-None-Match when the document carries none. Assigns a
    /// fresh ETag on success.
    async fn put(&self, document: &mut ProjectionStatusDocument) -> Result<(), StatusStoreError>;

    /// Lists every status document. Used by stuck-rebuild recovery.
    async fn list(&self) -> Result<Vec<ProjectionStatusDocument>, StatusStoreError>;
}

/// All possible error types returned by the [ProjectionCoordinator].
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// The requested transition is not legal from the document's
    /// current state.
    #[error("projection {projection}/{object_id} cannot {operation} while {from:?}")]
    InvalidTransition {
        projection: String,
        object_id: String,
        from: Option<ProjectionStatus>,
        operation: &'static str,
    },

    /// The presented token does not match the rebuild recorded on the
    /// document.
    #[error("rebuild token does not match the active rebuild of {projection}/{object_id}")]
    TokenMismatch {
        projection: String,
        object_id: String,
    },

    #[error(transparent)]
    Store(#[from] StatusStoreError),
}

impl ErrorCode for ProjectionError {
    fn error_code(&self) -> &'static str {
        match self {
            ProjectionError::InvalidTransition { .. } | ProjectionError::TokenMismatch { .. } => {
                codes::BIZ_CONSTRAINT
            }
            ProjectionError::Store(e) => e.error_code(),
        }
    }
}

/// Drives projection status documents through the rebuild state machine.
///
/// Every token-guarded write verifies token equality and is persisted
/// conditionally, so concurrent coordinators cannot double-apply a
/// transition.
#[derive(Clone)]
pub struct ProjectionCoordinator {
    store: Arc<dyn StatusStore>,
}

impl ProjectionCoordinator {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    /// Reads the current status document, if any.
    pub async fn status(
        &self,
        projection_name: &str,
        object_id: &str,
    ) -> Result<Option<ProjectionStatusDocument>, ProjectionError> {
        Ok(self.store.get(projection_name, object_id).await?)
    }

    /// `Active → Rebuilding`. Issues the token that guards the rest of
    /// the rebuild. An absent document counts as Active.
    #[tracing::instrument(skip(self))]
    pub async fn start_rebuild(
        &self,
        projection_name: &str,
        object_id: &str,
        strategy: RebuildStrategy,
        token_ttl: Duration,
    ) -> Result<RebuildToken, ProjectionError> {
        let mut document = self
            .store
            .get(projection_name, object_id)
            .await?
            .unwrap_or_else(|| ProjectionStatusDocument::new(projection_name, object_id));

        if document.status != ProjectionStatus::Active {
            return Err(ProjectionError::InvalidTransition {
                projection: projection_name.to_owned(),
                object_id: object_id.to_owned(),
                from: Some(document.status),
                operation: "start a rebuild",
            });
        }

        let now = Utc::now();
        let token = RebuildToken {
            projection_name: projection_name.to_owned(),
            object_id: object_id.to_owned(),
            token_id: Uuid::new_v4(),
            strategy,
            issued_at: now,
            expires_at: now + token_ttl,
        };

        document.status = ProjectionStatus::Rebuilding;
        document.rebuild_info = Some(RebuildInfo {
            strategy,
            started_at: now,
        });
        document.token = Some(token.clone());
        self.write(document, now).await?;

        Ok(token)
    }

    /// `Rebuilding → CatchingUp`.
    #[tracing::instrument(skip(self, token), fields(projection = %token.projection_name, object_id = %token.object_id))]
    pub async fn start_catch_up(&self, token: &RebuildToken) -> Result<(), ProjectionError> {
        let mut document = self
            .checked(token, ProjectionStatus::Rebuilding, "start catching up")
            .await?;

        document.status = ProjectionStatus::CatchingUp;
        self.write(document, Utc::now()).await
    }

    /// `CatchingUp → Active`. Clears the token and rebuild bookkeeping.
    #[tracing::instrument(skip(self, token), fields(projection = %token.projection_name, object_id = %token.object_id))]
    pub async fn complete_rebuild(&self, token: &RebuildToken) -> Result<(), ProjectionError> {
        let mut document = self
            .checked(token, ProjectionStatus::CatchingUp, "complete the rebuild")
            .await?;

        document.status = ProjectionStatus::Active;
        document.token = None;
        document.rebuild_info = None;
        self.write(document, Utc::now()).await
    }

    /// `Rebuilding → Active` when no error is given, `Rebuilding →
    /// Failed` otherwise.
    #[tracing::instrument(skip(self, token), fields(projection = %token.projection_name, object_id = %token.object_id))]
    pub async fn cancel_rebuild(
        &self,
        token: &RebuildToken,
        error: Option<String>,
    ) -> Result<(), ProjectionError> {
        let mut document = self
            .checked(token, ProjectionStatus::Rebuilding, "cancel the rebuild")
            .await?;

        document.status = match error {
            None => ProjectionStatus::Active,
            Some(reason) => {
                tracing::warn!(%reason, "projection rebuild failed");
                ProjectionStatus::Failed
            }
        };
        document.token = None;
        document.rebuild_info = None;
        self.write(document, Utc::now()).await
    }

    /// `* → Disabled`. Creates the document when absent. Any running
    /// rebuild is abandoned.
    #[tracing::instrument(skip(self))]
    pub async fn disable(
        &self,
        projection_name: &str,
        object_id: &str,
    ) -> Result<(), ProjectionError> {
        let mut document = self
            .store
            .get(projection_name, object_id)
            .await?
            .unwrap_or_else(|| ProjectionStatusDocument::new(projection_name, object_id));

        document.status = ProjectionStatus::Disabled;
        document.token = None;
        document.rebuild_info = None;
        self.write(document, Utc::now()).await
    }

    /// `Disabled → Active`. A no-op when the document is absent.
    #[tracing::instrument(skip(self))]
    pub async fn enable(
        &self,
        projection_name: &str,
        object_id: &str,
    ) -> Result<(), ProjectionError> {
        let Some(mut document) = self.store.get(projection_name, object_id).await? else {
            return Ok(());
        };

        if document.status != ProjectionStatus::Disabled {
            return Err(ProjectionError::InvalidTransition {
                projection: projection_name.to_owned(),
                object_id: object_id.to_owned(),
                from: Some(document.status),
                operation: "enable",
            });
        }

        document.status = ProjectionStatus::Active;
        self.write(document, Utc::now()).await
    }

    /// Transitions every `Rebuilding` document whose token expired
    /// before `now` back to `Active`, returning how many documents this
    /// caller recovered.
    ///
    /// Conditional writes make recovery exactly-once across concurrent
    /// callers: the loser of a race simply does not count the document.
    #[tracing::instrument(skip(self))]
    pub async fn recover_stuck_rebuilds(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, ProjectionError> {
        let mut recovered = 0;

        for mut document in self.store.list().await? {
            let stuck = document.status == ProjectionStatus::Rebuilding
                && document
                    .token
                    .as_ref()
                    .is_some_and(|token| token.is_expired(now));

            if !stuck {
                continue;
            }

            document.status = ProjectionStatus::Active;
            document.token = None;
            document.rebuild_info = None;

            match self.write(document, now).await {
                Ok(()) => recovered += 1,
                // Another caller recovered (or otherwise moved) this one.
                Err(ProjectionError::Store(StatusStoreError::Conflict { .. })) => {}
                Err(other) => return Err(other),
            }
        }

        Ok(recovered)
    }

    async fn checked(
        &self,
        token: &RebuildToken,
        expected: ProjectionStatus,
        operation: &'static str,
    ) -> Result<ProjectionStatusDocument, ProjectionError> {
        let document = self
            .store
            .get(&token.projection_name, &token.object_id)
            .await?;

        let Some(document) = document else {
            return Err(ProjectionError::InvalidTransition {
                projection: token.projection_name.clone(),
                object_id: token.object_id.clone(),
                from: None,
                operation,
            });
        };

        if !document
            .token
            .as_ref()
            .is_some_and(|held| held.matches(token))
        {
            return Err(ProjectionError::TokenMismatch {
                projection: token.projection_name.clone(),
                object_id: token.object_id.clone(),
            });
        }

        if document.status != expected {
            return Err(ProjectionError::InvalidTransition {
                projection: token.projection_name.clone(),
                object_id: token.object_id.clone(),
                from: Some(document.status),
                operation,
            });
        }

        Ok(document)
    }

    async fn write(
        &self,
        mut document: ProjectionStatusDocument,
        now: DateTime<Utc>,
    ) -> Result<(), ProjectionError> {
        document.last_updated = now;
        document.version += 1;
        self.store.put(&mut document).await?;
        Ok(())
    }
}
