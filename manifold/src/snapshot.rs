//! Policy-driven snapshots: a post-commit hook that periodically
//! serializes aggregate state so rehydration does not have to fold the
//! whole stream, plus retention cleanup of old snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::document::ObjectDocument;
use crate::error::{codes, ErrorCode};
use crate::event::{Event, ReadSelect};
use crate::factory::Backends;
use crate::session::PostCommitAction;
use crate::version::Version;

/// A serialized aggregate state at a specific stream version, stored at
/// `snapshots/<object_id>/<version>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub object_name: String,
    pub object_id: String,
    pub stream_identifier: String,
    pub version: Version,
    pub taken_at: DateTime<Utc>,

    /// Opaque serialized aggregate state.
    pub state: String,
}

impl Snapshot {
    /// Storage key of this snapshot.
    pub fn key(&self) -> String {
        format!("snapshots/{}/{}.json", self.object_id, self.version)
    }
}

/// Per-aggregate snapshot policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPolicy {
    pub enabled: bool,

    /// Take a snapshot every N events.
    pub every: u64,

    /// Do not snapshot at all before this many events exist.
    pub min_events_before_snapshot: u64,

    /// How many snapshots to retain, newest first. At least one is
    /// always kept.
    pub keep_snapshots: usize,

    /// Snapshots younger than this are retained regardless of count.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "age_secs")]
    pub max_age: Option<Duration>,

    /// Budget for creating one snapshot; exceeding it fails the
    /// post-commit action with a "Timeout" cause.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timeout_secs")]
    pub timeout: Option<std::time::Duration>,
}

mod age_secs {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<chrono::Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.map(|d| d.num_seconds()).unwrap_or_default())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<chrono::Duration>, D::Error> {
        let secs = Option::<i64>::deserialize(deserializer)?;
        Ok(secs.map(chrono::Duration::seconds))
    }
}

mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<std::time::Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.map(|d| d.as_secs()).unwrap_or_default())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<std::time::Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(std::time::Duration::from_secs))
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            every: 100,
            min_events_before_snapshot: 0,
            keep_snapshots: 3,
            max_age: None,
            timeout: None,
        }
    }
}

impl SnapshotPolicy {
    /// Validates the policy.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.enabled && self.every == 0 {
            return Err(SnapshotError::InvalidPolicy {
                reason: "`every` must be greater than zero",
            });
        }

        Ok(())
    }

    /// Whether a snapshot is due.
    pub fn should_snapshot(&self, total_events: u64, events_since_last: u64) -> bool {
        self.enabled
            && total_events >= self.min_events_before_snapshot
            && events_since_last >= self.every
    }

    /// How many snapshots to keep at minimum.
    pub fn effective_keep(&self) -> usize {
        self.keep_snapshots.max(1)
    }
}

/// All possible error types returned by snapshot handling.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The policy is unusable.
    #[error("snapshot policy is invalid: {reason}")]
    InvalidPolicy { reason: &'static str },

    /// Snapshot creation exceeded the policy's budget.
    #[error("Timeout")]
    Timeout,
}

impl ErrorCode for SnapshotError {
    fn error_code(&self) -> &'static str {
        match self {
            SnapshotError::InvalidPolicy { .. } => codes::CFG_INVALID_SNAPSHOT_POLICY,
            SnapshotError::Timeout => codes::POST_COMMIT_FAILED,
        }
    }
}

/// All possible error types returned by a [SnapshotStore].
#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError {
    /// No snapshot exists under the requested key.
    #[error("snapshot {key} was not found")]
    NotFound { key: String },

    /// Persisted snapshot data could not be deserialized.
    #[error("failed to decode snapshot {key}: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transient I/O failure while talking to the backend.
    #[error("snapshot store failed while processing {key}: {source}")]
    Processing {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ErrorCode for SnapshotStoreError {
    fn error_code(&self) -> &'static str {
        match self {
            SnapshotStoreError::NotFound { .. } => codes::EXT_ENTRY_NOT_FOUND,
            SnapshotStoreError::Deserialize { .. } => codes::VAL_DESERIALIZATION,
            SnapshotStoreError::Processing { .. } => codes::EXT_PROCESSING,
        }
    }
}

/// Interface to the snapshot store.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists a snapshot, replacing any existing one at the same
    /// version.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError>;

    /// Loads the snapshot at the given version, or `None`.
    async fn load(
        &self,
        object_name: &str,
        object_id: &str,
        version: Version,
    ) -> Result<Option<Snapshot>, SnapshotStoreError>;

    /// Loads the newest snapshot, or `None`.
    async fn latest(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<Option<Snapshot>, SnapshotStoreError>;

    /// Lists all snapshots of an object, newest first.
    async fn list(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<Vec<Snapshot>, SnapshotStoreError>;

    /// Deletes the snapshot at the given version. Deleting an absent
    /// snapshot is not an error.
    async fn delete(
        &self,
        object_name: &str,
        object_id: &str,
        version: Version,
    ) -> Result<(), SnapshotStoreError>;
}

/// Produces the serialized aggregate state stored in a snapshot.
///
/// The handler hands over the prior snapshot (if any) and the events
/// recorded after it, so implementations can fold incrementally.
#[async_trait]
pub trait StateSerializer: Send + Sync {
    async fn snapshot_state(
        &self,
        document: &ObjectDocument,
        prior: Option<&Snapshot>,
        events: &[Event],
    ) -> anyhow::Result<String>;
}

/// The post-commit snapshot hook.
///
/// After each commit it consults the policy; when a snapshot is due it
/// folds the tail of the stream into a new snapshot and prunes old ones
/// per the retention rules.
pub struct SnapshotHandler {
    backends: Arc<Backends>,
    policy: SnapshotPolicy,
    serializer: Arc<dyn StateSerializer>,
}

impl SnapshotHandler {
    pub fn new(
        backends: Arc<Backends>,
        policy: SnapshotPolicy,
        serializer: Arc<dyn StateSerializer>,
    ) -> Result<Self, SnapshotError> {
        policy.validate()?;
        Ok(Self {
            backends,
            policy,
            serializer,
        })
    }

    async fn create_due_snapshot(&self, document: &ObjectDocument) -> anyhow::Result<()> {
        let backend = self.backends.resolve(&document.active.snapshot_store)?;
        let data = self.backends.resolve(&document.active.data_store)?.data.clone();

        let latest = backend
            .snapshots
            .latest(&document.object_name, &document.object_id)
            .await?;

        let current_version = document.active.current_stream_version;
        let total_events = document.active.event_count();
        let events_since_last = match &latest {
            Some(snapshot) => (current_version - snapshot.version).max(0) as u64,
            None => total_events,
        };

        if !self.policy.should_snapshot(total_events, events_since_last) {
            return Ok(());
        }

        let select = match &latest {
            Some(snapshot) => ReadSelect::From(snapshot.version + 1),
            None => ReadSelect::All,
        };

        let events = data.read(document, &document.active, select).await?;
        let state = self
            .serializer
            .snapshot_state(document, latest.as_ref(), &events)
            .await?;

        let snapshot = Snapshot {
            object_name: document.object_name.clone(),
            object_id: document.object_id.clone(),
            stream_identifier: document.active.stream_identifier.clone(),
            version: current_version,
            taken_at: Utc::now(),
            state,
        };

        backend.snapshots.save(&snapshot).await?;
        tracing::debug!(
            object = %document.object_id,
            version = current_version,
            "snapshot created"
        );

        prune(
            &*backend.snapshots,
            &self.policy,
            &document.object_name,
            &document.object_id,
            Utc::now(),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PostCommitAction for SnapshotHandler {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn run(&self, document: &ObjectDocument, _committed: &[Event]) -> anyhow::Result<()> {
        match self.policy.timeout {
            None => self.create_due_snapshot(document).await,
            Some(budget) => tokio::time::timeout(budget, self.create_due_snapshot(document))
                .await
                .map_err(|_| anyhow::Error::from(SnapshotError::Timeout))?,
        }
    }
}

/// Deletes snapshots outside the retention window: the policy's K newest
/// plus any within `max_age` survive, and at least one always does.
pub async fn prune(
    store: &dyn SnapshotStore,
    policy: &SnapshotPolicy,
    object_name: &str,
    object_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, SnapshotStoreError> {
    let snapshots = store.list(object_name, object_id).await?;
    let keep = policy.effective_keep();

    let mut removed = 0;
    for (index, snapshot) in snapshots.iter().enumerate() {
        if index < keep {
            continue;
        }

        let within_age = policy
            .max_age
            .is_some_and(|age| snapshot.taken_at + age > now);
        if within_age {
            continue;
        }

        store
            .delete(object_name, object_id, snapshot.version)
            .await?;
        removed += 1;
    }

    Ok(removed)
}
