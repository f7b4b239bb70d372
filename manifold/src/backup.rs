//! Crash-safe backup and restore of an object's events, with a shared
//! JSON registry of backup handles, retention-based cleanup and bulk
//! operations.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::document::ObjectDocument;
use crate::error::{codes, ErrorCode};
use crate::event::{Event, ReadSelect};
use crate::factory::{Backends, ConfigError};
use crate::snapshot::{Snapshot, SnapshotStoreError};
use crate::store::{DataStoreError, DocumentStoreError};
use crate::stream::TerminatedStream;
use crate::version::Version;

/// Storage key of the shared backup registry.
pub const REGISTRY_KEY: &str = "backup-registry/backup-registry.json";

/// Descriptor of a stored backup artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHandle {
    pub backup_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub provider_name: String,

    /// Storage location of the artifact,
    /// `backups/<object_id>/<backup_id>.backup.json(.gz)`.
    pub location: String,

    pub object_id: String,
    pub object_name: String,
    pub stream_version: Version,
    pub event_count: u64,
    pub size_bytes: u64,

    pub includes_snapshots: bool,
    pub includes_object_document: bool,
    pub includes_terminated_streams: bool,
    pub is_compressed: bool,

    /// SHA-256 (hex) over the uncompressed artifact body.
    pub checksum: String,
}

/// A registry entry: the handle plus its retention TTL and free-form
/// tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredBackup {
    #[serde(flatten)]
    pub handle: BackupHandle,

    /// Seconds after `created_at` until the entry is cleanup-eligible.
    /// `None` keeps the backup forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

impl RegisteredBackup {
    /// Whether the retention TTL has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.retention_seconds
            .is_some_and(|secs| self.handle.created_at + Duration::seconds(secs) <= now)
    }
}

/// The registry document: a list of entries plus its storage ETag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRegistry {
    pub entries: Vec<RegisteredBackup>,

    #[serde(skip)]
    pub etag: Option<String>,
}

impl BackupRegistry {
    /// Drops duplicate registrations (same backup id), keeping the
    /// first. Registration is at-most-once per writer but the registry
    /// is shared, so duplicates are reconciled on read.
    pub fn reconcile(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.entries.retain(|entry| seen.insert(entry.handle.backup_id));
    }
}

/// All possible error types returned by a [BackupStore].
#[derive(Debug, thiserror::Error)]
pub enum BackupStoreError {
    /// No artifact exists at the location.
    #[error("backup artifact {location} was not found")]
    ArtifactNotFound { location: String },

    /// The registry changed since it was read (conditional write lost).
    #[error("backup registry changed since it was read")]
    RegistryConflict,

    /// Persisted data could not be deserialized.
    #[error("failed to decode backup data at {key}: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transient I/O failure while talking to the backend.
    #[error("backup store failed while processing {key}: {source}")]
    Processing {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ErrorCode for BackupStoreError {
    fn error_code(&self) -> &'static str {
        match self {
            BackupStoreError::ArtifactNotFound { .. } => codes::FILE_BLOB_NOT_FOUND,
            BackupStoreError::RegistryConflict => codes::CONCURRENCY_CONFLICT,
            BackupStoreError::Deserialize { .. } => codes::VAL_DESERIALIZATION,
            BackupStoreError::Processing { .. } => codes::EXT_PROCESSING,
        }
    }
}

/// Interface to the backup artifact store and its registry.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Writes an artifact body to a location, replacing any previous
    /// content.
    async fn write_artifact(&self, location: &str, body: Vec<u8>)
        -> Result<(), BackupStoreError>;

    /// Reads an artifact body.
    async fn read_artifact(&self, location: &str) -> Result<Vec<u8>, BackupStoreError>;

    /// Deletes an artifact. Deleting an absent artifact is not an error.
    async fn delete_artifact(&self, location: &str) -> Result<(), BackupStoreError>;

    /// Reads the registry with its ETag. A missing registry reads as
    /// empty.
    async fn read_registry(&self) -> Result<BackupRegistry, BackupStoreError>;

    /// Conditionally writes the registry: If-Match on the carried ETag,
    /// If-None-Match when it carries none.
    async fn write_registry(&self, registry: &mut BackupRegistry) -> Result<(), BackupStoreError>;
}

/// Knobs of a single backup run.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub compress: bool,
    pub include_object_document: bool,
    pub include_terminated_streams: bool,
    pub include_snapshots: bool,
    pub retention: Option<Duration>,
    pub tags: HashMap<String, String>,
}

impl BackupOptions {
    /// The options used by scheduled full backups: everything included,
    /// compressed.
    pub fn full() -> Self {
        Self {
            compress: true,
            include_object_document: true,
            include_terminated_streams: true,
            include_snapshots: true,
            retention: None,
            tags: HashMap::new(),
        }
    }
}

/// Registry query filter. Empty filters match everything not expired.
#[derive(Debug, Clone, Default)]
pub struct BackupQuery {
    pub object_name: Option<String>,
    pub object_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub tag: Option<(String, String)>,
    pub include_expired: bool,
}

impl BackupQuery {
    fn matches(&self, entry: &RegisteredBackup, now: DateTime<Utc>) -> bool {
        if !self.include_expired && entry.is_expired(now) {
            return false;
        }
        if let Some(name) = &self.object_name {
            if &entry.handle.object_name != name {
                return false;
            }
        }
        if let Some(id) = &self.object_id {
            if &entry.handle.object_id != id {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if entry.handle.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if entry.handle.created_at >= before {
                return false;
            }
        }
        if let Some((key, value)) = &self.tag {
            if entry.tags.get(key) != Some(value) {
                return false;
            }
        }
        true
    }
}

/// Events of one terminated stream captured in an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedStreamBackup {
    pub stream: TerminatedStream,
    pub events: Vec<Event>,
}

/// The serialized artifact body (before optional compression).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub backup_id: Uuid,
    pub object_name: String,
    pub object_id: String,
    pub created_at: DateTime<Utc>,
    pub stream_version: Version,

    /// Events of the active stream, in version order.
    pub events: Vec<Event>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<ObjectDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terminated_streams: Vec<TerminatedStreamBackup>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<Snapshot>,
}

/// Summary of a completed restore.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreSummary {
    pub object_id: String,
    pub stream_version: Version,
    pub event_count: u64,
    pub snapshots_restored: usize,
}

/// All possible error types returned by the [BackupService].
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataStoreError),

    #[error(transparent)]
    Document(#[from] DocumentStoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotStoreError),

    #[error(transparent)]
    Store(#[from] BackupStoreError),

    #[error("failed to encode backup artifact: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode backup artifact: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to (de)compress backup artifact: {0}")]
    Compression(#[source] std::io::Error),

    #[error("backup checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The restore target holds events of a different object.
    #[error("restore target {target} is not empty and does not match backup of {backed_up}")]
    TargetMismatch { target: String, backed_up: String },

    /// The registry stayed contended across every retry.
    #[error("backup registry stayed contended, giving up")]
    RegistryContention,
}

impl ErrorCode for BackupError {
    fn error_code(&self) -> &'static str {
        match self {
            BackupError::Config(e) => e.error_code(),
            BackupError::Data(e) => e.error_code(),
            BackupError::Document(e) => e.error_code(),
            BackupError::Snapshot(e) => e.error_code(),
            BackupError::Store(e) => e.error_code(),
            BackupError::Encode(_) | BackupError::Decode(_) => codes::VAL_DESERIALIZATION,
            BackupError::Compression(_) => codes::EXT_PROCESSING,
            BackupError::ChecksumMismatch { .. } => codes::VAL_DESERIALIZATION,
            BackupError::TargetMismatch { .. } => codes::BIZ_CONSTRAINT,
            BackupError::RegistryContention => codes::STALE_CHECKPOINT,
        }
    }
}

/// Progress notification emitted by bulk operations.
#[derive(Debug, Clone)]
pub enum BulkProgress {
    Completed { object_id: String },
    Failed { object_id: String, error: String },
}

/// Callback receiving [BulkProgress] notifications.
pub type ProgressFn = Arc<dyn Fn(&BulkProgress) + Send + Sync>;

/// Knobs of bulk backup/restore runs.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// How many objects are processed concurrently.
    pub concurrency: usize,

    /// Keep going after individual failures instead of stopping at the
    /// first one.
    pub continue_on_error: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            continue_on_error: false,
        }
    }
}

/// One failed object of a bulk run.
#[derive(Debug, Clone)]
pub struct BulkFailure {
    pub object_id: String,
    pub error: String,
}

/// Outcome of a bulk backup.
#[derive(Debug, Clone, Default)]
pub struct BulkBackupReport {
    pub handles: Vec<BackupHandle>,
    pub failures: Vec<BulkFailure>,
}

/// Outcome of a bulk restore.
#[derive(Debug, Clone, Default)]
pub struct BulkRestoreReport {
    pub restored: Vec<RestoreSummary>,
    pub failures: Vec<BulkFailure>,
}

const REGISTRY_WRITE_ATTEMPTS: usize = 4;

/// Backs up and restores objects through a [BackupStore] provider.
#[derive(Clone)]
pub struct BackupService {
    backends: Arc<Backends>,
    store: Arc<dyn BackupStore>,
    provider_name: String,
}

impl BackupService {
    pub fn new(
        backends: Arc<Backends>,
        store: Arc<dyn BackupStore>,
        provider_name: impl Into<String>,
    ) -> Self {
        Self {
            backends,
            store,
            provider_name: provider_name.into(),
        }
    }

    /// Serializes the object's events (and optionally its manifest,
    /// terminated streams and snapshots) into one artifact, registers it
    /// and returns the handle.
    #[tracing::instrument(skip(self, document, options), fields(object_id = %document.object_id))]
    pub async fn backup(
        &self,
        document: &ObjectDocument,
        options: &BackupOptions,
    ) -> Result<BackupHandle, BackupError> {
        let backup_id = Uuid::new_v4();
        let created_at = Utc::now();

        let data = self
            .backends
            .resolve(&document.active.data_store)?
            .data
            .clone();
        let events = data.read(document, &document.active, ReadSelect::All).await?;

        let mut terminated_streams = Vec::new();
        if options.include_terminated_streams {
            for terminated in &document.terminated_streams {
                let data = self
                    .backends
                    .resolve(&terminated.stream.data_store)?
                    .data
                    .clone();
                let events = data
                    .read(document, &terminated.stream, ReadSelect::All)
                    .await?;
                terminated_streams.push(TerminatedStreamBackup {
                    stream: terminated.clone(),
                    events,
                });
            }
        }

        let mut snapshots = Vec::new();
        if options.include_snapshots {
            let store = self
                .backends
                .resolve(&document.active.snapshot_store)?
                .snapshots
                .clone();
            snapshots = store
                .list(&document.object_name, &document.object_id)
                .await?;
        }

        let artifact = BackupArtifact {
            backup_id,
            object_name: document.object_name.clone(),
            object_id: document.object_id.clone(),
            created_at,
            stream_version: document.active.current_stream_version,
            events,
            document: options.include_object_document.then(|| {
                let mut body = document.clone();
                body.etag = None;
                body
            }),
            terminated_streams,
            snapshots,
        };

        let body = serde_json::to_vec(&artifact).map_err(BackupError::Encode)?;
        let checksum = hex::encode(Sha256::digest(&body));
        let event_count = artifact.events.len() as u64;

        let stored = if options.compress {
            compress(&body).map_err(BackupError::Compression)?
        } else {
            body
        };

        let location = format!(
            "backups/{}/{}.backup.json{}",
            document.object_id,
            backup_id,
            if options.compress { ".gz" } else { "" },
        );

        let handle = BackupHandle {
            backup_id,
            created_at,
            provider_name: self.provider_name.clone(),
            location: location.clone(),
            object_id: document.object_id.clone(),
            object_name: document.object_name.clone(),
            stream_version: document.active.current_stream_version,
            event_count,
            size_bytes: stored.len() as u64,
            includes_snapshots: options.include_snapshots,
            includes_object_document: options.include_object_document,
            includes_terminated_streams: options.include_terminated_streams,
            is_compressed: options.compress,
            checksum,
        };

        self.store.write_artifact(&location, stored).await?;

        let entry = RegisteredBackup {
            handle: handle.clone(),
            retention_seconds: options.retention.map(|r| r.num_seconds()),
            tags: options.tags.clone(),
        };
        self.update_registry(move |registry| registry.entries.push(entry.clone()))
            .await?;

        tracing::info!(%backup_id, location, event_count, "backup completed");
        Ok(handle)
    }

    /// Restores a backup into the target manifest.
    ///
    /// The target must either be empty or belong to the same object id
    /// as the backup; restored events keep their original timestamps.
    #[tracing::instrument(skip(self, target, handle), fields(object_id = %target.object_id, backup_id = %handle.backup_id))]
    pub async fn restore(
        &self,
        target: &mut ObjectDocument,
        handle: &BackupHandle,
    ) -> Result<RestoreSummary, BackupError> {
        let target_is_empty = target.active.is_empty() && target.terminated_streams.is_empty();
        if !target_is_empty && target.object_id != handle.object_id {
            return Err(BackupError::TargetMismatch {
                target: target.object_id.clone(),
                backed_up: handle.object_id.clone(),
            });
        }

        let stored = self.store.read_artifact(&handle.location).await?;
        let body = if handle.is_compressed {
            decompress(&stored).map_err(BackupError::Compression)?
        } else {
            stored
        };

        let actual = hex::encode(Sha256::digest(&body));
        if actual != handle.checksum {
            return Err(BackupError::ChecksumMismatch {
                expected: handle.checksum.clone(),
                actual,
            });
        }

        let artifact: BackupArtifact = serde_json::from_slice(&body).map_err(BackupError::Decode)?;

        let data = self
            .backends
            .resolve(&target.active.data_store)?
            .data
            .clone();

        // Only the suffix beyond the target's current position is
        // appended; into an empty target that is the whole history.
        let first_missing = target.active.current_stream_version + 1;
        let to_append: Vec<Event> = artifact
            .events
            .iter()
            .filter(|e| e.event_version >= first_missing)
            .cloned()
            .collect();

        if !to_append.is_empty() {
            data.append(target, &target.active, true, to_append).await?;
        }

        if target_is_empty && !artifact.terminated_streams.is_empty() {
            for terminated in &artifact.terminated_streams {
                let data = self
                    .backends
                    .resolve(&terminated.stream.stream.data_store)?
                    .data
                    .clone();

                // The target's storage holds nothing for this stream yet.
                let mut into = terminated.stream.stream.clone();
                into.current_stream_version = crate::version::EMPTY_STREAM_VERSION;
                data.append(target, &into, true, terminated.events.clone())
                    .await?;
            }
            target.terminated_streams = artifact
                .terminated_streams
                .iter()
                .map(|t| t.stream.clone())
                .collect();
        }

        let before_hash = target.hash.clone();
        target.active.current_stream_version = artifact.stream_version;
        target.seal();

        // Restoring onto an already-identical state has nothing to publish.
        if target.hash != before_hash {
            let documents = self
                .backends
                .resolve(&target.active.document_store)?
                .documents
                .clone();
            documents.set(target).await?;
        }

        let mut snapshots_restored = 0;
        if !artifact.snapshots.is_empty() {
            let store = self
                .backends
                .resolve(&target.active.snapshot_store)?
                .snapshots
                .clone();
            for snapshot in &artifact.snapshots {
                store.save(snapshot).await?;
                snapshots_restored += 1;
            }
        }

        Ok(RestoreSummary {
            object_id: target.object_id.clone(),
            stream_version: target.active.current_stream_version,
            event_count: artifact.events.len() as u64,
            snapshots_restored,
        })
    }

    /// Queries the registry.
    pub async fn query(&self, query: &BackupQuery) -> Result<Vec<RegisteredBackup>, BackupError> {
        let mut registry = self.store.read_registry().await?;
        registry.reconcile();

        let now = Utc::now();
        Ok(registry
            .entries
            .into_iter()
            .filter(|entry| query.matches(entry, now))
            .collect())
    }

    /// Deletes expired artifacts and drops their registry entries,
    /// returning the removed handles.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_expired(&self) -> Result<Vec<BackupHandle>, BackupError> {
        let now = Utc::now();

        let mut registry = self.store.read_registry().await?;
        registry.reconcile();

        let expired: Vec<RegisteredBackup> = registry
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .cloned()
            .collect();

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        for entry in &expired {
            self.store.delete_artifact(&entry.handle.location).await?;
        }

        let removed: Vec<Uuid> = expired.iter().map(|e| e.handle.backup_id).collect();
        self.update_registry(move |registry| {
            registry
                .entries
                .retain(|entry| !removed.contains(&entry.handle.backup_id));
        })
        .await?;

        Ok(expired.into_iter().map(|e| e.handle).collect())
    }

    /// Backs up many objects with bounded concurrency.
    pub async fn backup_many(
        &self,
        documents: Vec<ObjectDocument>,
        options: &BackupOptions,
        bulk: &BulkOptions,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> BulkBackupReport {
        let mut report = BulkBackupReport::default();

        let mut results = futures::stream::iter(documents.into_iter().map(|document| {
            let object_id = document.object_id.clone();
            async move { (object_id, self.backup(&document, options).await) }
        }))
        .buffer_unordered(bulk.concurrency.max(1));

        while let Some((object_id, result)) = results.next().await {
            if cancel.is_cancelled() {
                break;
            }

            let notification = match result {
                Ok(handle) => {
                    report.handles.push(handle);
                    BulkProgress::Completed {
                        object_id: object_id.clone(),
                    }
                }
                Err(error) => {
                    let error = error.to_string();
                    report.failures.push(BulkFailure {
                        object_id: object_id.clone(),
                        error: error.clone(),
                    });
                    BulkProgress::Failed { object_id, error }
                }
            };

            if let Some(progress) = &progress {
                progress(&notification);
            }

            if !bulk.continue_on_error && !report.failures.is_empty() {
                break;
            }
        }

        report
    }

    /// Restores many objects with bounded concurrency.
    pub async fn restore_many(
        &self,
        targets: Vec<(ObjectDocument, BackupHandle)>,
        bulk: &BulkOptions,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> BulkRestoreReport {
        let mut report = BulkRestoreReport::default();

        let mut results = futures::stream::iter(targets.into_iter().map(
            |(mut document, handle)| async move {
                let object_id = document.object_id.clone();
                (object_id, self.restore(&mut document, &handle).await)
            },
        ))
        .buffer_unordered(bulk.concurrency.max(1));

        while let Some((object_id, result)) = results.next().await {
            if cancel.is_cancelled() {
                break;
            }

            let notification = match result {
                Ok(summary) => {
                    report.restored.push(summary);
                    BulkProgress::Completed {
                        object_id: object_id.clone(),
                    }
                }
                Err(error) => {
                    let error = error.to_string();
                    report.failures.push(BulkFailure {
                        object_id: object_id.clone(),
                        error: error.clone(),
                    });
                    BulkProgress::Failed { object_id, error }
                }
            };

            if let Some(progress) = &progress {
                progress(&notification);
            }

            if !bulk.continue_on_error && !report.failures.is_empty() {
                break;
            }
        }

        report
    }

    /// Read-modify-write cycle on the shared registry, retried on
    /// conditional-write conflicts.
    async fn update_registry<F>(&self, mutate: F) -> Result<(), BackupError>
    where
        F: Fn(&mut BackupRegistry) + Send,
    {
        for _ in 0..REGISTRY_WRITE_ATTEMPTS {
            let mut registry = self.store.read_registry().await?;
            registry.reconcile();
            mutate(&mut registry);

            match self.store.write_registry(&mut registry).await {
                Ok(()) => return Ok(()),
                Err(BackupStoreError::RegistryConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(BackupError::RegistryContention)
    }
}

fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

fn decompress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::document::StreamDefaults;
    use crate::store::memory::InMemoryBackend;
    use crate::store::{DataStore, DocumentStore};

    fn service() -> (BackupService, Arc<Backends>, Arc<InMemoryBackend>) {
        let memory = Arc::new(InMemoryBackend::default());
        let mut backends = Backends::new();
        backends.register("default", Arc::new(memory.backend()));
        let backends = Arc::new(backends);

        let service = BackupService::new(Arc::clone(&backends), memory.clone(), "memory");
        (service, backends, memory)
    }

    async fn object_with_events(memory: &InMemoryBackend, id: &str, n: usize) -> ObjectDocument {
        let mut document =
            ObjectDocument::new("project", id, &StreamDefaults::default()).unwrap();
        memory.create(&mut document).await.unwrap();

        let events: Vec<Event> = (0..n)
            .map(|i| {
                let mut event = Event::new(
                    if i % 2 == 0 { "Created.1" } else { "Renamed.1" },
                    format!("{{\"n\":{i}}}"),
                );
                event.event_version = i as Version;
                event
            })
            .collect();

        memory
            .append(&document, &document.active, false, events)
            .await
            .unwrap();
        document.active.current_stream_version = n as Version - 1;
        document.seal();
        memory.set(&mut document).await.unwrap();
        document
    }

    #[tokio::test]
    async fn compressed_backup_round_trips_into_an_empty_target() {
        let (service, _, memory) = service();
        let source = object_with_events(&memory, "P1", 50).await;

        let options = BackupOptions {
            compress: true,
            include_object_document: true,
            ..BackupOptions::default()
        };
        let handle = service.backup(&source, &options).await.unwrap();

        assert_eq!(handle.event_count, 50);
        assert!(handle.is_compressed);
        assert!(handle.location.ends_with(".backup.json.gz"));

        let mut target =
            ObjectDocument::new("project", "P2", &StreamDefaults::default()).unwrap();
        memory.create(&mut target).await.unwrap();

        let summary = service.restore(&mut target, &handle).await.unwrap();
        assert_eq!(summary.event_count, 50);
        assert_eq!(summary.stream_version, 49);

        let original = memory
            .read(&source, &source.active, ReadSelect::All)
            .await
            .unwrap();
        let restored = memory
            .read(&target, &target.active, ReadSelect::All)
            .await
            .unwrap();

        assert_eq!(original.len(), restored.len());
        for (a, b) in original.iter().zip(&restored) {
            assert_eq!(a.event_type, b.event_type);
            assert_eq!(a.event_version, b.event_version);
            assert_eq!(a.payload, b.payload);
            // preserve_timestamp keeps the original write times.
            assert_eq!(a.timestamp, b.timestamp);
        }
    }

    #[tokio::test]
    async fn corrupted_artifacts_fail_the_checksum() {
        let (service, _, memory) = service();
        let source = object_with_events(&memory, "P1", 3).await;

        let handle = service
            .backup(&source, &BackupOptions::default())
            .await
            .unwrap();

        let mut body = memory.read_artifact(&handle.location).await.unwrap();
        body[10] ^= 0xff;
        memory.write_artifact(&handle.location, body).await.unwrap();

        let mut target =
            ObjectDocument::new("project", "P3", &StreamDefaults::default()).unwrap();
        memory.create(&mut target).await.unwrap();

        let err = service
            .restore(&mut target, &handle)
            .await
            .expect_err("artifact was corrupted");
        assert!(matches!(err, BackupError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn restore_rejects_a_foreign_non_empty_target() {
        let (service, _, memory) = service();
        let source = object_with_events(&memory, "P1", 2).await;
        let mut other = object_with_events(&memory, "P9", 2).await;

        let handle = service
            .backup(&source, &BackupOptions::default())
            .await
            .unwrap();

        let err = service
            .restore(&mut other, &handle)
            .await
            .expect_err("different object and not empty");
        assert!(matches!(err, BackupError::TargetMismatch { .. }));
        assert_eq!(err.error_code(), codes::BIZ_CONSTRAINT);
    }

    #[tokio::test]
    async fn query_filters_by_object_tag_and_expiry() {
        let (service, _, memory) = service();
        let p1 = object_with_events(&memory, "P1", 1).await;
        let p2 = object_with_events(&memory, "P2", 1).await;

        let tagged = BackupOptions {
            tags: HashMap::from([("env".to_owned(), "prod".to_owned())]),
            ..BackupOptions::default()
        };
        service.backup(&p1, &tagged).await.unwrap();

        let expiring = BackupOptions {
            retention: Some(Duration::seconds(-1)),
            ..BackupOptions::default()
        };
        service.backup(&p2, &expiring).await.unwrap();

        let all = service.query(&BackupQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1, "expired entries are hidden by default");
        assert_eq!(all[0].handle.object_id, "P1");

        let with_expired = service
            .query(&BackupQuery {
                include_expired: true,
                ..BackupQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(with_expired.len(), 2);

        let by_tag = service
            .query(&BackupQuery {
                tag: Some(("env".to_owned(), "prod".to_owned())),
                ..BackupQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].handle.object_id, "P1");
    }

    #[tokio::test]
    async fn cleanup_removes_expired_artifacts_and_entries() {
        let (service, _, memory) = service();
        let p1 = object_with_events(&memory, "P1", 1).await;

        let expiring = BackupOptions {
            retention: Some(Duration::seconds(-1)),
            ..BackupOptions::default()
        };
        let handle = service.backup(&p1, &expiring).await.unwrap();

        let removed = service.cleanup_expired().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].backup_id, handle.backup_id);

        assert!(matches!(
            memory.read_artifact(&handle.location).await,
            Err(BackupStoreError::ArtifactNotFound { .. })
        ));
        assert!(service
            .query(&BackupQuery {
                include_expired: true,
                ..BackupQuery::default()
            })
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn bulk_backup_reports_progress_and_collects_failures() {
        let (service, _, memory) = service();
        let p1 = object_with_events(&memory, "P1", 2).await;
        let p2 = object_with_events(&memory, "P2", 2).await;

        // A document pointing at an unknown store fails its backup.
        let mut broken = object_with_events(&memory, "P3", 1).await;
        broken.active.data_store = "nowhere".to_owned();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let seen = Arc::clone(&seen);
            Arc::new(move |p: &BulkProgress| {
                seen.lock().unwrap().push(format!("{p:?}"));
            })
        };

        let report = service
            .backup_many(
                vec![p1, p2, broken],
                &BackupOptions::default(),
                &BulkOptions {
                    concurrency: 1,
                    continue_on_error: true,
                },
                Some(progress),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.handles.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].object_id, "P3");
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
