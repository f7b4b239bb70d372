//! Stream lifecycle: open → closing → closed, and the live-migration
//! executor that moves an object onto a new stream layout by copying its
//! events and closing the predecessor.

use std::sync::Arc;

use async_trait::async_trait;

use crate::document::ObjectDocument;
use crate::error::{codes, ErrorCode};
use crate::event::{Event, ReadSelect, StreamClosure};
use crate::factory::{Backends, ConfigError};
use crate::lock::{LockError, DEFAULT_LEASE_TTL};
use crate::store::{DataStore, DataStoreError, DocumentStoreError};
use crate::stream::{
    continuation_identifier, ChunkSettings, StreamIdentifierError, StreamInfo, StreamType,
};
use crate::version::EMPTY_STREAM_VERSION;

/// Lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Accepting appends.
    Open,
    /// The stream's last committed event closes it, but the manifest
    /// still lists it as active.
    Closing,
    /// The manifest has moved the stream into its terminated list.
    Closed,
}

/// Determines the lifecycle state of a stream of the given manifest.
pub async fn stream_state(
    document: &ObjectDocument,
    stream_identifier: &str,
    data: &dyn DataStore,
) -> Result<StreamState, DataStoreError> {
    if document
        .terminated_streams
        .iter()
        .any(|t| t.stream.stream_identifier == stream_identifier)
    {
        return Ok(StreamState::Closed);
    }

    let Some(stream) = document.stream(stream_identifier) else {
        // Unknown to the manifest: nothing has been committed, so it is
        // trivially open.
        return Ok(StreamState::Open);
    };

    if stream.is_empty() {
        return Ok(StreamState::Open);
    }

    let version = stream.current_stream_version;
    let tail = data
        .read(document, stream, ReadSelect::Range(version, version))
        .await?;

    Ok(match tail.last() {
        Some(event) if event.is_stream_closure() => StreamState::Closing,
        _ => StreamState::Open,
    })
}

/// Where a migration moves the object's stream.
#[derive(Debug, Clone)]
pub struct MigrationTarget {
    pub stream_type: StreamType,
    pub data_store: String,

    /// Defaults to the source stream's document store: the manifest
    /// stays where the aggregate's routing can find it unless the
    /// deployment re-routes the aggregate as well.
    pub document_store: Option<String>,

    /// Defaults to the source stream's snapshot store.
    pub snapshot_store: Option<String>,

    /// Defaults to the source stream's chunk settings.
    pub chunk_settings: Option<ChunkSettings>,
}

impl MigrationTarget {
    /// Moves the stream's events to another backend, keeping everything
    /// else where it is.
    pub fn to_store(stream_type: StreamType, store_name: impl Into<String>) -> Self {
        Self {
            stream_type,
            data_store: store_name.into(),
            document_store: None,
            snapshot_store: None,
            chunk_settings: None,
        }
    }
}

/// Rewrites events while they are copied to the migration target.
/// Versions are positional and preserved regardless of what the
/// transformation returns.
#[async_trait]
pub trait EventTransformer: Send + Sync {
    async fn transform(&self, event: Event) -> anyhow::Result<Event>;
}

/// Outcome of a completed migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub from_stream: String,
    pub to_stream: String,
    pub events_copied: usize,

    /// How many close attempts it took to land on a stable manifest.
    pub attempts: u32,
}

/// All possible error types returned by the [MigrationExecutor].
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identifier(#[from] StreamIdentifierError),

    #[error(transparent)]
    Data(#[from] DataStoreError),

    #[error(transparent)]
    Document(#[from] DocumentStoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The migration lease was lost mid-flight.
    #[error("migration lease on {key} was lost")]
    LockLost { key: String },

    /// The event transformation failed.
    #[error("event transformation failed at version {version}: {source}")]
    Transform {
        version: crate::version::Version,
        #[source]
        source: anyhow::Error,
    },

    /// The active stream changed underneath the migration (another
    /// migration completed first).
    #[error("active stream of {object_id} changed during migration")]
    SourceChanged { object_id: String },

    /// The manifest kept moving; the closure never landed on the
    /// observed state.
    #[error("manifest of {object_id} kept changing, closure did not land after {attempts} attempts")]
    StaleManifest { object_id: String, attempts: u32 },
}

impl ErrorCode for MigrationError {
    fn error_code(&self) -> &'static str {
        match self {
            MigrationError::Config(e) => e.error_code(),
            MigrationError::Identifier(e) => e.error_code(),
            MigrationError::Data(e) => e.error_code(),
            MigrationError::Document(e) => e.error_code(),
            MigrationError::Lock(e) => e.error_code(),
            MigrationError::LockLost { .. } => codes::CONCURRENCY_CONFLICT,
            MigrationError::Transform { .. } => codes::EXT_PROCESSING,
            MigrationError::SourceChanged { .. } => codes::STALE_CHECKPOINT,
            MigrationError::StaleManifest { .. } => codes::STALE_CHECKPOINT,
        }
    }
}

const MAX_CLOSE_ATTEMPTS: u32 = 5;

/// Executes live migrations: open the target stream, copy the events
/// (optionally transformed), close the source with a [StreamClosure]
/// event and swap the manifest's active stream.
///
/// Holds a lease for the duration so concurrent migrations of the same
/// object exclude each other; ordinary commits are fenced by the
/// conditional append and the manifest ETag instead.
pub struct MigrationExecutor {
    backends: Arc<Backends>,
}

impl MigrationExecutor {
    pub fn new(backends: Arc<Backends>) -> Self {
        Self { backends }
    }

    /// Migrates the object onto the target layout, updating the manifest
    /// in place.
    #[tracing::instrument(skip(self, document, target, transform), fields(object_id = %document.object_id))]
    pub async fn migrate(
        &self,
        document: &mut ObjectDocument,
        target: &MigrationTarget,
        transform: Option<&dyn EventTransformer>,
        reason: &str,
    ) -> Result<MigrationReport, MigrationError> {
        if let Some(settings) = target.chunk_settings {
            settings.validate()?;
        }

        let locks = self
            .backends
            .resolve(&document.active.data_store)?
            .locks
            .clone();
        let lock_key = format!(
            "migrations/{}/{}",
            document.object_name, document.object_id
        );
        let mut lock = locks.acquire(&lock_key, DEFAULT_LEASE_TTL).await?;

        let result = self
            .migrate_locked(document, target, transform, reason, &lock_key, &mut *lock)
            .await;

        lock.release().await?;
        result
    }

    async fn migrate_locked(
        &self,
        document: &mut ObjectDocument,
        target: &MigrationTarget,
        transform: Option<&dyn EventTransformer>,
        reason: &str,
        lock_key: &str,
        lock: &mut dyn crate::lock::DistributedLock,
    ) -> Result<MigrationReport, MigrationError> {
        let source_id = document.active.stream_identifier.clone();
        let successor_id = continuation_identifier(&source_id)?;

        let source_backend = self.backends.resolve(&document.active.data_store)?;
        let target_backend = self.backends.resolve(&target.data_store)?;
        let documents = self
            .backends
            .resolve(&document.active.document_store)?
            .documents
            .clone();

        let mut successor = StreamInfo {
            stream_identifier: successor_id.clone(),
            current_stream_version: EMPTY_STREAM_VERSION,
            stream_type: target.stream_type,
            data_store: target.data_store.clone(),
            document_store: target
                .document_store
                .clone()
                .unwrap_or_else(|| document.active.document_store.clone()),
            snapshot_store: target
                .snapshot_store
                .clone()
                .unwrap_or_else(|| document.active.snapshot_store.clone()),
            stream_tag_store: document.active.stream_tag_store.clone(),
            document_tag_store: document.active.document_tag_store.clone(),
            chunk_settings: target
                .chunk_settings
                .unwrap_or(document.active.chunk_settings),
        };

        let mut copied_through = EMPTY_STREAM_VERSION;
        let mut events_copied = 0usize;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if attempts > MAX_CLOSE_ATTEMPTS {
                return Err(MigrationError::StaleManifest {
                    object_id: document.object_id.clone(),
                    attempts: attempts - 1,
                });
            }

            if !lock.renew(DEFAULT_LEASE_TTL).await? {
                return Err(MigrationError::LockLost {
                    key: lock_key.to_owned(),
                });
            }

            // Observe the latest manifest; background writers may have
            // appended since the previous pass.
            *document = documents
                .get(&document.object_name, &document.object_id)
                .await?;
            if document.active.stream_identifier != source_id {
                return Err(MigrationError::SourceChanged {
                    object_id: document.object_id.clone(),
                });
            }

            let source_current = document.active.current_stream_version;

            // Copy the tail that has not been moved over yet.
            if copied_through < source_current {
                let tail = source_backend
                    .data
                    .read(
                        document,
                        &document.active,
                        ReadSelect::Range(copied_through + 1, source_current),
                    )
                    .await?;

                let mut batch = Vec::with_capacity(tail.len());
                for event in tail {
                    let version = event.event_version;
                    let mut transformed = match transform {
                        Some(transformer) => transformer
                            .transform(event)
                            .await
                            .map_err(|source| MigrationError::Transform { version, source })?,
                        None => event,
                    };
                    transformed.event_version = version;
                    batch.push(transformed);
                }

                successor.current_stream_version = copied_through;
                target_backend
                    .data
                    .append(document, &successor, true, batch)
                    .await?;

                events_copied += (source_current - copied_through) as usize;
                copied_through = source_current;
                successor.current_stream_version = source_current;
            }

            // Close the source right behind its observed tail.
            let mut closing = StreamClosure {
                reason: reason.to_owned(),
                continuation_stream_id: successor_id.clone(),
                data_store: successor.data_store.clone(),
                document_store: successor.document_store.clone(),
                stream_type: successor.stream_type,
            }
            .into_event();
            closing.event_version = source_current + 1;

            match source_backend
                .data
                .append(document, &document.active, false, vec![closing])
                .await
            {
                Ok(_) => {}
                // A commit slipped in between observation and closure:
                // observe again and copy the new tail.
                Err(DataStoreError::ConcurrentAppend { .. }) => {
                    tracing::debug!(object_id = %document.object_id, "source moved before closure, retrying");
                    continue;
                }
                Err(DataStoreError::StreamClosed { .. }) => {
                    return Err(MigrationError::SourceChanged {
                        object_id: document.object_id.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            }

            // Swap the active stream and publish.
            let mut next = document.clone();
            next.active.current_stream_version = source_current + 1;
            next.terminate_active(reason, successor.clone());
            next.seal();

            match documents.set(&mut next).await {
                Ok(()) => {
                    *document = next;
                    tracing::info!(
                        object_id = %document.object_id,
                        from = %source_id,
                        to = %successor_id,
                        events_copied,
                        attempts,
                        "migration completed"
                    );
                    return Ok(MigrationReport {
                        from_stream: source_id,
                        to_stream: successor_id,
                        events_copied,
                        attempts,
                    });
                }
                Err(DocumentStoreError::Conflict(_)) => {
                    // Roll the closure back; the slot is still ours
                    // because concurrent appends are fenced off by it.
                    source_backend
                        .data
                        .remove_events_for_failed_commit(
                            document,
                            &document.active,
                            source_current + 1,
                            source_current + 1,
                        )
                        .await?;
                    continue;
                }
                Err(e) => {
                    source_backend
                        .data
                        .remove_events_for_failed_commit(
                            document,
                            &document.active,
                            source_current + 1,
                            source_current + 1,
                        )
                        .await?;
                    return Err(e.into());
                }
            }
        }
    }
}
