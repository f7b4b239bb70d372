//! In-memory implementation of every store contract, backed by a
//! thread-safe shared state. Used for testing and embedded deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::backup::{BackupRegistry, BackupStore, BackupStoreError};
use crate::document::ObjectDocument;
use crate::event::{Event, ReadSelect, StreamClosure};
use crate::factory::Backend;
use crate::lock::{DistributedLock, LockError, LockProvider};
use crate::projection::{ProjectionStatusDocument, StatusStore, StatusStoreError};
use crate::snapshot::{Snapshot, SnapshotStore, SnapshotStoreError};
use crate::store::{
    DataStore, DataStoreError, DocumentStore, DocumentStoreError, TagScope, TagStore,
    TagStoreError,
};
use crate::stream::StreamInfo;
use crate::version::{ConflictError, Version, EMPTY_STREAM_VERSION};

#[derive(Default)]
struct State {
    events: HashMap<String, BTreeMap<Version, Event>>,
    documents: HashMap<String, (ObjectDocument, String)>,
    tags: HashMap<String, BTreeSet<String>>,
    snapshots: HashMap<String, BTreeMap<Version, Snapshot>>,
    artifacts: HashMap<String, Vec<u8>>,
    registry: Option<(Vec<crate::backup::RegisteredBackup>, String)>,
    statuses: HashMap<String, (ProjectionStatusDocument, String)>,
    locks: HashMap<String, (String, DateTime<Utc>)>,
    etag_counter: u64,
}

impl State {
    fn next_etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("W/\"{}\"", self.etag_counter)
    }
}

fn stream_key(document: &ObjectDocument, stream: &StreamInfo) -> String {
    format!(
        "{}/{}/{}",
        document.object_name, document.object_id, stream.stream_identifier
    )
}

fn object_key(object_name: &str, object_id: &str) -> String {
    format!("{object_name}/{object_id}")
}

/// In-memory backend implementing all store contracts, backed by a
/// thread-safe shared state behind an [`RwLock`].
///
/// Clones share the same state, so one instance can back every store
/// slot of a [Backend].
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<State>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a [Backend] whose every store is this instance.
    pub fn backend(&self) -> Backend {
        let this = Arc::new(self.clone());
        Backend {
            stream_type: crate::stream::StreamType::InMemory,
            data: this.clone(),
            documents: this.clone(),
            document_tags: Arc::new(InMemoryTagStore {
                scope: TagScope::Document,
                inner: Arc::clone(&self.inner),
            }),
            stream_tags: Arc::new(InMemoryTagStore {
                scope: TagScope::Stream,
                inner: Arc::clone(&self.inner),
            }),
            snapshots: this.clone(),
            backups: this.clone(),
            locks: this.clone(),
            status: this,
        }
    }

    /// Test hook: the raw events stored for a stream, including any not
    /// yet referenced by a manifest.
    pub fn stored_events(&self, document: &ObjectDocument, stream: &StreamInfo) -> Vec<Event> {
        self.inner
            .read()
            .events
            .get(&stream_key(document, stream))
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DataStore for InMemoryBackend {
    async fn append(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        preserve_timestamp: bool,
        events: Vec<Event>,
    ) -> Result<Version, DataStoreError> {
        if events.is_empty() {
            return Ok(stream.current_stream_version);
        }

        let mut state = self.inner.write();
        let stored = state.events.entry(stream_key(document, stream)).or_default();

        // A closing event at the stored tail refuses appends, whether or
        // not the writer's manifest has caught up with the closure yet.
        if let Some((_, last)) = stored.last_key_value() {
            if last.is_stream_closure() {
                return Err(DataStoreError::StreamClosed {
                    stream_id: stream.stream_identifier.clone(),
                    continuation: StreamClosure::from_event(last).map(|c| c.continuation_stream_id),
                });
            }
        }

        // Conditional append: the stored tail must still be where the
        // writer's manifest said it was.
        let tail = stored
            .last_key_value()
            .map(|(version, _)| *version)
            .unwrap_or(EMPTY_STREAM_VERSION);
        if tail != stream.current_stream_version {
            return Err(DataStoreError::ConcurrentAppend {
                stream_id: stream.stream_identifier.clone(),
                expected: stream.current_stream_version,
                found: tail,
            });
        }

        let mut expected = tail + 1;
        for event in &events {
            if event.event_version != expected {
                return Err(DataStoreError::NonContiguousAppend {
                    stream_id: stream.stream_identifier.clone(),
                    expected,
                    found: event.event_version,
                });
            }
            expected += 1;
        }

        let now = Utc::now();
        let mut new_tail = tail;
        for mut event in events {
            if !preserve_timestamp {
                event.timestamp = Some(now);
            }
            new_tail = event.event_version;
            stored.insert(event.event_version, event);
        }

        Ok(new_tail)
    }

    async fn read(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        select: ReadSelect,
    ) -> Result<Vec<Event>, DataStoreError> {
        let state = self.inner.read();
        let Some(stored) = state.events.get(&stream_key(document, stream)) else {
            return Ok(Vec::new());
        };

        Ok(stored
            .values()
            .filter(|event| event.event_version <= stream.current_stream_version)
            .filter(|event| match select {
                ReadSelect::Chunk(index) => {
                    stream.chunk_settings.chunk_index(event.event_version) == index
                }
                other => other.contains(event.event_version),
            })
            .cloned()
            .collect())
    }

    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        from: Version,
        to: Version,
    ) -> Result<usize, DataStoreError> {
        let mut state = self.inner.write();
        let Some(stored) = state.events.get_mut(&stream_key(document, stream)) else {
            return Ok(0);
        };

        let before = stored.len();
        stored.retain(|version, _| !(from..=to).contains(version));
        Ok(before - stored.len())
    }
}

#[async_trait]
impl DocumentStore for InMemoryBackend {
    async fn create(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError> {
        let mut state = self.inner.write();
        let key = document.key();

        if state.documents.contains_key(&key) {
            return Err(DocumentStoreError::AlreadyExists { key });
        }

        let etag = state.next_etag();
        document.etag = Some(etag.clone());
        state.documents.insert(key, (document.clone(), etag));
        Ok(())
    }

    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, DocumentStoreError> {
        let key = format!("{object_name}/{object_id}.json");
        let state = self.inner.read();

        state
            .documents
            .get(&key)
            .map(|(document, etag)| {
                let mut document = document.clone();
                document.etag = Some(etag.clone());
                document
            })
            .ok_or(DocumentStoreError::DocumentNotFound { key })
    }

    async fn set(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError> {
        let mut state = self.inner.write();
        let key = document.key();

        let Some((stored, stored_etag)) = state.documents.get(&key) else {
            return Err(DocumentStoreError::DocumentNotFound { key });
        };

        if document.etag.as_deref() != Some(stored_etag.as_str()) {
            return Err(DocumentStoreError::Conflict(ConflictError {
                stream_id: document.active.stream_identifier.clone(),
                expected: document.active.current_stream_version,
                actual: stored.active.current_stream_version,
            }));
        }

        if !document.hash_is_current() || document.hash == stored.hash {
            return Err(DocumentStoreError::StaleWrite { key });
        }

        let etag = state.next_etag();
        document.etag = Some(etag.clone());
        state.documents.insert(key, (document.clone(), etag));
        Ok(())
    }
}

/// One scope of the in-memory tag index.
pub struct InMemoryTagStore {
    scope: TagScope,
    inner: Arc<RwLock<State>>,
}

impl InMemoryTagStore {
    fn tag_key(&self, object_name: &str, tag: &str) -> String {
        format!("{}|{}|{}", self.scope.key_prefix(), object_name, tag)
    }
}

#[async_trait]
impl TagStore for InMemoryTagStore {
    async fn set(&self, document: &ObjectDocument, tag: &str) -> Result<(), TagStoreError> {
        let key = self.tag_key(&document.object_name, tag);
        let id = self.scope.identifier_of(document);

        self.inner.write().tags.entry(key).or_default().insert(id);
        Ok(())
    }

    async fn get(&self, object_name: &str, tag: &str) -> Result<Vec<String>, TagStoreError> {
        let key = self.tag_key(object_name, tag);

        Ok(self
            .inner
            .read()
            .tags
            .get(&key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, document: &ObjectDocument, tag: &str) -> Result<(), TagStoreError> {
        let key = self.tag_key(&document.object_name, tag);
        let id = self.scope.identifier_of(document);

        let mut state = self.inner.write();
        if let Some(ids) = state.tags.get_mut(&key) {
            ids.remove(&id);
            if ids.is_empty() {
                state.tags.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for InMemoryBackend {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
        self.inner
            .write()
            .snapshots
            .entry(object_key(&snapshot.object_name, &snapshot.object_id))
            .or_default()
            .insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    async fn load(
        &self,
        object_name: &str,
        object_id: &str,
        version: Version,
    ) -> Result<Option<Snapshot>, SnapshotStoreError> {
        Ok(self
            .inner
            .read()
            .snapshots
            .get(&object_key(object_name, object_id))
            .and_then(|snapshots| snapshots.get(&version).cloned()))
    }

    async fn latest(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<Option<Snapshot>, SnapshotStoreError> {
        Ok(self
            .inner
            .read()
            .snapshots
            .get(&object_key(object_name, object_id))
            .and_then(|snapshots| snapshots.last_key_value())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn list(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<Vec<Snapshot>, SnapshotStoreError> {
        Ok(self
            .inner
            .read()
            .snapshots
            .get(&object_key(object_name, object_id))
            .map(|snapshots| snapshots.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(
        &self,
        object_name: &str,
        object_id: &str,
        version: Version,
    ) -> Result<(), SnapshotStoreError> {
        if let Some(snapshots) = self
            .inner
            .write()
            .snapshots
            .get_mut(&object_key(object_name, object_id))
        {
            snapshots.remove(&version);
        }
        Ok(())
    }
}

#[async_trait]
impl BackupStore for InMemoryBackend {
    async fn write_artifact(
        &self,
        location: &str,
        body: Vec<u8>,
    ) -> Result<(), BackupStoreError> {
        self.inner.write().artifacts.insert(location.to_owned(), body);
        Ok(())
    }

    async fn read_artifact(&self, location: &str) -> Result<Vec<u8>, BackupStoreError> {
        self.inner
            .read()
            .artifacts
            .get(location)
            .cloned()
            .ok_or_else(|| BackupStoreError::ArtifactNotFound {
                location: location.to_owned(),
            })
    }

    async fn delete_artifact(&self, location: &str) -> Result<(), BackupStoreError> {
        self.inner.write().artifacts.remove(location);
        Ok(())
    }

    async fn read_registry(&self) -> Result<BackupRegistry, BackupStoreError> {
        let state = self.inner.read();

        Ok(match &state.registry {
            Some((entries, etag)) => BackupRegistry {
                entries: entries.clone(),
                etag: Some(etag.clone()),
            },
            None => BackupRegistry::default(),
        })
    }

    async fn write_registry(
        &self,
        registry: &mut BackupRegistry,
    ) -> Result<(), BackupStoreError> {
        let mut state = self.inner.write();

        let stored_etag = state.registry.as_ref().map(|(_, etag)| etag.clone());
        if registry.etag != stored_etag {
            return Err(BackupStoreError::RegistryConflict);
        }

        let etag = state.next_etag();
        registry.etag = Some(etag.clone());
        state.registry = Some((registry.entries.clone(), etag));
        Ok(())
    }
}

#[async_trait]
impl StatusStore for InMemoryBackend {
    async fn get(
        &self,
        projection_name: &str,
        object_id: &str,
    ) -> Result<Option<ProjectionStatusDocument>, StatusStoreError> {
        let key = format!("{projection_name}_{object_id}");

        Ok(self.inner.read().statuses.get(&key).map(|(document, etag)| {
            let mut document = document.clone();
            document.etag = Some(etag.clone());
            document
        }))
    }

    async fn put(&self, document: &mut ProjectionStatusDocument) -> Result<(), StatusStoreError> {
        let key = format!("{}_{}", document.projection_name, document.object_id);
        let mut state = self.inner.write();

        let stored_etag = state.statuses.get(&key).map(|(_, etag)| etag.clone());
        if document.etag != stored_etag {
            return Err(StatusStoreError::Conflict { key: document.key() });
        }

        let etag = state.next_etag();
        document.etag = Some(etag.clone());
        state.statuses.insert(key, (document.clone(), etag));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProjectionStatusDocument>, StatusStoreError> {
        Ok(self
            .inner
            .read()
            .statuses
            .values()
            .map(|(document, etag)| {
                let mut document = document.clone();
                document.etag = Some(etag.clone());
                document
            })
            .collect())
    }
}

/// A lease held on the in-memory lock table.
pub struct InMemoryLock {
    inner: Arc<RwLock<State>>,
    key: String,
    lock_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl DistributedLock for InMemoryLock {
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
        let mut state = self.inner.write();

        match state.locks.get_mut(&self.key) {
            Some((holder, expires_at)) if *holder == self.lock_id => {
                *expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
                self.expires_at = *expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&mut self) -> Result<(), LockError> {
        let mut state = self.inner.write();

        if let Some((holder, _)) = state.locks.get(&self.key) {
            if *holder == self.lock_id {
                state.locks.remove(&self.key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LockProvider for InMemoryBackend {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Box<dyn DistributedLock>, LockError> {
        let mut state = self.inner.write();
        let now = Utc::now();

        if let Some((_, expires_at)) = state.locks.get(key) {
            if *expires_at > now {
                return Err(LockError::AlreadyHeld {
                    key: key.to_owned(),
                });
            }
        }

        let lock_id = Uuid::new_v4().to_string();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        state
            .locks
            .insert(key.to_owned(), (lock_id.clone(), expires_at));

        Ok(Box::new(InMemoryLock {
            inner: Arc::clone(&self.inner),
            key: key.to_owned(),
            lock_id,
            acquired_at: now,
            expires_at,
        }))
    }
}
