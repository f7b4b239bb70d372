//! The leased session: the commit engine turning in-memory event
//! buffers into durable, consistent writes under optimistic concurrency.
//!
//! A session represents the right to append to one stream from the
//! moment it is opened until it is committed or dropped. One session per
//! task; the session holds no lock across suspension points, concurrency
//! is externalized to the manifest's ETag.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::document::ObjectDocument;
use crate::error::{codes, ErrorCode};
use crate::event::Event;
use crate::factory::{Backends, ConfigError};
use crate::store::{DataStoreError, DocumentStoreError};
use crate::stream::StreamInfo;
use crate::version::{ConflictError, Version};

/// Cause attached to failures produced by cancelling a commit mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct OperationCanceled;

/// Error raised by a pre-append action rejecting an event.
#[derive(Debug, thiserror::Error)]
#[error("constraint {constraint} rejected the event: {message}")]
pub struct ConstraintError {
    /// Name of the violated constraint.
    pub constraint: String,
    pub message: String,
}

impl ErrorCode for ConstraintError {
    fn error_code(&self) -> &'static str {
        codes::BIZ_CONSTRAINT
    }
}

/// Validates an event against the manifest before it enters the
/// session's buffer. A failing check aborts before any storage write.
#[async_trait]
pub trait PreAppendAction: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    async fn check(&self, document: &ObjectDocument, event: &Event) -> Result<(), ConstraintError>;
}

/// Side effect executed after a commit made its events durable.
///
/// Failures here never roll the commit back; the session aggregates them
/// into [SessionError::PostCommitActionFailed] so the caller can record
/// compensation work.
#[async_trait]
pub trait PostCommitAction: Send + Sync {
    /// Name used in diagnostics and failure reports.
    fn name(&self) -> &str;

    async fn run(&self, document: &ObjectDocument, committed: &[Event]) -> anyhow::Result<()>;
}

/// A post-commit action that failed, with its cause.
#[derive(Debug)]
pub struct FailedAction {
    pub name: String,
    pub cause: anyhow::Error,
}

/// Tuning knobs of a [LeasedSession].
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Retry the commit once on the continuation stream when the target
    /// stream turns out to be closed.
    pub auto_retry_on_closed_stream: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_retry_on_closed_stream: true,
        }
    }
}

/// All possible error types returned by [LeasedSession] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A pre-append action rejected the event; nothing was written.
    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    /// Another writer committed first; reload and retry at the caller's
    /// discretion.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// The target stream is closed and the session could not (or was
    /// not allowed to) move to a continuation.
    #[error("stream {stream_id} is closed")]
    StreamClosed {
        stream_id: String,
        continuation: Option<String>,
    },

    /// A previous cleanup failure left the stream broken; only an
    /// out-of-band repair can continue it.
    #[error("stream {stream_id} is broken and needs out-of-band repair")]
    StreamBroken { stream_id: String },

    /// The commit failed before the manifest became visible.
    ///
    /// `events_may_be_written` reports whether tentatively appended
    /// events had to be cleaned up on the way out.
    #[error("commit on stream {stream_id} failed (events_may_be_written: {events_may_be_written}): {source}")]
    CommitFailed {
        stream_id: String,
        events_may_be_written: bool,
        #[source]
        source: anyhow::Error,
    },

    /// The commit failed after events were appended, and removing them
    /// failed as well. The stream is broken.
    #[error(
        "commit cleanup on stream {stream_id} failed: events {cleanup_from}..={cleanup_to} could \
         not be removed after the manifest write failed (versions {original_version} -> \
         {attempted_version}): {cleanup_cause}"
    )]
    CommitCleanupFailed {
        stream_id: String,
        original_version: Version,
        attempted_version: Version,
        cleanup_from: Version,
        cleanup_to: Version,
        #[source]
        cleanup_cause: anyhow::Error,
        original_cause: anyhow::Error,
    },

    /// Events are durable but one or more post-commit actions failed.
    #[error("{} of {} post-commit actions failed on stream {stream_id}",
        failed.len(), failed.len() + succeeded.len())]
    PostCommitActionFailed {
        stream_id: String,
        committed_events: Vec<Event>,
        failed: Vec<FailedAction>,
        succeeded: Vec<String>,
    },

    /// A connection name on the manifest does not resolve to a backend.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            SessionError::Constraint(e) => e.error_code(),
            SessionError::Conflict(e) => e.error_code(),
            SessionError::StreamClosed { .. } => codes::STREAM_CLOSED,
            SessionError::StreamBroken { .. } => codes::COMMIT_CLEANUP_FAILED,
            SessionError::CommitFailed { .. } => codes::COMMIT_FAILED,
            SessionError::CommitCleanupFailed { .. } => codes::COMMIT_CLEANUP_FAILED,
            SessionError::PostCommitActionFailed { .. } => codes::POST_COMMIT_FAILED,
            SessionError::Config(e) => e.error_code(),
        }
    }
}

/// Receipt of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub stream_identifier: String,
    pub first_version: Version,
    pub last_version: Version,
    pub events: Vec<Event>,
}

impl CommitReceipt {
    /// Whether the commit had nothing to write.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

enum StepFailure<E> {
    Canceled,
    Store(E),
}

/// The leased session over one object's active stream.
///
/// Events are buffered in memory until `commit`, which runs the
/// events-first protocol: assign versions, append to the data store,
/// publish the manifest with its recomputed hash under the ETag check,
/// then run post-commit actions. Any failure between the append and the
/// manifest write removes the tentatively written events again.
pub struct LeasedSession {
    backends: Arc<Backends>,
    document: ObjectDocument,
    buffered: Vec<Event>,
    pre_append: Vec<Arc<dyn PreAppendAction>>,
    post_commit: Vec<Arc<dyn PostCommitAction>>,
    options: SessionOptions,
    broken: bool,
}

impl fmt::Debug for LeasedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedSession")
            .field("stream", &self.document.active.stream_identifier)
            .field("buffered", &self.buffered.len())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl LeasedSession {
    /// Opens a session over the given manifest.
    pub fn new(document: ObjectDocument, backends: Arc<Backends>) -> Self {
        Self {
            backends,
            document,
            buffered: Vec::new(),
            pre_append: Vec::new(),
            post_commit: Vec::new(),
            options: SessionOptions::default(),
            broken: false,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers a constraint checked against every appended event.
    #[must_use]
    pub fn with_pre_append_action(mut self, action: Arc<dyn PreAppendAction>) -> Self {
        self.pre_append.push(action);
        self
    }

    /// Registers a side effect to run after commits, in registration
    /// order.
    #[must_use]
    pub fn with_post_commit_action(mut self, action: Arc<dyn PostCommitAction>) -> Self {
        self.post_commit.push(action);
        self
    }

    /// The manifest as this session sees it.
    pub fn document(&self) -> &ObjectDocument {
        &self.document
    }

    /// Consumes the session, handing back its manifest.
    pub fn into_document(self) -> ObjectDocument {
        self.document
    }

    /// Number of events staged for the next commit.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Whether a failed cleanup left the stream broken.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Validates the event against every registered pre-append action
    /// and stages it for the next commit.
    pub async fn append(&mut self, event: Event) -> Result<(), SessionError> {
        if self.broken {
            return Err(self.broken_error());
        }

        for action in &self.pre_append {
            action.check(&self.document, &event).await?;
        }

        self.buffered.push(event);
        Ok(())
    }

    /// Commits the buffered events. See [LeasedSession::commit_with_cancellation].
    pub async fn commit(&mut self) -> Result<CommitReceipt, SessionError> {
        self.commit_with_cancellation(&CancellationToken::new())
            .await
    }

    /// Commits the buffered events, observing the cancellation token at
    /// every step.
    ///
    /// Cancellation during the append or manifest step behaves like a
    /// failure there (cleanup runs); cancellation during post-commit
    /// actions surfaces as [SessionError::PostCommitActionFailed] with
    /// an [OperationCanceled] cause.
    #[tracing::instrument(skip(self, cancel), fields(stream = %self.document.active.stream_identifier))]
    pub async fn commit_with_cancellation(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CommitReceipt, SessionError> {
        if self.broken {
            return Err(self.broken_error());
        }

        if self.buffered.is_empty() {
            let version = self.document.active.current_stream_version;
            return Ok(CommitReceipt {
                stream_identifier: self.document.active.stream_identifier.clone(),
                first_version: version + 1,
                last_version: version,
                events: Vec::new(),
            });
        }

        let mut closed_retries = 0u32;

        loop {
            let backend = self.backends.resolve(&self.document.active.data_store)?;
            let stream_id = self.document.active.stream_identifier.clone();

            let original_version = self.document.active.current_stream_version;
            let first_version = original_version + 1;
            let attempted_version = original_version + self.buffered.len() as Version;

            let mut events = self.buffered.clone();
            for (i, event) in events.iter_mut().enumerate() {
                event.event_version = first_version + i as Version;
            }

            if cancel.is_cancelled() {
                return Err(SessionError::CommitFailed {
                    stream_id,
                    events_may_be_written: false,
                    source: OperationCanceled.into(),
                });
            }

            // Step 2: append events, stamped with the store's write time.
            let append_result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(StepFailure::Canceled),
                result = backend.data.append(
                    &self.document,
                    &self.document.active,
                    false,
                    events.clone(),
                ) => result.map_err(StepFailure::Store),
            };

            match append_result {
                Ok(_) => {}

                Err(StepFailure::Store(DataStoreError::StreamClosed {
                    stream_id,
                    continuation,
                })) => {
                    closed_retries += 1;
                    if !self.options.auto_retry_on_closed_stream || closed_retries > 1 {
                        return Err(SessionError::StreamClosed {
                            stream_id,
                            continuation,
                        });
                    }

                    tracing::debug!(
                        %stream_id,
                        ?continuation,
                        "stream closed underneath the session, moving to the continuation"
                    );
                    self.follow_continuation(continuation).await?;
                    continue;
                }

                // The conditional append wrote nothing: surface the
                // conflict directly, no cleanup required.
                Err(StepFailure::Store(DataStoreError::ConcurrentAppend { found, .. })) => {
                    return Err(SessionError::Conflict(ConflictError {
                        stream_id,
                        expected: original_version,
                        actual: found,
                    }));
                }

                // Any other append failure may have left partial chunks
                // behind; remove the whole tentative range.
                Err(failure) => {
                    let cause = match failure {
                        StepFailure::Canceled => anyhow::Error::from(OperationCanceled),
                        StepFailure::Store(e) => e.into(),
                    };

                    return Err(self
                        .cleanup(
                            &*backend.data,
                            original_version,
                            attempted_version,
                            cause,
                            false,
                        )
                        .await);
                }
            }

            // Step 3: publish the manifest under the ETag check.
            let documents = self
                .backends
                .resolve(&self.document.active.document_store)?
                .documents
                .clone();

            let pre_commit = self.document.clone();
            self.document.active.current_stream_version = attempted_version;
            self.document.seal();

            let set_result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(StepFailure::Canceled),
                result = documents.set(&mut self.document) => result.map_err(StepFailure::Store),
            };

            if let Err(failure) = set_result {
                self.document = pre_commit;

                let conflict_actual = match &failure {
                    StepFailure::Store(DocumentStoreError::Conflict(conflict)) => {
                        Some(conflict.actual)
                    }
                    _ => None,
                };

                let cause = match failure {
                    StepFailure::Canceled => anyhow::Error::from(OperationCanceled),
                    StepFailure::Store(e) => e.into(),
                };

                let failed = self
                    .cleanup(
                        &*backend.data,
                        original_version,
                        attempted_version,
                        cause,
                        true,
                    )
                    .await;

                // A cleaned-up conflict surfaces as the conflict itself.
                return match (failed, conflict_actual) {
                    (SessionError::CommitFailed { stream_id, .. }, Some(actual)) => {
                        Err(SessionError::Conflict(ConflictError {
                            stream_id,
                            expected: original_version,
                            actual,
                        }))
                    }
                    (other, _) => Err(other),
                };
            }

            // Committed. Step 4: post-commit actions.
            self.buffered.clear();
            return self.run_post_commit_actions(cancel, events).await;
        }
    }

    async fn run_post_commit_actions(
        &mut self,
        cancel: &CancellationToken,
        committed: Vec<Event>,
    ) -> Result<CommitReceipt, SessionError> {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for action in &self.post_commit {
            if cancel.is_cancelled() {
                failed.push(FailedAction {
                    name: action.name().to_owned(),
                    cause: OperationCanceled.into(),
                });
                continue;
            }

            match action.run(&self.document, &committed).await {
                Ok(()) => succeeded.push(action.name().to_owned()),
                Err(cause) => {
                    tracing::warn!(action = action.name(), %cause, "post-commit action failed");
                    failed.push(FailedAction {
                        name: action.name().to_owned(),
                        cause,
                    });
                }
            }
        }

        let receipt = CommitReceipt {
            stream_identifier: self.document.active.stream_identifier.clone(),
            first_version: committed
                .first()
                .map(|e| e.event_version)
                .unwrap_or(self.document.active.current_stream_version + 1),
            last_version: self.document.active.current_stream_version,
            events: committed,
        };

        if failed.is_empty() {
            return Ok(receipt);
        }

        Err(SessionError::PostCommitActionFailed {
            stream_id: receipt.stream_identifier,
            committed_events: receipt.events,
            failed,
            succeeded,
        })
    }

    /// Removes the tentatively appended `[original+1, attempted]` range
    /// after a failed commit, returning the error to surface. A failing
    /// cleanup marks the stream broken.
    async fn cleanup(
        &mut self,
        data: &dyn crate::store::DataStore,
        original_version: Version,
        attempted_version: Version,
        original_cause: anyhow::Error,
        events_were_written: bool,
    ) -> SessionError {
        let stream_id = self.document.active.stream_identifier.clone();
        let (from, to) = (original_version + 1, attempted_version);

        match data
            .remove_events_for_failed_commit(&self.document, &self.document.active, from, to)
            .await
        {
            Ok(removed) => {
                tracing::debug!(%stream_id, from, to, removed, "cleaned up after failed commit");
                SessionError::CommitFailed {
                    stream_id,
                    events_may_be_written: events_were_written,
                    source: original_cause,
                }
            }
            Err(cleanup_cause) => {
                self.broken = true;
                tracing::error!(
                    %stream_id,
                    from,
                    to,
                    %cleanup_cause,
                    "cleanup after failed commit failed, stream is broken"
                );
                SessionError::CommitCleanupFailed {
                    stream_id,
                    original_version,
                    attempted_version,
                    cleanup_from: from,
                    cleanup_to: to,
                    cleanup_cause: cleanup_cause.into(),
                    original_cause,
                }
            }
        }
    }

    /// Reloads the manifest after a closed-stream error and points the
    /// session at the successor stream.
    ///
    /// When the closure event landed but the manifest swap has not yet,
    /// the session terminates the stream locally the same way the
    /// closing writer will; whichever manifest write lands first wins
    /// the ETag race.
    async fn follow_continuation(
        &mut self,
        continuation: Option<String>,
    ) -> Result<(), SessionError> {
        let stream_id = self.document.active.stream_identifier.clone();
        let step_failed = {
            let stream_id = stream_id.clone();
            move |e: anyhow::Error| SessionError::CommitFailed {
                stream_id: stream_id.clone(),
                events_may_be_written: false,
                source: e,
            }
        };

        let documents = self
            .backends
            .resolve(&self.document.active.document_store)?
            .documents
            .clone();

        let reloaded = documents
            .get(&self.document.object_name, &self.document.object_id)
            .await
            .map_err(|e| step_failed(e.into()))?;

        if reloaded.active.stream_identifier != stream_id {
            self.document = reloaded;
            return Ok(());
        }

        // Read the closure event sitting right behind the manifest's
        // tail to learn where the stream continues.
        let data = self
            .backends
            .resolve(&reloaded.active.data_store)?
            .data
            .clone();

        let closure_version = reloaded.active.current_stream_version + 1;
        let mut probe = reloaded.active.clone();
        probe.current_stream_version = closure_version;

        let closing = data
            .read(
                &reloaded,
                &probe,
                crate::event::ReadSelect::Range(closure_version, closure_version),
            )
            .await
            .map_err(|e| step_failed(e.into()))?;

        let Some(closure) = closing.last().and_then(crate::event::StreamClosure::from_event)
        else {
            // The closure was rolled back in the meantime; surface the
            // closed stream and let the caller decide.
            return Err(SessionError::StreamClosed {
                stream_id,
                continuation,
            });
        };

        let mut successor = StreamInfo {
            stream_identifier: closure.continuation_stream_id.clone(),
            current_stream_version: Version::MAX,
            stream_type: closure.stream_type,
            data_store: closure.data_store.clone(),
            document_store: closure.document_store.clone(),
            snapshot_store: reloaded.active.snapshot_store.clone(),
            stream_tag_store: reloaded.active.stream_tag_store.clone(),
            document_tag_store: reloaded.active.document_tag_store.clone(),
            chunk_settings: reloaded.active.chunk_settings,
        };

        let copied = self
            .backends
            .resolve(&successor.data_store)?
            .data
            .read(&reloaded, &successor, crate::event::ReadSelect::All)
            .await
            .map_err(|e| step_failed(e.into()))?;

        successor.current_stream_version = copied
            .last()
            .map(|e| e.event_version)
            .unwrap_or(crate::version::EMPTY_STREAM_VERSION);

        self.document = reloaded;
        self.document.active.current_stream_version = closure_version;
        self.document.terminate_active(closure.reason, successor);
        Ok(())
    }

    fn broken_error(&self) -> SessionError {
        SessionError::StreamBroken {
            stream_id: self.document.active.stream_identifier.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::event::{ReadSelect, StreamClosure};
    use crate::factory::{Backend, ObjectDocumentFactory, StorageRouting};
    use crate::store::memory::InMemoryBackend;
    use crate::store::{DataStore, DocumentStore};
    use crate::stream::StreamType;
    use crate::version::EMPTY_STREAM_VERSION;

    struct FailNextSet {
        inner: Arc<dyn DocumentStore>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DocumentStore for FailNextSet {
        async fn create(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError> {
            self.inner.create(document).await
        }

        async fn get(
            &self,
            object_name: &str,
            object_id: &str,
        ) -> Result<ObjectDocument, DocumentStoreError> {
            self.inner.get(object_name, object_id).await
        }

        async fn set(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(DocumentStoreError::Processing {
                    key: document.key(),
                    source: anyhow::anyhow!("injected manifest write failure"),
                });
            }
            self.inner.set(document).await
        }
    }

    struct FailingRemove {
        inner: Arc<dyn DataStore>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DataStore for FailingRemove {
        async fn append(
            &self,
            document: &ObjectDocument,
            stream: &StreamInfo,
            preserve_timestamp: bool,
            events: Vec<Event>,
        ) -> Result<Version, DataStoreError> {
            self.inner
                .append(document, stream, preserve_timestamp, events)
                .await
        }

        async fn read(
            &self,
            document: &ObjectDocument,
            stream: &StreamInfo,
            select: ReadSelect,
        ) -> Result<Vec<Event>, DataStoreError> {
            self.inner.read(document, stream, select).await
        }

        async fn remove_events_for_failed_commit(
            &self,
            document: &ObjectDocument,
            stream: &StreamInfo,
            from: Version,
            to: Version,
        ) -> Result<usize, DataStoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DataStoreError::Processing {
                    stream_id: stream.stream_identifier.clone(),
                    source: anyhow::anyhow!("injected cleanup failure"),
                });
            }
            self.inner
                .remove_events_for_failed_commit(document, stream, from, to)
                .await
        }
    }

    struct Harness {
        factory: ObjectDocumentFactory,
        memory: Arc<InMemoryBackend>,
        fail_next_set: Arc<AtomicBool>,
        fail_remove: Arc<AtomicBool>,
    }

    fn harness() -> Harness {
        let memory = Arc::new(InMemoryBackend::default());
        let fail_next_set = Arc::new(AtomicBool::new(false));
        let fail_remove = Arc::new(AtomicBool::new(false));

        let base = memory.backend();
        let backend = Backend {
            documents: Arc::new(FailNextSet {
                inner: base.documents.clone(),
                fail: Arc::clone(&fail_next_set),
            }),
            data: Arc::new(FailingRemove {
                inner: base.data.clone(),
                fail: Arc::clone(&fail_remove),
            }),
            ..base
        };

        let mut backends = Backends::new();
        backends.register("default", Arc::new(backend));

        Harness {
            factory: ObjectDocumentFactory::new(
                Arc::new(backends),
                StorageRouting::new().with_default("default"),
            ),
            memory,
            fail_next_set,
            fail_remove,
        }
    }

    async fn commit_events(harness: &Harness, id: &str, n: usize) -> ObjectDocument {
        let document = harness.factory.get_or_create("project", id).await.unwrap();
        let mut session = harness.factory.open_session(document);
        for i in 0..n {
            session
                .append(Event::new("Created.1", format!("{{\"n\":{i}}}")))
                .await
                .unwrap();
        }
        session.commit().await.unwrap();
        session.into_document()
    }

    #[tokio::test]
    async fn happy_commit_advances_version_hash_and_read() {
        let harness = harness();
        let document = harness.factory.get_or_create("project", "P1").await.unwrap();
        let initial_hash = document.hash.clone();

        let mut session = harness.factory.open_session(document);
        session
            .append(Event::new("Created.1", "{\"name\":\"A\"}"))
            .await
            .unwrap();
        session
            .append(Event::new("Renamed.1", "{\"name\":\"B\"}"))
            .await
            .unwrap();

        let receipt = session.commit().await.expect("commit should succeed");
        assert_eq!(receipt.first_version, 0);
        assert_eq!(receipt.last_version, 1);

        let document = session.into_document();
        assert_eq!(document.active.current_stream_version, 1);
        assert!(document.hash_is_current());
        assert_ne!(document.hash, initial_hash);
        assert_eq!(document.prev_hash, initial_hash);

        let events = harness
            .memory
            .read(&document, &document.active, ReadSelect::All)
            .await
            .unwrap();
        assert_eq!(
            events.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["Created.1", "Renamed.1"]
        );
        assert_eq!(
            events.iter().map(|e| e.event_version).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn empty_commits_are_a_no_op() {
        let harness = harness();
        let document = harness.factory.get_or_create("project", "P1").await.unwrap();
        let etag = document.etag.clone();

        let mut session = harness.factory.open_session(document);
        let receipt = session.commit().await.unwrap();
        assert!(receipt.is_empty());
        assert_eq!(session.document().etag, etag);
    }

    #[tokio::test]
    async fn second_writer_gets_an_optimistic_concurrency_conflict() {
        let harness = harness();
        commit_events(&harness, "P1", 4).await;

        let loaded = harness.factory.get("project", "P1").await.unwrap();
        assert_eq!(loaded.active.current_stream_version, 3);

        let mut alpha = harness.factory.open_session(loaded.clone());
        let mut beta = harness.factory.open_session(loaded);

        alpha
            .append(Event::new("AlphaWrote.1", "{}"))
            .await
            .unwrap();
        beta.append(Event::new("BetaWrote.1", "{}")).await.unwrap();

        alpha.commit().await.expect("first committer wins");

        let err = beta.commit().await.expect_err("second committer conflicts");
        match err {
            SessionError::Conflict(conflict) => {
                assert_eq!(conflict.stream_id, "P1-0000");
                assert_eq!(conflict.expected, 3);
                assert_eq!(conflict.actual, 4);
            }
            other => panic!("unexpected error: {other}"),
        }

        // After reload, the loser observes the winner's event.
        let reloaded = harness.factory.get("project", "P1").await.unwrap();
        let events = harness
            .memory
            .read(&reloaded, &reloaded.active, ReadSelect::All)
            .await
            .unwrap();
        assert_eq!(events.last().unwrap().event_type, "AlphaWrote.1");
        assert_eq!(events.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_commits_produce_exactly_one_success() {
        let harness = harness();
        commit_events(&harness, "P1", 1).await;

        let loaded = harness.factory.get("project", "P1").await.unwrap();
        let mut alpha = harness.factory.open_session(loaded.clone());
        let mut beta = harness.factory.open_session(loaded);
        alpha.append(Event::new("Alpha.1", "{}")).await.unwrap();
        beta.append(Event::new("Beta.1", "{}")).await.unwrap();

        let (first, second) = futures::join!(alpha.commit(), beta.commit());

        let winners = [&first, &second].iter().filter(|r| r.is_ok()).count();
        let conflicts = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(SessionError::Conflict(_))))
            .count();
        assert_eq!(
            (winners, conflicts),
            (1, 1),
            "one commit must win and one must conflict: {:?} / {:?}",
            first.as_ref().map(|r| r.last_version),
            second.as_ref().map(|r| r.last_version)
        );
    }

    #[tokio::test]
    async fn conflicting_manifest_writes_are_cleaned_up() {
        let harness = harness();
        commit_events(&harness, "P1", 1).await;

        let stale = harness.factory.get("project", "P1").await.unwrap();

        // A concurrent metadata write bumps the ETag without moving the
        // stream tail.
        let mut other = harness.factory.get("project", "P1").await.unwrap();
        other.schema_version = "2".to_owned();
        other.seal();
        harness.factory.set(&mut other).await.unwrap();

        let mut session = harness.factory.open_session(stale);
        session.append(Event::new("Late.1", "{}")).await.unwrap();
        let err = session.commit().await.expect_err("manifest moved");
        assert!(matches!(err, SessionError::Conflict(_)));

        // The tentatively appended event was removed again: no orphans.
        let reloaded = harness.factory.get("project", "P1").await.unwrap();
        assert_eq!(
            harness
                .memory
                .stored_events(&reloaded, &reloaded.active)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_manifest_write_cleans_up_appended_events() {
        let harness = harness();
        commit_events(&harness, "P1", 4).await;

        let document = harness.factory.get("project", "P1").await.unwrap();
        let mut session = harness.factory.open_session(document);
        session.append(Event::new("Fifth.1", "{}")).await.unwrap();
        session.append(Event::new("Sixth.1", "{}")).await.unwrap();

        harness.fail_next_set.store(true, Ordering::SeqCst);
        let err = session.commit().await.expect_err("manifest write fails");
        match err {
            SessionError::CommitFailed {
                events_may_be_written,
                ..
            } => assert!(events_may_be_written),
            other => panic!("unexpected error: {other}"),
        }

        // Reads only surface the pre-commit prefix, and cleanup removed
        // the orphans from storage entirely.
        let document = harness.factory.get("project", "P1").await.unwrap();
        assert_eq!(document.active.current_stream_version, 3);
        let events = harness
            .memory
            .read(&document, &document.active, ReadSelect::All)
            .await
            .unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(
            harness
                .memory
                .stored_events(&document, &document.active)
                .len(),
            4
        );

        // The session recovered to the pre-commit version and stays
        // usable.
        assert_eq!(session.document().active.current_stream_version, 3);
        assert!(!session.is_broken());
        session.commit().await.expect("retrying the commit succeeds");
        assert_eq!(session.document().active.current_stream_version, 5);
    }

    #[tokio::test]
    async fn failed_cleanup_breaks_the_stream() {
        let harness = harness();
        commit_events(&harness, "P1", 4).await;

        let document = harness.factory.get("project", "P1").await.unwrap();
        let mut session = harness.factory.open_session(document);
        session.append(Event::new("Fifth.1", "{}")).await.unwrap();
        session.append(Event::new("Sixth.1", "{}")).await.unwrap();

        harness.fail_next_set.store(true, Ordering::SeqCst);
        harness.fail_remove.store(true, Ordering::SeqCst);

        let err = session.commit().await.expect_err("cleanup fails too");
        match err {
            SessionError::CommitCleanupFailed {
                original_version,
                attempted_version,
                cleanup_from,
                cleanup_to,
                ..
            } => {
                assert_eq!(original_version, 3);
                assert_eq!(attempted_version, 5);
                assert_eq!(cleanup_from, 4);
                assert_eq!(cleanup_to, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.error_code(), codes::COMMIT_CLEANUP_FAILED);

        assert!(session.is_broken());
        let err = session.commit().await.expect_err("broken streams refuse commits");
        assert!(matches!(err, SessionError::StreamBroken { .. }));

        // The orphans are still in storage, but invisible to readers.
        let document = harness.factory.get("project", "P1").await.unwrap();
        assert_eq!(
            harness
                .memory
                .stored_events(&document, &document.active)
                .len(),
            6
        );
        let visible = harness
            .memory
            .read(&document, &document.active, ReadSelect::All)
            .await
            .unwrap();
        assert_eq!(visible.len(), 4);
    }

    async fn close_stream_manually(harness: &Harness, swap_manifest: bool) -> ObjectDocument {
        let mut current = harness.factory.get("project", "P1").await.unwrap();
        let closure_version = current.active.current_stream_version + 1;

        let mut closing = StreamClosure {
            reason: "split".to_owned(),
            continuation_stream_id: "P1-0001".to_owned(),
            data_store: "default".to_owned(),
            document_store: "default".to_owned(),
            stream_type: StreamType::InMemory,
        }
        .into_event();
        closing.event_version = closure_version;

        harness
            .memory
            .append(&current, &current.active, false, vec![closing])
            .await
            .unwrap();

        if swap_manifest {
            current.active.current_stream_version = closure_version;
            let successor = StreamInfo {
                stream_identifier: "P1-0001".to_owned(),
                current_stream_version: EMPTY_STREAM_VERSION,
                ..current.active.clone()
            };
            current.terminate_active("split", successor);
            current.seal();
            harness.memory.set(&mut current).await.unwrap();
        }

        current
    }

    #[tokio::test]
    async fn closed_stream_commits_retry_on_the_continuation() {
        let harness = harness();
        commit_events(&harness, "P1", 1).await;

        let stale = harness.factory.get("project", "P1").await.unwrap();
        close_stream_manually(&harness, true).await;

        let mut session = harness.factory.open_session(stale);
        session.append(Event::new("Extra.1", "{}")).await.unwrap();

        let receipt = session.commit().await.expect("auto-retry should land");
        assert_eq!(receipt.stream_identifier, "P1-0001");
        assert_eq!(receipt.first_version, 0);

        let document = harness.factory.get("project", "P1").await.unwrap();
        let events = harness
            .memory
            .read(&document, &document.active, ReadSelect::All)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "Extra.1");
        assert_eq!(events[0].event_version, 0);
    }

    #[tokio::test]
    async fn closed_stream_retry_completes_a_pending_manifest_swap() {
        let harness = harness();
        commit_events(&harness, "P1", 1).await;

        let stale = harness.factory.get("project", "P1").await.unwrap();
        // The closure event landed, the manifest swap did not.
        close_stream_manually(&harness, false).await;

        let mut session = harness.factory.open_session(stale);
        session.append(Event::new("Extra.1", "{}")).await.unwrap();

        let receipt = session.commit().await.expect("retry finishes the swap");
        assert_eq!(receipt.stream_identifier, "P1-0001");
        assert_eq!(receipt.first_version, 0);

        let document = harness.factory.get("project", "P1").await.unwrap();
        assert_eq!(document.active.stream_identifier, "P1-0001");
        assert_eq!(document.terminated_streams.len(), 1);
        assert_eq!(
            document.terminated_streams[0].continuation_stream_id,
            "P1-0001"
        );
        assert_eq!(document.terminated_streams[0].reason, "split");
    }

    #[tokio::test]
    async fn closed_stream_without_auto_retry_aborts() {
        let harness = harness();
        commit_events(&harness, "P1", 1).await;

        let stale = harness.factory.get("project", "P1").await.unwrap();
        close_stream_manually(&harness, true).await;

        let mut session = harness
            .factory
            .open_session(stale)
            .with_options(SessionOptions {
                auto_retry_on_closed_stream: false,
            });
        session.append(Event::new("Extra.1", "{}")).await.unwrap();

        let err = session.commit().await.expect_err("no auto-retry");
        match err {
            SessionError::StreamClosed {
                ref stream_id,
                ref continuation,
            } => {
                assert_eq!(stream_id, "P1-0000");
                assert_eq!(continuation.as_deref(), Some("P1-0001"));
            }
            ref other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.error_code(), codes::STREAM_CLOSED);
    }

    struct PayloadBudget;

    #[async_trait]
    impl PreAppendAction for PayloadBudget {
        fn name(&self) -> &str {
            "payload-budget"
        }

        async fn check(
            &self,
            _document: &ObjectDocument,
            event: &Event,
        ) -> Result<(), ConstraintError> {
            if event.payload.len() > 16 {
                return Err(ConstraintError {
                    constraint: "payload-budget".to_owned(),
                    message: format!("payload of {} exceeds 16 bytes", event.event_type),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejected_constraints_abort_before_any_write() {
        let harness = harness();
        let document = harness.factory.get_or_create("project", "P1").await.unwrap();

        let mut session = harness
            .factory
            .open_session(document)
            .with_pre_append_action(Arc::new(PayloadBudget));

        session.append(Event::new("Small.1", "{}")).await.unwrap();

        let err = session
            .append(Event::new("Big.1", "{\"way\":\"too large to pass\"}"))
            .await
            .expect_err("constraint rejects the event");
        assert!(matches!(err, SessionError::Constraint(_)));
        assert_eq!(err.error_code(), codes::BIZ_CONSTRAINT);

        assert_eq!(session.buffered_len(), 1);
        session.commit().await.expect("valid events still commit");
        assert_eq!(session.document().active.current_stream_version, 0);
    }

    struct NamedAction {
        name: &'static str,
        fail: bool,
        cancel: Option<CancellationToken>,
    }

    #[async_trait]
    impl PostCommitAction for NamedAction {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _document: &ObjectDocument, _committed: &[Event]) -> anyhow::Result<()> {
            if let Some(token) = &self.cancel {
                token.cancel();
            }
            if self.fail {
                anyhow::bail!("side effect failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn post_commit_failures_aggregate_without_rolling_back() {
        let harness = harness();
        let document = harness.factory.get_or_create("project", "P1").await.unwrap();

        let mut session = harness
            .factory
            .open_session(document)
            .with_post_commit_action(Arc::new(NamedAction {
                name: "first",
                fail: false,
                cancel: None,
            }))
            .with_post_commit_action(Arc::new(NamedAction {
                name: "flaky",
                fail: true,
                cancel: None,
            }))
            .with_post_commit_action(Arc::new(NamedAction {
                name: "last",
                fail: false,
                cancel: None,
            }));

        session.append(Event::new("Created.1", "{}")).await.unwrap();

        let err = session.commit().await.expect_err("one action failed");
        match &err {
            SessionError::PostCommitActionFailed {
                committed_events,
                failed,
                succeeded,
                ..
            } => {
                assert_eq!(committed_events.len(), 1);
                assert_eq!(
                    failed.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
                    vec!["flaky"]
                );
                assert_eq!(succeeded, &vec!["first".to_owned(), "last".to_owned()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.error_code(), codes::POST_COMMIT_FAILED);

        // The commit itself stands.
        let document = harness.factory.get("project", "P1").await.unwrap();
        assert_eq!(document.active.current_stream_version, 0);
    }

    #[tokio::test]
    async fn cancellation_before_any_write_fails_cleanly() {
        let harness = harness();
        let document = harness.factory.get_or_create("project", "P1").await.unwrap();

        let mut session = harness.factory.open_session(document);
        session.append(Event::new("Created.1", "{}")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = session
            .commit_with_cancellation(&cancel)
            .await
            .expect_err("canceled before the append");
        match &err {
            SessionError::CommitFailed {
                events_may_be_written,
                source,
                ..
            } => {
                assert!(!events_may_be_written);
                assert!(source.downcast_ref::<OperationCanceled>().is_some());
            }
            other => panic!("unexpected error: {other}"),
        }

        // Nothing reached storage.
        let document = harness.factory.get("project", "P1").await.unwrap();
        assert!(document.active.is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_post_commit_surfaces_as_action_failure() {
        let harness = harness();
        let document = harness.factory.get_or_create("project", "P1").await.unwrap();

        let cancel = CancellationToken::new();
        let mut session = harness
            .factory
            .open_session(document)
            .with_post_commit_action(Arc::new(NamedAction {
                name: "canceller",
                fail: false,
                cancel: Some(cancel.clone()),
            }))
            .with_post_commit_action(Arc::new(NamedAction {
                name: "skipped",
                fail: false,
                cancel: None,
            }));

        session.append(Event::new("Created.1", "{}")).await.unwrap();

        let err = session
            .commit_with_cancellation(&cancel)
            .await
            .expect_err("the second action is canceled");
        match &err {
            SessionError::PostCommitActionFailed {
                failed, succeeded, ..
            } => {
                assert_eq!(succeeded, &vec!["canceller".to_owned()]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].name, "skipped");
                assert!(failed[0].cause.downcast_ref::<OperationCanceled>().is_some());
            }
            other => panic!("unexpected error: {other}"),
        }

        // Events are durable regardless.
        let document = harness.factory.get("project", "P1").await.unwrap();
        assert_eq!(document.active.current_stream_version, 0);
    }
}
