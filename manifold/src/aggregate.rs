//! The typed layer over the storage engine: domain aggregates rebuilt
//! by folding a stream's events, and saved by appending new ones through
//! a leased session.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::document::ObjectDocument;
use crate::event::{Event, Metadata, ReadSelect};
use crate::factory::{FactoryError, ObjectDocumentFactory};
use crate::serde::Serde;
use crate::session::{CommitReceipt, LeasedSession, SessionError};
use crate::snapshot::{Snapshot, StateSerializer};
use crate::store::DataStoreError;
use crate::version::Version;

/// A typed domain event, as the aggregate layer persists it.
///
/// What it reports here lands on the stored [Event] record: the logical
/// `event_type` (conventionally suffixed with its version, e.g.
/// `"ProjectCreated.1"`) and the payload schema version.
pub trait DomainEvent {
    /// Logical event type recorded on the persisted event.
    fn event_type(&self) -> &'static str;

    /// Schema version of the serialized payload.
    fn schema_version(&self) -> u32 {
        1
    }
}

/// A domain event staged for persistence, together with the free-form
/// metadata to record alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<E> {
    pub event: E,
    pub metadata: Metadata,
}

impl<E> Change<E> {
    pub fn new(event: E) -> Self {
        Self {
            event,
            metadata: Metadata::default(),
        }
    }

    /// Records a metadata entry on the persisted event.
    #[must_use]
    pub fn recorded_with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl<E> From<E> for Change<E> {
    fn from(event: E) -> Self {
        Change::new(event)
    }
}

/// An Aggregate is rebuilt by folding the Domain Events of its stream,
/// in order, over an initially absent state.
pub trait Aggregate: Sized + Send + Sync {
    /// Domain events that express mutations of the Aggregate's state.
    type Event: DomainEvent + Send + Sync;

    /// Error returned when applying an event to the current state fails,
    /// which usually means the stream contains unexpected data.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The object name this aggregate is stored under.
    fn aggregate_name() -> &'static str;

    /// Applies the event to the state, returning the next state.
    fn apply(state: Option<Self>, event: Self::Event) -> Result<Self, Self::Error>;
}

/// An aggregate rebuilt from storage, together with the manifest it was
/// folded from.
#[derive(Debug)]
pub struct Rehydrated<T> {
    /// `None` when no domain event has been committed yet.
    pub state: Option<T>,
    pub document: ObjectDocument,
}

impl<T> Rehydrated<T> {
    /// Version of the last folded event.
    pub fn version(&self) -> Version {
        self.document.active.current_stream_version
    }
}

/// All possible error types returned by the [AggregateStore].
#[derive(Debug, thiserror::Error)]
pub enum AggregateStoreError {
    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    Data(#[from] DataStoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// Folding the stream failed: an event could not be deserialized or
    /// applied.
    #[error("failed to rehydrate aggregate at version {version}: {source}")]
    Rehydrate {
        version: Version,
        #[source]
        source: anyhow::Error,
    },
}

/// Loads and saves aggregates of one type through the engine.
///
/// Rehydration folds the active stream; migrations keep the active
/// stream's history complete, so predecessors never need re-folding.
pub struct AggregateStore<T, S>
where
    T: Aggregate,
    S: Serde<T::Event>,
{
    factory: ObjectDocumentFactory,
    serde: S,
    aggregate: PhantomData<T>,
}

impl<T, S> AggregateStore<T, S>
where
    T: Aggregate,
    S: Serde<T::Event>,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    pub fn new(factory: ObjectDocumentFactory, serde: S) -> Self {
        Self {
            factory,
            serde,
            aggregate: PhantomData,
        }
    }

    /// Rebuilds the aggregate, creating its manifest on first use.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self, object_id: &str) -> Result<Rehydrated<T>, AggregateStoreError> {
        let document = self
            .factory
            .get_or_create(T::aggregate_name(), object_id)
            .await?;

        let data = self
            .factory
            .backends()
            .resolve(&document.active.data_store)
            .map_err(FactoryError::from)?
            .data
            .clone();

        let events = data.read(&document, &document.active, ReadSelect::All).await?;
        let state = fold::<T, S>(&self.serde, None, &events)?;

        Ok(Rehydrated { state, document })
    }

    /// Opens a session for appending new domain events to the aggregate.
    pub fn open_session(&self, rehydrated: Rehydrated<T>) -> LeasedSession {
        self.factory.open_session(rehydrated.document)
    }

    /// Applies the given changes to the aggregate and commits them
    /// through a fresh session: only events the aggregate itself
    /// accepted reach storage.
    #[tracing::instrument(skip(self, rehydrated, changes), fields(changes = changes.len()))]
    pub async fn save(
        &self,
        rehydrated: Rehydrated<T>,
        changes: Vec<Change<T::Event>>,
    ) -> Result<(Rehydrated<T>, CommitReceipt), AggregateStoreError> {
        let mut state = rehydrated.state;
        let mut session = self.factory.open_session(rehydrated.document);

        for change in changes {
            let mut event = Event::new(
                change.event.event_type(),
                self.serde.serialize(&change.event),
            );
            event.schema_version = change.event.schema_version();
            event.metadata = change.metadata;

            let version = session.document().active.current_stream_version
                + 1
                + session.buffered_len() as Version;
            state = Some(T::apply(state, change.event).map_err(|source| {
                AggregateStoreError::Rehydrate {
                    version,
                    source: source.into(),
                }
            })?);

            session.append(event).await?;
        }

        let receipt = session.commit().await?;
        Ok((
            Rehydrated {
                state,
                document: session.into_document(),
            },
            receipt,
        ))
    }
}

/// Folds raw events into aggregate state, skipping engine-internal
/// stream-closure events.
fn fold<T, S>(
    serde: &S,
    initial: Option<T>,
    events: &[Event],
) -> Result<Option<T>, AggregateStoreError>
where
    T: Aggregate,
    S: Serde<T::Event>,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let mut state = initial;

    for event in events {
        if event.is_stream_closure() {
            continue;
        }

        let domain = serde
            .deserialize(&event.payload)
            .map_err(|source| AggregateStoreError::Rehydrate {
                version: event.event_version,
                source: source.into(),
            })?;

        state = Some(
            T::apply(state, domain).map_err(|source| AggregateStoreError::Rehydrate {
                version: event.event_version,
                source: source.into(),
            })?,
        );
    }

    Ok(state)
}

/// [StateSerializer] that folds an aggregate and stores its JSON state
/// in snapshots.
pub struct AggregateStateSerializer<T, S>
where
    T: Aggregate,
    S: Serde<T::Event>,
{
    serde: Arc<S>,
    aggregate: PhantomData<T>,
}

impl<T, S> AggregateStateSerializer<T, S>
where
    T: Aggregate,
    S: Serde<T::Event>,
{
    pub fn new(serde: Arc<S>) -> Self {
        Self {
            serde,
            aggregate: PhantomData,
        }
    }
}

#[async_trait]
impl<T, S> StateSerializer for AggregateStateSerializer<T, S>
where
    T: Aggregate + Serialize + DeserializeOwned,
    S: Serde<T::Event>,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    async fn snapshot_state(
        &self,
        _document: &ObjectDocument,
        prior: Option<&Snapshot>,
        events: &[Event],
    ) -> anyhow::Result<String> {
        let initial: Option<T> = prior
            .map(|snapshot| serde_json::from_str(&snapshot.state))
            .transpose()?;

        let state = fold::<T, S>(&self.serde, initial, events)?;
        Ok(serde_json::to_string(&state)?)
    }
}
