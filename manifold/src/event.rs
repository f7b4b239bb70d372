//! Module `event` contains the persisted event record and the types used
//! to select and stream events back out of a data store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::stream::StreamType;
use crate::version::Version;

/// Free-form metadata attached to a persisted [Event].
pub type Metadata = HashMap<String, String>;

/// The logical event type appended as the final event of a stream when it
/// is closed in favour of a continuation stream.
pub const STREAM_CLOSED_EVENT_TYPE: &str = "StreamClosed";

/// An immutable event record as persisted in a stream.
///
/// Within a stream, `event_version` is a dense sequence starting at 0
/// with no gaps. The payload is opaque to the engine; typed layers
/// serialize into it through [crate::serde::Serde].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Logical name of the event, e.g. `"ProjectCreated.1"`.
    pub event_type: String,

    /// Position of this event within its stream.
    pub event_version: Version,

    /// Schema version of the payload.
    pub schema_version: u32,

    /// Opaque serialized payload.
    pub payload: String,

    /// Optional ordering hint assigned by an external sequencer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_sequencer: Option<String>,

    /// Metadata recorded by pre/post commit actions.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub action_metadata: Metadata,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,

    /// Write time stamped by the data store, unless the append preserved
    /// an existing timestamp (restore path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Event {
    /// Returns a new [Event] with the given type and payload, at version 0
    /// and schema version 1. The session assigns the final version during
    /// commit.
    pub fn new(event_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            event_version: 0,
            schema_version: 1,
            payload: payload.into(),
            external_sequencer: None,
            action_metadata: Metadata::default(),
            metadata: Metadata::default(),
            timestamp: None,
        }
    }

    /// Adds a new entry to the event's free-form metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Whether this event closes its stream.
    pub fn is_stream_closure(&self) -> bool {
        self.event_type == STREAM_CLOSED_EVENT_TYPE
    }
}

/// Payload of the [STREAM_CLOSED_EVENT_TYPE] event, describing the
/// successor stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamClosure {
    /// Why the stream was closed (e.g. `"migration"`).
    pub reason: String,

    /// Identifier of the continuation stream that succeeds this one.
    pub continuation_stream_id: String,

    /// Data store connection name of the successor.
    pub data_store: String,

    /// Document store connection name of the successor.
    pub document_store: String,

    /// Backend type of the successor.
    pub stream_type: StreamType,
}

impl StreamClosure {
    /// Decodes the closure payload carried by a [STREAM_CLOSED_EVENT_TYPE]
    /// event, or `None` for any other event.
    pub fn from_event(event: &Event) -> Option<StreamClosure> {
        if !event.is_stream_closure() {
            return None;
        }

        serde_json::from_str(&event.payload).ok()
    }

    /// Builds the closing [Event] for this closure, to be appended as the
    /// final event of the stream being closed.
    pub fn into_event(self) -> Event {
        let payload =
            serde_json::to_string(&self).expect("stream closure payload serialization cannot fail");

        Event::new(STREAM_CLOSED_EVENT_TYPE, payload)
    }
}

/// Specifies the slice of a stream to select when reading events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSelect {
    /// Selects every event of the stream.
    All,

    /// Selects all events from the specified version (inclusive) onwards.
    From(Version),

    /// Selects the inclusive `[start, until]` version range.
    Range(Version, Version),

    /// Selects a single storage chunk by its index.
    Chunk(u64),
}

impl ReadSelect {
    /// Whether the given event version falls inside this selection.
    ///
    /// [ReadSelect::Chunk] cannot be answered from the version alone and
    /// is resolved by the data store against its chunk settings.
    pub fn contains(&self, version: Version) -> bool {
        match *self {
            ReadSelect::All | ReadSelect::Chunk(_) => true,
            ReadSelect::From(start) => version >= start,
            ReadSelect::Range(start, until) => version >= start && version <= until,
        }
    }
}

/// A lazy stream of events read back from a data store.
///
/// Finite and not restartable: each [read_as_stream][`crate::store::DataStore::read_as_stream`]
/// call creates a fresh one. Dropping it cancels the read.
pub type EventStream<'a> = BoxStream<'a, Result<Event, crate::store::DataStoreError>>;
