//! [DataStore] implementation over chunked event blobs:
//! `<object_name>/<object_id>/events/<stream_identifier>.<chunk>.json`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use manifold::document::ObjectDocument;
use manifold::event::{Event, EventStream, ReadSelect, StreamClosure};
use manifold::store::{DataStore, DataStoreError};
use manifold::stream::StreamInfo;
use manifold::version::{Version, EMPTY_STREAM_VERSION};
use tokio::sync::Mutex;

use crate::container::{Container, WriteCondition};

/// Chunked event log over a blob [Container].
pub struct FsDataStore {
    container: Arc<Container>,

    /// Serializes append/remove read-modify-write cycles per process.
    appends: Mutex<()>,
}

fn events_dir(document: &ObjectDocument) -> String {
    format!("{}/{}/events", document.object_name, document.object_id)
}

fn chunk_key(document: &ObjectDocument, stream: &StreamInfo, chunk: u64) -> String {
    format!(
        "{}/{}.{:05}.json",
        events_dir(document),
        stream.stream_identifier,
        chunk
    )
}

fn parse_chunk_name(name: &str, stream_identifier: &str) -> Option<u64> {
    name.strip_prefix(stream_identifier)?
        .strip_prefix('.')?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

impl FsDataStore {
    pub fn new(container: Arc<Container>) -> Self {
        Self {
            container,
            appends: Mutex::new(()),
        }
    }

    fn processing(stream: &StreamInfo, source: impl Into<anyhow::Error>) -> DataStoreError {
        DataStoreError::Processing {
            stream_id: stream.stream_identifier.clone(),
            source: source.into(),
        }
    }

    async fn chunk_indexes(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
    ) -> Result<Vec<u64>, DataStoreError> {
        let names = self
            .container
            .list_dir(&events_dir(document))
            .await
            .map_err(|e| Self::processing(stream, e))?;

        let mut indexes: Vec<u64> = names
            .iter()
            .filter_map(|name| parse_chunk_name(name, &stream.stream_identifier))
            .collect();
        indexes.sort_unstable();
        Ok(indexes)
    }

    async fn read_chunk(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        chunk: u64,
    ) -> Result<Vec<Event>, DataStoreError> {
        let key = chunk_key(document, stream, chunk);

        let Some(blob) = self
            .container
            .try_read(&key)
            .await
            .map_err(|e| Self::processing(stream, e))?
        else {
            return Ok(Vec::new());
        };

        serde_json::from_slice(&blob.bytes).map_err(|source| DataStoreError::Deserialize {
            stream_id: stream.stream_identifier.clone(),
            source: source.into(),
        })
    }

    async fn write_chunk(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        chunk: u64,
        events: &[Event],
    ) -> Result<(), DataStoreError> {
        let key = chunk_key(document, stream, chunk);
        let body = serde_json::to_vec(events).map_err(|e| Self::processing(stream, e))?;

        self.container
            .write(&key, &body, WriteCondition::Any)
            .await
            .map_err(|e| Self::processing(stream, e))?;
        Ok(())
    }

    /// The stored tail event of the stream, if any chunk exists.
    async fn stored_tail(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
    ) -> Result<Option<Event>, DataStoreError> {
        let indexes = self.chunk_indexes(document, stream).await?;
        let Some(last) = indexes.last() else {
            return Ok(None);
        };

        Ok(self.read_chunk(document, stream, *last).await?.pop())
    }
}

#[async_trait]
impl DataStore for FsDataStore {
    #[tracing::instrument(skip(self, document, stream, events), fields(stream = %stream.stream_identifier, events = events.len()))]
    async fn append(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        preserve_timestamp: bool,
        mut events: Vec<Event>,
    ) -> Result<Version, DataStoreError> {
        if events.is_empty() {
            return Ok(stream.current_stream_version);
        }

        let _guard = self.appends.lock().await;

        // Closed and conditional-tail checks against the stored state.
        let tail = match self.stored_tail(document, stream).await? {
            Some(event) if event.is_stream_closure() => {
                return Err(DataStoreError::StreamClosed {
                    stream_id: stream.stream_identifier.clone(),
                    continuation: StreamClosure::from_event(&event)
                        .map(|c| c.continuation_stream_id),
                });
            }
            Some(event) => event.event_version,
            None => EMPTY_STREAM_VERSION,
        };

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
        if !preserve_timestamp {
            for event in &mut events {
                event.timestamp = Some(now);
            }
        }

        // Group the batch by chunk; each affected chunk is rewritten
        // atomically on its own. The manifest gates visibility across
        // chunk boundaries.
        let mut by_chunk: BTreeMap<u64, Vec<Event>> = BTreeMap::new();
        for event in events {
            by_chunk
                .entry(stream.chunk_settings.chunk_index(event.event_version))
                .or_default()
                .push(event);
        }

        let mut new_tail = tail;
        for (chunk, mut batch) in by_chunk {
            let mut stored = self.read_chunk(document, stream, chunk).await?;
            new_tail = batch.last().map(|e| e.event_version).unwrap_or(new_tail);
            stored.append(&mut batch);
            self.write_chunk(document, stream, chunk, &stored).await?;
        }

        Ok(new_tail)
    }

    async fn read(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        select: ReadSelect,
    ) -> Result<Vec<Event>, DataStoreError> {
        let chunks = match select {
            ReadSelect::Chunk(index) => vec![index],
            _ => self.chunk_indexes(document, stream).await?,
        };

        let mut out = Vec::new();
        for chunk in chunks {
            let events = self.read_chunk(document, stream, chunk).await?;
            out.extend(events.into_iter().filter(|event| {
                event.event_version <= stream.current_stream_version
                    && match select {
                        ReadSelect::Chunk(_) => true,
                        other => other.contains(event.event_version),
                    }
            }));
        }
        Ok(out)
    }

    fn read_as_stream<'a>(
        &'a self,
        document: &'a ObjectDocument,
        stream: &'a StreamInfo,
        select: ReadSelect,
    ) -> EventStream<'a> {
        enum State {
            Start,
            Draining {
                pending: VecDeque<u64>,
                buffered: VecDeque<Event>,
            },
        }

        Box::pin(futures::stream::try_unfold(
            State::Start,
            move |mut state| async move {
                loop {
                    match &mut state {
                        State::Start => {
                            let pending = match select {
                                ReadSelect::Chunk(index) => VecDeque::from(vec![index]),
                                _ => self.chunk_indexes(document, stream).await?.into(),
                            };
                            state = State::Draining {
                                pending,
                                buffered: VecDeque::new(),
                            };
                        }
                        State::Draining { pending, buffered } => {
                            if let Some(event) = buffered.pop_front() {
                                return Ok(Some((event, state)));
                            }

                            let Some(chunk) = pending.pop_front() else {
                                return Ok(None);
                            };

                            let events = self.read_chunk(document, stream, chunk).await?;
                            buffered.extend(events.into_iter().filter(|event| {
                                event.event_version <= stream.current_stream_version
                                    && match select {
                                        ReadSelect::Chunk(_) => true,
                                        other => other.contains(event.event_version),
                                    }
                            }));
                        }
                    }
                }
            },
        ))
    }

    #[tracing::instrument(skip(self, document, stream), fields(stream = %stream.stream_identifier))]
    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        stream: &StreamInfo,
        from: Version,
        to: Version,
    ) -> Result<usize, DataStoreError> {
        let _guard = self.appends.lock().await;

        let mut removed = 0;
        for chunk in self.chunk_indexes(document, stream).await? {
            let stored = self.read_chunk(document, stream, chunk).await?;
            let kept: Vec<Event> = stored
                .iter()
                .filter(|event| !(from..=to).contains(&event.event_version))
                .cloned()
                .collect();

            if kept.len() == stored.len() {
                continue;
            }
            removed += stored.len() - kept.len();

            if kept.is_empty() {
                self.container
                    .delete(&chunk_key(document, stream, chunk))
                    .await
                    .map_err(|e| Self::processing(stream, e))?;
            } else {
                self.write_chunk(document, stream, chunk, &kept).await?;
            }
        }

        Ok(removed)
    }
}
