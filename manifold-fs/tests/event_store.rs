use futures::TryStreamExt;
use manifold::document::StreamDefaults;
use manifold::event::{Event, ReadSelect};
use manifold::store::DataStore;
use manifold::stream::{ChunkSettings, StreamType};

mod setup;

fn chunked_defaults() -> StreamDefaults {
    StreamDefaults {
        chunk_settings: ChunkSettings {
            enabled: true,
            size: 3,
        },
        ..StreamDefaults::for_store(StreamType::Blob, "default")
    }
}

async fn commit_events(
    harness: &setup::Harness,
    object_id: &str,
    n: usize,
) -> manifold::document::ObjectDocument {
    let document = harness
        .factory
        .get_or_create("project", object_id)
        .await
        .unwrap();

    let mut session = harness.factory.open_session(document);
    for i in 0..n {
        session
            .append(Event::new("Counted.1", format!("{{\"n\":{i}}}")))
            .await
            .unwrap();
    }
    session.commit().await.expect("commit should succeed");
    session.into_document()
}

#[tokio::test]
async fn appends_spanning_chunks_read_back_in_order() {
    let harness = setup::harness().await.unwrap();
    let harness = setup::Harness {
        factory: harness
            .factory
            .clone()
            .with_defaults("project", chunked_defaults()),
        ..harness
    };
    let object_id = setup::random_object_id();

    let document = commit_events(&harness, &object_id, 8).await;
    assert_eq!(document.active.current_stream_version, 7);

    // Three chunk blobs exist on disk: 0..=2, 3..=5, 6..=7.
    let chunks = harness
        .fs
        .container()
        .list_dir(&format!("project/{object_id}/events"))
        .await
        .unwrap();
    assert_eq!(chunks.len(), 3);

    let data = harness.backends.resolve("default").unwrap().data.clone();

    let all = data
        .read(&document, &document.active, ReadSelect::All)
        .await
        .unwrap();
    assert_eq!(
        all.iter().map(|e| e.event_version).collect::<Vec<_>>(),
        (0..8).collect::<Vec<_>>()
    );

    let middle_chunk = data
        .read(&document, &document.active, ReadSelect::Chunk(1))
        .await
        .unwrap();
    assert_eq!(
        middle_chunk.iter().map(|e| e.event_version).collect::<Vec<_>>(),
        vec![3, 4, 5]
    );

    let range = data
        .read(&document, &document.active, ReadSelect::Range(2, 4))
        .await
        .unwrap();
    assert_eq!(
        range.iter().map(|e| e.event_version).collect::<Vec<_>>(),
        vec![2, 3, 4]
    );

    let streamed: Vec<Event> = data
        .read_as_stream(&document, &document.active, ReadSelect::From(5))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(
        streamed.iter().map(|e| e.event_version).collect::<Vec<_>>(),
        vec![5, 6, 7]
    );
}

#[tokio::test]
async fn remove_for_failed_commit_spans_chunks_and_stays_bounded() {
    let harness = setup::harness().await.unwrap();
    let harness = setup::Harness {
        factory: harness
            .factory
            .clone()
            .with_defaults("project", chunked_defaults()),
        ..harness
    };
    let object_id = setup::random_object_id();

    let document = commit_events(&harness, &object_id, 8).await;
    let data = harness.backends.resolve("default").unwrap().data.clone();

    let removed = data
        .remove_events_for_failed_commit(&document, &document.active, 4, 7)
        .await
        .unwrap();
    assert_eq!(removed, 4);

    let removed_again = data
        .remove_events_for_failed_commit(&document, &document.active, 4, 7)
        .await
        .unwrap();
    assert_eq!(removed_again, 0);

    let left = data
        .read(&document, &document.active, ReadSelect::All)
        .await
        .unwrap();
    assert_eq!(
        left.iter().map(|e| e.event_version).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
}

#[tokio::test]
async fn stale_writers_cannot_append_past_a_moved_tail() {
    let harness = setup::harness().await.unwrap();
    let object_id = setup::random_object_id();

    let stale = commit_events(&harness, &object_id, 1).await;
    commit_events(&harness, &object_id, 0).await;

    // A second writer advances the stream.
    let current = harness.factory.get("project", &object_id).await.unwrap();
    let mut session = harness.factory.open_session(current);
    session.append(Event::new("Counted.1", "{}")).await.unwrap();
    session.commit().await.unwrap();

    // The stale writer's manifest view no longer matches the stored tail.
    let data = harness.backends.resolve("default").unwrap().data.clone();
    let mut late = Event::new("Late.1", "{}");
    late.event_version = 1;
    let err = data
        .append(&stale, &stale.active, false, vec![late])
        .await
        .expect_err("tail moved underneath the writer");
    assert!(matches!(
        err,
        manifold::store::DataStoreError::ConcurrentAppend { .. }
    ));
}

#[tokio::test]
async fn events_survive_reopening_the_container() {
    let harness = setup::harness().await.unwrap();
    let object_id = setup::random_object_id();
    let document = commit_events(&harness, &object_id, 3).await;

    // A fresh backend over the same directory sees the same state.
    let reopened = manifold_fs::FsBackend::new(harness.dir.path());
    let data = reopened.backend().data.clone();

    let events = data
        .read(&document, &document.active, ReadSelect::All)
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.timestamp.is_some()));
}
