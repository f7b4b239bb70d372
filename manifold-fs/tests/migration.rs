use std::sync::Arc;

use manifold::event::{Event, ReadSelect};
use manifold::factory::{Backends, ObjectDocumentFactory, StorageRouting};
use manifold::lifecycle::{stream_state, MigrationExecutor, MigrationTarget, StreamState};
use manifold::stream::StreamType;
use manifold_fs::FsBackend;

mod setup;

struct TwoStoreHarness {
    #[allow(dead_code)]
    primary_dir: tempfile::TempDir,
    #[allow(dead_code)]
    archive_dir: tempfile::TempDir,
    backends: Arc<Backends>,
    factory: ObjectDocumentFactory,
}

async fn two_stores() -> anyhow::Result<TwoStoreHarness> {
    let primary_dir = tempfile::tempdir()?;
    let archive_dir = tempfile::tempdir()?;

    let primary = FsBackend::new(primary_dir.path());
    primary.initialize().await?;
    let archive = FsBackend::new(archive_dir.path());
    archive.initialize().await?;

    let mut backends = Backends::new();
    backends.register("default", Arc::new(primary.backend()));
    backends.register("archive", Arc::new(archive.backend()));
    let backends = Arc::new(backends);

    let factory = ObjectDocumentFactory::new(
        Arc::clone(&backends),
        StorageRouting::new().with_default("default"),
    );

    Ok(TwoStoreHarness {
        primary_dir,
        archive_dir,
        backends,
        factory,
    })
}

#[tokio::test]
async fn migration_moves_events_across_containers() {
    let harness = two_stores().await.unwrap();
    let object_id = setup::random_object_id();

    let document = harness
        .factory
        .get_or_create("project", &object_id)
        .await
        .unwrap();
    let mut session = harness.factory.open_session(document);
    for i in 0..4 {
        session
            .append(Event::new("Counted.1", format!("{{\"n\":{i}}}")))
            .await
            .unwrap();
    }
    session.commit().await.unwrap();
    let mut document = session.into_document();

    let report = MigrationExecutor::new(Arc::clone(&harness.backends))
        .migrate(
            &mut document,
            &MigrationTarget::to_store(StreamType::Blob, "archive"),
            None,
            "migration",
        )
        .await
        .expect("migration should complete");

    assert_eq!(report.events_copied, 4);
    assert_eq!(document.active.data_store, "archive");

    // History is complete in the archive container.
    let archive = harness.backends.resolve("archive").unwrap().data.clone();
    let copied = archive
        .read(&document, &document.active, ReadSelect::All)
        .await
        .unwrap();
    assert_eq!(
        copied.iter().map(|e| e.event_version).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    // The source stream in the primary container is closed.
    let primary = harness.backends.resolve("default").unwrap().data.clone();
    assert_eq!(
        stream_state(&document, &report.from_stream, &*primary)
            .await
            .unwrap(),
        StreamState::Closed
    );
}

#[tokio::test]
async fn stale_sessions_follow_the_continuation_after_migration() {
    let harness = two_stores().await.unwrap();
    let object_id = setup::random_object_id();

    let document = harness
        .factory
        .get_or_create("project", &object_id)
        .await
        .unwrap();
    let mut session = harness.factory.open_session(document);
    session.append(Event::new("Counted.1", "{}")).await.unwrap();
    session.commit().await.unwrap();

    // A stale session still points at the pre-migration stream.
    let stale = harness.factory.get("project", &object_id).await.unwrap();
    let mut stale_session = harness.factory.open_session(stale);

    let mut document = session.into_document();
    MigrationExecutor::new(Arc::clone(&harness.backends))
        .migrate(
            &mut document,
            &MigrationTarget::to_store(StreamType::Blob, "archive"),
            None,
            "migration",
        )
        .await
        .unwrap();

    stale_session
        .append(Event::new("Late.1", "{}"))
        .await
        .unwrap();
    let receipt = stale_session
        .commit()
        .await
        .expect("the session retries on the continuation");

    // The event landed right after the copied history.
    assert_eq!(receipt.stream_identifier, document.active.stream_identifier);
    assert_eq!(receipt.first_version, 1);

    let archive = harness.backends.resolve("archive").unwrap().data.clone();
    let reloaded = harness.factory.get("project", &object_id).await.unwrap();
    let events = archive
        .read(&reloaded, &reloaded.active, ReadSelect::All)
        .await
        .unwrap();
    assert_eq!(
        events.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
        vec!["Counted.1", "Late.1"]
    );
}
