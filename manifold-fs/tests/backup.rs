use std::sync::Arc;

use manifold::backup::{BackupOptions, BackupQuery, BackupService};
use manifold::event::{Event, ReadSelect};
use manifold::snapshot::SnapshotStore;

mod setup;

fn service(harness: &setup::Harness) -> BackupService {
    let backups = harness.backends.resolve("default").unwrap().backups.clone();
    BackupService::new(Arc::clone(&harness.backends), backups, "fs")
}

async fn committed_object(
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
        let event_type = match i % 3 {
            0 => "Created.1",
            1 => "Renamed.1",
            _ => "Touched.2",
        };
        session
            .append(Event::new(event_type, format!("{{\"n\":{i}}}")))
            .await
            .unwrap();
    }
    session.commit().await.unwrap();
    session.into_document()
}

#[tokio::test]
async fn compressed_backups_restore_bit_identical_events() {
    let harness = setup::harness().await.unwrap();
    let source_id = setup::random_object_id();
    let target_id = setup::random_object_id();

    let source = committed_object(&harness, &source_id, 50).await;

    let service = service(&harness);
    let handle = service
        .backup(
            &source,
            &BackupOptions {
                compress: true,
                include_object_document: true,
                ..BackupOptions::default()
            },
        )
        .await
        .expect("backup should succeed");

    assert_eq!(handle.event_count, 50);
    assert!(handle.is_compressed);

    // The artifact sits on disk, gzipped, and the registry blob exists.
    let artifact = harness
        .fs
        .container()
        .read(&handle.location)
        .await
        .expect("artifact blob exists");
    assert!(handle.location.ends_with(".backup.json.gz"));
    assert_eq!(&artifact.bytes[..2], &[0x1f, 0x8b], "gzip magic");
    harness
        .fs
        .container()
        .read("backup-registry/backup-registry.json")
        .await
        .expect("registry blob exists");

    // Restore into a brand-new empty object.
    let mut target = harness
        .factory
        .get_or_create("project", &target_id)
        .await
        .unwrap();
    let summary = service.restore(&mut target, &handle).await.unwrap();
    assert_eq!(summary.event_count, 50);
    assert_eq!(summary.stream_version, 49);

    let data = harness.backends.resolve("default").unwrap().data.clone();
    let original = data
        .read(&source, &source.active, ReadSelect::All)
        .await
        .unwrap();
    let restored = data
        .read(&target, &target.active, ReadSelect::All)
        .await
        .unwrap();

    assert_eq!(original.len(), restored.len());
    for (a, b) in original.iter().zip(&restored) {
        assert_eq!(a.event_type, b.event_type);
        assert_eq!(a.event_version, b.event_version);
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.timestamp, b.timestamp);
    }
}

#[tokio::test]
async fn backups_can_include_snapshots() {
    let harness = setup::harness().await.unwrap();
    let source_id = setup::random_object_id();
    let target_id = setup::random_object_id();

    let source = committed_object(&harness, &source_id, 5).await;

    let snapshots = harness
        .backends
        .resolve("default")
        .unwrap()
        .snapshots
        .clone();
    snapshots
        .save(&manifold::snapshot::Snapshot {
            object_name: "project".to_owned(),
            object_id: source_id.clone(),
            stream_identifier: source.active.stream_identifier.clone(),
            version: 4,
            taken_at: chrono::Utc::now(),
            state: "{\"n\":4}".to_owned(),
        })
        .await
        .unwrap();

    let service = service(&harness);
    let handle = service
        .backup(
            &source,
            &BackupOptions {
                include_snapshots: true,
                ..BackupOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(handle.includes_snapshots);

    let mut target = harness
        .factory
        .get_or_create("project", &target_id)
        .await
        .unwrap();
    let summary = service.restore(&mut target, &handle).await.unwrap();
    assert_eq!(summary.snapshots_restored, 1);
}

#[tokio::test]
async fn the_registry_spans_objects_and_supports_queries() {
    let harness = setup::harness().await.unwrap();
    let first_id = setup::random_object_id();
    let second_id = setup::random_object_id();

    let first = committed_object(&harness, &first_id, 2).await;
    let second = committed_object(&harness, &second_id, 3).await;

    let service = service(&harness);
    let tagged = BackupOptions {
        tags: std::collections::HashMap::from([("tier".to_owned(), "gold".to_owned())]),
        ..BackupOptions::default()
    };

    service.backup(&first, &tagged).await.unwrap();
    service
        .backup(&second, &BackupOptions::default())
        .await
        .unwrap();

    let all = service.query(&BackupQuery::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let by_object = service
        .query(&BackupQuery {
            object_id: Some(second_id.clone()),
            ..BackupQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(by_object.len(), 1);
    assert_eq!(by_object[0].handle.event_count, 3);

    let by_tag = service
        .query(&BackupQuery {
            tag: Some(("tier".to_owned(), "gold".to_owned())),
            ..BackupQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(by_tag.len(), 1);
    assert_eq!(by_tag[0].handle.object_id, first_id);
}
