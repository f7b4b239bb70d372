use manifold::error::{codes, ErrorCode};
use manifold::event::{Event, ReadSelect};
use manifold::session::SessionError;

mod setup;

#[tokio::test]
async fn commits_are_durable_and_hash_chained() {
    let harness = setup::harness().await.unwrap();
    let object_id = setup::random_object_id();

    let document = harness
        .factory
        .get_or_create("project", &object_id)
        .await
        .unwrap();
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
    session.commit().await.expect("commit should succeed");

    let document = harness.factory.get("project", &object_id).await.unwrap();
    assert_eq!(document.active.current_stream_version, 1);
    assert_eq!(document.prev_hash, initial_hash);
    assert!(document.hash_is_current());

    let data = harness.backends.resolve("default").unwrap().data.clone();
    let events = data
        .read(&document, &document.active, ReadSelect::All)
        .await
        .unwrap();
    assert_eq!(
        events.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
        vec!["Created.1", "Renamed.1"]
    );
}

#[tokio::test]
async fn it_handles_concurrent_writes_to_the_same_stream() {
    let harness = setup::harness().await.unwrap();
    let object_id = setup::random_object_id();

    let document = harness
        .factory
        .get_or_create("project", &object_id)
        .await
        .unwrap();

    let mut alpha = harness.factory.open_session(document.clone());
    let mut beta = harness.factory.open_session(document);
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
        "one commit must win and one must conflict: {first:?} / {second:?}"
    );

    // Exactly one event landed, and no orphans are left behind.
    let document = harness.factory.get("project", &object_id).await.unwrap();
    assert_eq!(document.active.current_stream_version, 0);

    let data = harness.backends.resolve("default").unwrap().data.clone();
    let events = data
        .read(&document, &document.active, ReadSelect::All)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn conflicts_carry_the_stable_concurrency_code() {
    let harness = setup::harness().await.unwrap();
    let object_id = setup::random_object_id();

    let document = harness
        .factory
        .get_or_create("project", &object_id)
        .await
        .unwrap();

    let mut alpha = harness.factory.open_session(document.clone());
    let mut beta = harness.factory.open_session(document);
    alpha.append(Event::new("Alpha.1", "{}")).await.unwrap();
    beta.append(Event::new("Beta.1", "{}")).await.unwrap();

    alpha.commit().await.expect("first committer wins");
    let err = beta.commit().await.expect_err("second committer conflicts");
    assert_eq!(err.error_code(), codes::CONCURRENCY_CONFLICT);
}
