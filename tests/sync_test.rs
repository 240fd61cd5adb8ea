mod common;

use std::sync::Arc;
use std::time::Duration;

use lix_engine::{
    Error, InProcessTransport, Lix, LixConfig, MergeStrategy, StateFilter, SyncServer,
};
use serde_json::json;

/// A hosted store and a clone of it, both in normal mode.
async fn hosted_pair() -> (Lix, Lix, InProcessTransport, String) {
    common::init_tracing();
    let server = Arc::new(SyncServer::new());
    let origin = Lix::open_in_memory(LixConfig::default()).await.unwrap();
    origin.set_key_value("shared", json!(0)).await.unwrap();
    let store_id = server.host(origin.clone()).await.unwrap();

    let blob = origin.export_blob().await.unwrap();
    let clone = Lix::open_blob(blob, LixConfig::default()).await.unwrap();
    assert_eq!(clone.store_id().await.unwrap(), store_id);

    (origin, clone, InProcessTransport::new(server), store_id)
}

#[tokio::test]
async fn pushed_changes_fast_forward_the_remote() {
    let (origin, clone, transport, store_id) = hosted_pair().await;

    clone.set_key_value("from_clone", json!(1)).await.unwrap();
    let report = clone.push(&transport, &store_id).await.unwrap();
    assert!(report.applied > 0);
    assert!(report.conflicts.is_empty());
    let main = clone.active_version().await.unwrap();
    assert!(report.advanced.contains(&main.id));

    assert_eq!(origin.get_key_value("from_clone").await.unwrap(), Some(json!(1)));
    assert_eq!(origin.active_version().await.unwrap().commit_id, main.commit_id);

    // Nothing new on either side.
    let again = clone.push(&transport, &store_id).await.unwrap();
    assert_eq!(again.applied, 0);
}

#[tokio::test]
async fn pulled_changes_reach_the_clone() {
    let (origin, clone, transport, store_id) = hosted_pair().await;

    origin.set_key_value("from_origin", json!("hi")).await.unwrap();
    let report = clone.pull(&transport, &store_id).await.unwrap();
    assert!(report.applied > 0);
    assert_eq!(clone.get_key_value("from_origin").await.unwrap(), Some(json!("hi")));

    let repeat = clone.pull(&transport, &store_id).await.unwrap();
    assert_eq!(repeat.applied, 0);
}

#[tokio::test]
async fn concurrent_edits_converge_and_report_conflicts() {
    let (origin, clone, transport, store_id) = hosted_pair().await;

    origin.set_key_value("x", json!("origin")).await.unwrap();
    origin.set_key_value("only_origin", json!(true)).await.unwrap();
    clone.set_key_value("x", json!("clone")).await.unwrap();

    let outcome = clone.sync(&transport, &store_id).await.unwrap();
    assert_eq!(outcome.pulled.conflicts.len(), 1);
    assert_eq!(outcome.pulled.conflicts[0].key.entity_id, "x");

    let origin_head = origin.active_version().await.unwrap();
    let clone_head = clone.active_version().await.unwrap();
    assert_eq!(origin_head.commit_id, clone_head.commit_id);
    assert_eq!(
        origin.get_key_value("x").await.unwrap(),
        clone.get_key_value("x").await.unwrap()
    );
    assert_eq!(clone.get_key_value("only_origin").await.unwrap(), Some(json!(true)));

    // The conflict stays visible until someone picks a leaf.
    let conflicts = clone.conflicts(clone_head.id.clone()).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let chosen = conflicts[0].leaves[0].clone();
    clone
        .resolve_conflict(clone_head.id.clone(), conflicts[0].key.clone(), chosen)
        .await
        .unwrap();
    assert!(clone.conflicts(clone_head.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn versions_created_remotely_appear_locally() {
    let (origin, clone, transport, store_id) = hosted_pair().await;
    let feature = origin
        .create_version(lix_engine::CreateVersionOptions::named("remote-feature"))
        .await
        .unwrap();

    clone.pull(&transport, &store_id).await.unwrap();
    let local = clone.version(feature.id.clone()).await.unwrap();
    assert_eq!(local.name, "remote-feature");
    assert!(!local.is_active);

    clone
        .merge_version(feature.id, clone.active_version().await.unwrap().id, MergeStrategy::Strict)
        .await
        .unwrap();
}

#[tokio::test]
async fn remote_queries_run_against_the_hosted_store() {
    let (origin, _clone, transport, store_id) = hosted_pair().await;
    origin.set_key_value("q", json!(42)).await.unwrap();

    let output = lix_engine::SyncTransport::query(
        &transport,
        lix_engine::sync::QueryRequest {
            store_id,
            statement: lix_engine::Statement::select(
                lix_engine::View::State,
                StateFilter::schema("lix_key_value").entity("q"),
            ),
        },
    )
    .await
    .unwrap();
    assert_eq!(output.rows.len(), 1);
    assert_eq!(output.rows[0].snapshot_content["value"], json!(42));
}

#[tokio::test]
async fn unknown_stores_are_rejected() {
    let (_origin, clone, transport, _store_id) = hosted_pair().await;
    let err = clone.pull(&transport, "not-hosted").await.unwrap_err();
    assert!(matches!(err, Error::Remote { .. }));
}

#[tokio::test]
async fn slow_transports_time_out() {
    common::init_tracing();
    let server = Arc::new(SyncServer::new());
    let origin = Lix::open_in_memory(LixConfig::default()).await.unwrap();
    let store_id = server.host(origin.clone()).await.unwrap();
    let blob = origin.export_blob().await.unwrap();
    let clone = Lix::open_blob(
        blob,
        LixConfig::default().sync_timeout(Duration::from_millis(20)),
    )
    .await
    .unwrap();

    let transport = InProcessTransport::new(server).with_latency(Duration::from_millis(500));
    let err = clone.pull(&transport, &store_id).await.unwrap_err();
    assert!(matches!(err, Error::SyncTransport(_)));
}

#[tokio::test]
async fn colliding_ids_from_a_deterministic_clone_abort_the_pull() {
    common::init_tracing();
    let server = Arc::new(SyncServer::new());
    let origin = Lix::open_in_memory(LixConfig::default().deterministic(true))
        .await
        .unwrap();
    let store_id = server.host(origin.clone()).await.unwrap();
    let blob = origin.export_blob().await.unwrap();
    let clone = Lix::open_blob(blob, LixConfig::default().deterministic(true))
        .await
        .unwrap();
    let transport = InProcessTransport::new(server);

    // Both sides draw the same next ids from the shared counter.
    origin.set_key_value("from_origin", json!(1)).await.unwrap();
    clone.set_key_value("from_clone", json!(2)).await.unwrap();
    let head = clone.active_version().await.unwrap();
    let clock = clone.vector_clock().await.unwrap();

    let err = clone.pull(&transport, &store_id).await.unwrap_err();
    assert!(matches!(err, Error::GraphInconsistency(_)), "got {err:?}");
    assert!(!err.is_recoverable());

    assert_eq!(clone.get_key_value("from_origin").await.unwrap(), None);
    assert_eq!(clone.get_key_value("from_clone").await.unwrap(), Some(json!(2)));
    assert_eq!(clone.active_version().await.unwrap().commit_id, head.commit_id);
    assert_eq!(clone.vector_clock().await.unwrap(), clock);
}
