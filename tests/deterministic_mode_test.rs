mod common;

use lix_engine::engine::DETERMINISTIC_MODE_KEY;
use lix_engine::{CreateVersionOptions, Lix, LixConfig, VersionId};
use serde_json::json;

async fn scripted(lix: &Lix) {
    lix.set_key_value("a", json!(1)).await.unwrap();
    let feature = lix
        .create_version(CreateVersionOptions::default())
        .await
        .unwrap();
    let id = feature.id.clone();
    lix.transaction(move |tx| {
        tx.set_key_value_in(&id, "a", json!(2))?;
        tx.set_key_value("b", json!([1, 2, 3]))
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn identical_operations_produce_identical_stores() {
    let first = common::open_deterministic().await;
    let second = common::open_deterministic().await;
    scripted(&first).await;
    scripted(&second).await;

    assert_eq!(first.versions().await.unwrap(), second.versions().await.unwrap());
    assert_eq!(first.commits().await.unwrap(), second.commits().await.unwrap());
    assert_eq!(first.changes().await.unwrap(), second.changes().await.unwrap());
    assert_eq!(
        first.change_edges().await.unwrap(),
        second.change_edges().await.unwrap()
    );
    assert!(first.is_deterministic().await.unwrap());
}

#[tokio::test]
async fn normal_mode_generates_fresh_ids() {
    common::init_tracing();
    let first = Lix::open_in_memory(LixConfig::default()).await.unwrap();
    let second = Lix::open_in_memory(LixConfig::default()).await.unwrap();
    assert!(!first.is_deterministic().await.unwrap());

    let a = first.active_version().await.unwrap();
    let b = second.active_version().await.unwrap();
    assert_eq!(a.name, b.name);
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn the_stored_flag_switches_mode_at_runtime() {
    common::init_tracing();
    let lix = Lix::open_in_memory(LixConfig::default()).await.unwrap();
    lix.transaction(|tx| {
        tx.set_key_value_in(
            &VersionId::global(),
            DETERMINISTIC_MODE_KEY,
            json!({ "enabled": true }),
        )
    })
    .await
    .unwrap();
    assert!(lix.is_deterministic().await.unwrap());

    lix.transaction(|tx| {
        tx.set_key_value_in(
            &VersionId::global(),
            DETERMINISTIC_MODE_KEY,
            json!({ "enabled": false }),
        )
    })
    .await
    .unwrap();
    assert!(!lix.is_deterministic().await.unwrap());
}

#[tokio::test]
async fn the_flag_survives_a_reopen() {
    common::init_tracing();
    let (_dir, path) = common::create_temp_store("deterministic.lix");
    {
        let lix = Lix::open(&path, LixConfig::default().deterministic(true))
            .await
            .unwrap();
        lix.set_key_value("a", json!(1)).await.unwrap();
    }

    let reopened = Lix::open(&path, LixConfig::default()).await.unwrap();
    assert!(reopened.is_deterministic().await.unwrap());
    assert_eq!(reopened.get_key_value("a").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn enabling_the_flag_later_keeps_write_order() {
    common::init_tracing();
    let lix = Lix::open_in_memory(LixConfig::default()).await.unwrap();
    lix.set_key_value("k", json!(1)).await.unwrap();
    lix.transaction(|tx| {
        tx.set_key_value_in(
            &VersionId::global(),
            DETERMINISTIC_MODE_KEY,
            json!({ "enabled": true }),
        )
    })
    .await
    .unwrap();
    lix.set_key_value("k", json!(2)).await.unwrap();

    let changes: Vec<_> = lix
        .changes()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.entity_id == "k")
        .collect();
    assert_eq!(changes.len(), 2);
    let (first, last) = (&changes[0], &changes[1]);
    assert!(last.id.to_string().starts_with("01920000-0000-7000-8000-"));
    assert!(last.created_at > first.created_at);
    assert_eq!(lix.get_key_value("k").await.unwrap(), Some(json!(2)));
}
