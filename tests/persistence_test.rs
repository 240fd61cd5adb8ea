mod common;

use std::time::Duration;

use lix_engine::{CreateVersionOptions, Lix, LixConfig, VersionId};
use serde_json::json;

#[tokio::test]
async fn reopening_a_file_restores_state_and_active_version() {
    common::init_tracing();
    let (_dir, path) = common::create_temp_store("reopen.lix");

    let (feature, head) = {
        let lix = Lix::open(&path, LixConfig::default()).await.unwrap();
        lix.set_key_value("a", json!(1)).await.unwrap();
        let main = lix.active_version().await.unwrap().id;
        let feature = lix
            .create_version(CreateVersionOptions::named("feature"))
            .await
            .unwrap()
            .id;
        lix.switch_active_version(feature.clone(), Some(main)).await.unwrap();
        lix.set_key_value("b", json!(2)).await.unwrap();
        (feature, lix.active_version().await.unwrap().commit_id)
    };

    let reopened = Lix::open(&path, LixConfig::default()).await.unwrap();
    let active = reopened.active_version().await.unwrap();
    assert_eq!(active.id, feature);
    assert_eq!(active.commit_id, head);
    assert_eq!(reopened.get_key_value("a").await.unwrap(), Some(json!(1)));
    assert_eq!(reopened.get_key_value("b").await.unwrap(), Some(json!(2)));
    assert_eq!(reopened.versions().await.unwrap().len(), 3);
}

#[tokio::test]
async fn exported_blobs_open_as_independent_copies() {
    let lix = common::open_deterministic().await;
    lix.set_key_value("a", json!(1)).await.unwrap();
    let blob = lix.export_blob().await.unwrap();

    let copy = Lix::open_blob(blob, LixConfig::default()).await.unwrap();
    assert_eq!(copy.get_key_value("a").await.unwrap(), Some(json!(1)));
    assert_eq!(copy.store_id().await.unwrap(), lix.store_id().await.unwrap());

    copy.set_key_value("a", json!(2)).await.unwrap();
    assert_eq!(lix.get_key_value("a").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn garbage_collection_keeps_referenced_snapshots() {
    let lix = common::open_deterministic().await;
    lix.set_key_value("a", json!(1)).await.unwrap();
    lix.collect_garbage().await.unwrap();
    assert_eq!(lix.get_key_value("a").await.unwrap(), Some(json!(1)));
    let main = lix.active_version().await.unwrap().id;
    assert_eq!(lix.resolve_direct(main, "lix_key_value").await.unwrap().len(), 2);
}

#[tokio::test]
async fn subscribers_see_commits_of_their_version() {
    let lix = common::open_deterministic().await;
    let main = lix.active_version().await.unwrap().id;
    let mut all = lix.subscribe(None).await.unwrap();
    let mut global_only = lix.subscribe(Some(VersionId::global())).await.unwrap();

    lix.set_key_value("a", json!(1)).await.unwrap();
    let head = lix.active_version().await.unwrap().commit_id;

    let note = tokio::time::timeout(Duration::from_secs(1), all.next())
        .await
        .expect("notification in time")
        .expect("channel open")
        .unwrap();
    assert_eq!(note.version_id, main);
    assert_eq!(note.commit_id, head);
    assert_eq!(note.schema_keys, vec!["lix_key_value".to_string()]);

    let nothing = tokio::time::timeout(Duration::from_millis(50), global_only.next()).await;
    assert!(nothing.is_err());

    lix.transaction(|tx| tx.set_key_value_in(&VersionId::global(), "g", json!(1)))
        .await
        .unwrap();
    let note = tokio::time::timeout(Duration::from_secs(1), global_only.next())
        .await
        .expect("notification in time")
        .expect("channel open")
        .unwrap();
    assert!(note.version_id.is_global());
}

#[tokio::test]
async fn handles_share_one_engine() {
    let lix = common::open_deterministic().await;
    let mut tasks = Vec::new();
    for i in 0..16 {
        let handle = lix.clone();
        tasks.push(tokio::spawn(async move {
            handle.set_key_value(format!("k{i}"), json!(i)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    let values = common::key_values(&lix).await;
    assert_eq!(values.iter().filter(|(k, _)| k.starts_with('k')).count(), 16);
}
