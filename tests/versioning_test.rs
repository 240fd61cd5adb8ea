mod common;

use lix_engine::{
    AdvanceMode, CreateVersionOptions, DiffStatus, Error, MergeStrategy, ProposalStatus,
    VersionId,
};
use serde_json::json;

async fn feature_branch(lix: &lix_engine::Lix) -> (VersionId, VersionId) {
    let main = lix.active_version().await.unwrap().id;
    let feature = lix
        .create_version(CreateVersionOptions::named("feature"))
        .await
        .unwrap();
    (main, feature.id)
}

async fn set_in(lix: &lix_engine::Lix, version: &VersionId, key: &'static str, value: serde_json::Value) {
    let version = version.clone();
    lix.transaction(move |tx| tx.set_key_value_in(&version, key, value))
        .await
        .unwrap();
}

#[tokio::test]
async fn versions_branch_from_the_active_head() {
    let lix = common::open_deterministic().await;
    lix.set_key_value("a", json!(1)).await.unwrap();
    let (main, feature) = feature_branch(&lix).await;

    let created = lix.version(feature.clone()).await.unwrap();
    let main_head = lix.version(main.clone()).await.unwrap().commit_id;
    assert_eq!(created.commit_id, main_head);
    assert_eq!(created.inherits_from_version_id, Some(VersionId::global()));
    assert_eq!(lix.versions().await.unwrap().len(), 3);

    set_in(&lix, &feature, "a", json!(2)).await;
    assert_eq!(lix.get_key_value("a").await.unwrap(), Some(json!(1)));
    assert_eq!(lix.key_values(feature.clone()).await.unwrap()["a"], json!(2));

    lix.switch_active_version(feature.clone(), Some(main)).await.unwrap();
    assert_eq!(lix.get_key_value("a").await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn generated_names_are_unique() {
    let lix = common::open_deterministic().await;
    let a = lix.create_version(CreateVersionOptions::default()).await.unwrap();
    let b = lix.create_version(CreateVersionOptions::default()).await.unwrap();
    assert_ne!(a.name, b.name);
    let err = lix
        .create_version(CreateVersionOptions::named(a.name.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn switching_requires_the_expected_active_version() {
    let lix = common::open_deterministic().await;
    let (main, feature) = feature_branch(&lix).await;

    let outcome = lix
        .switch_active_version(feature.clone(), Some(main.clone()))
        .await
        .unwrap();
    assert_eq!(outcome.previous, Some(main.clone()));

    let err = lix
        .switch_active_version(main.clone(), Some(main.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ActiveVersionChanged { .. }));
    assert_eq!(lix.active_version().await.unwrap().id, feature);
}

#[tokio::test]
async fn fast_forward_merge_moves_the_target_pointer() {
    let lix = common::open_deterministic().await;
    let (main, feature) = feature_branch(&lix).await;
    set_in(&lix, &feature, "b", json!(1)).await;
    let feature_head = lix.version(feature.clone()).await.unwrap().commit_id;
    let commits = lix.commits().await.unwrap().len();

    let outcome = lix
        .merge_version(feature.clone(), main.clone(), MergeStrategy::Strict)
        .await
        .unwrap();
    assert!(outcome.fast_forward);
    assert_eq!(outcome.commit_id, feature_head);
    assert_eq!(lix.version(main).await.unwrap().commit_id, feature_head);
    assert_eq!(lix.commits().await.unwrap().len(), commits);
    assert_eq!(lix.get_key_value("b").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn divergent_merge_needs_a_strategy_for_conflicts() {
    let lix = common::open_deterministic().await;
    lix.set_key_value("a", json!(1)).await.unwrap();
    let (main, feature) = feature_branch(&lix).await;
    set_in(&lix, &main, "a", json!(2)).await;
    set_in(&lix, &feature, "a", json!(3)).await;
    set_in(&lix, &feature, "only_feature", json!(true)).await;

    let err = lix
        .merge_version(feature.clone(), main.clone(), MergeStrategy::Strict)
        .await
        .unwrap_err();
    let Error::ChangeConflict { conflicts } = err else {
        panic!("expected a conflict, got {err:?}");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].key.entity_id, "a");

    let outcome = lix
        .merge_version(feature.clone(), main.clone(), MergeStrategy::PreferSource)
        .await
        .unwrap();
    assert!(!outcome.fast_forward);
    assert_eq!(outcome.resolved.len(), 1);

    let main_head = lix.version(main.clone()).await.unwrap().commit_id;
    let merge = lix
        .commits()
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.id == main_head)
        .unwrap();
    assert_eq!(merge.parent_commit_ids.len(), 2);

    assert_eq!(lix.get_key_value("a").await.unwrap(), Some(json!(3)));
    assert_eq!(lix.get_key_value("only_feature").await.unwrap(), Some(json!(true)));
    assert!(lix.conflicts(main).await.unwrap().is_empty());
}

#[tokio::test]
async fn advance_refuses_non_descendants_unless_forced() {
    let lix = common::open_deterministic().await;
    let (main, feature) = feature_branch(&lix).await;
    set_in(&lix, &main, "m", json!(1)).await;
    set_in(&lix, &feature, "f", json!(1)).await;
    let feature_head = lix.version(feature).await.unwrap().commit_id;

    let err = lix
        .advance_version(main.clone(), feature_head.clone(), AdvanceMode::FastForward)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FastForwardRequired { .. }));

    let moved = lix
        .advance_version(main, feature_head.clone(), AdvanceMode::Force)
        .await
        .unwrap();
    assert_eq!(moved.commit_id, feature_head);
    assert_eq!(lix.get_key_value("m").await.unwrap(), None);
    assert_eq!(lix.get_key_value("f").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn diff_reports_added_modified_and_removed_entities() {
    let lix = common::open_deterministic().await;
    lix.set_key_value("a", json!(1)).await.unwrap();
    let first = lix.active_version().await.unwrap().commit_id;

    lix.transaction(|tx| {
        tx.set_key_value("a", json!(2))?;
        tx.set_key_value("b", json!(20))
    })
    .await
    .unwrap();
    let second = lix.active_version().await.unwrap().commit_id;

    let diff = lix.diff(first, second.clone()).await.unwrap();
    let statuses: Vec<(&str, DiffStatus)> = diff
        .iter()
        .map(|d| (d.key.entity_id.as_str(), d.status))
        .collect();
    assert_eq!(statuses, vec![("a", DiffStatus::Modified), ("b", DiffStatus::Added)]);
    assert_eq!(diff[0].before, Some(json!({"key": "a", "value": 1})));
    assert_eq!(diff[0].after, Some(json!({"key": "a", "value": 2})));

    lix.execute(lix_engine::Statement::delete(
        lix_engine::View::State,
        lix_engine::StateFilter::schema("lix_key_value").entity("b"),
    ))
    .await
    .unwrap();
    let third = lix.active_version().await.unwrap().commit_id;
    let diff = lix.diff(second, third).await.unwrap();
    let b = diff.iter().find(|d| d.key.entity_id == "b").unwrap();
    assert_eq!(b.status, DiffStatus::Removed);
    assert_eq!(b.after, None);
}

#[tokio::test]
async fn proposals_are_accepted_or_rejected_once() {
    let lix = common::open_deterministic().await;
    let (main, feature) = feature_branch(&lix).await;
    set_in(&lix, &feature, "p", json!("proposed")).await;

    let proposal = lix.create_proposal(feature.clone(), main.clone()).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Open);
    let change_set = lix
        .change_sets()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == proposal.change_set_id)
        .unwrap();
    assert_eq!(change_set.elements.len(), 1);

    let outcome = lix
        .accept_proposal(proposal.id.clone(), MergeStrategy::Strict)
        .await
        .unwrap();
    assert!(outcome.fast_forward);
    assert_eq!(lix.get_key_value("p").await.unwrap(), Some(json!("proposed")));

    let again = lix.reject_proposal(proposal.id.clone()).await.unwrap_err();
    assert!(matches!(again, Error::InvalidArgument(_)));

    let second = lix.create_proposal(feature, main).await.unwrap();
    lix.reject_proposal(second.id.clone()).await.unwrap();
    let statuses: Vec<ProposalStatus> = lix
        .proposals()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.status)
        .collect();
    assert!(statuses.contains(&ProposalStatus::Accepted));
    assert!(statuses.contains(&ProposalStatus::Rejected));
}

#[tokio::test]
async fn checkpoints_label_the_active_head() {
    let lix = common::open_deterministic().await;
    lix.set_key_value("a", json!(1)).await.unwrap();
    let first = lix.create_checkpoint().await.unwrap();
    lix.set_key_value("a", json!(2)).await.unwrap();
    let second = lix.create_checkpoint().await.unwrap();

    assert_ne!(first, second);
    let mut checkpoints = lix.checkpoints().await.unwrap();
    checkpoints.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(checkpoints, expected);
    assert_eq!(lix.labels().await.unwrap().len(), 1);
}

#[tokio::test]
async fn deleting_versions_respects_active_and_global() {
    let lix = common::open_deterministic().await;
    let (main, feature) = feature_branch(&lix).await;

    assert!(matches!(
        lix.delete_version(VersionId::global()).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        lix.delete_version(main).await,
        Err(Error::InvalidArgument(_))
    ));
    lix.delete_version(feature.clone()).await.unwrap();
    assert!(matches!(
        lix.version(feature).await,
        Err(Error::NotFound { .. })
    ));
}
