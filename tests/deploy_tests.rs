//! Deploy state machine tests, driven directly through the job context.


use std::sync::atomic::Ordering;

use chrono::{TimeDelta, Utc};

use cd_manager::config::EnvType;
use cd_manager::deployment::{Component, Deployment};
use cd_manager::job::{self, DeployParams, JobSpec, JobStage, JobState};
use cd_manager::store::Store;
use test_harness::{test_sha, Harness};

fn deploy_state(stage: JobStage, params: DeployParams) -> JobState {
    let mut state = JobState::new(JobSpec::Deploy(params));
    state.stage = stage;
    state
}

fn params_of(state: &JobState) -> &DeployParams {
    match &state.spec {
        JobSpec::Deploy(params) => params,
        other => panic!("expected deploy params, got {other:?}"),
    }
}

#[tokio::test]
async fn test_latest_sha_resolves_to_branch_head() {
    let harness = Harness::new(EnvType::Qa).await;
    harness.repo.set_branch_head("js-ceramic", &test_sha('a'));

    let state = deploy_state(
        JobStage::Queued,
        DeployParams::new(Component::Ceramic, "latest"),
    );
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Dequeued);
    let params = params_of(&next);
    assert_eq!(params.sha.as_deref(), Some(test_sha('a').as_str()));
    assert!(!params.manual);
    let layout = params.layout.as_ref().unwrap();
    assert!(layout.repo.ends_with("/ceramic-qa"));
    assert!(layout.clusters.contains_key("ceramic-qa"));
}

#[tokio::test]
async fn test_explicit_sha_marks_manual() {
    let harness = Harness::new(EnvType::Qa).await;
    let state = deploy_state(
        JobStage::Queued,
        DeployParams::new(Component::Ceramic, test_sha('b')),
    );
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Dequeued);
    let params = params_of(&next);
    assert_eq!(params.sha.as_deref(), Some(test_sha('b').as_str()));
    assert!(params.manual);
}

#[tokio::test]
async fn test_unusable_sha_falls_back_to_build_hash() {
    let harness = Harness::new(EnvType::Qa).await;
    harness
        .store
        .update_build_hash(Component::Ceramic, &test_sha('c'))
        .await
        .unwrap();

    let state = deploy_state(
        JobStage::Queued,
        DeployParams::new(Component::Ceramic, "not-a-hash"),
    );
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Dequeued);
    let params = params_of(&next);
    assert_eq!(params.sha.as_deref(), Some(test_sha('c').as_str()));
    assert!(params.manual);
}

#[tokio::test]
async fn test_rollback_resolves_to_deploy_hash() {
    let harness = Harness::new(EnvType::Qa).await;
    harness
        .store
        .update_deploy_hash(Component::Ceramic, &test_sha('d'))
        .await
        .unwrap();

    let state = deploy_state(
        JobStage::Queued,
        DeployParams {
            component: Component::Ceramic,
            sha: None,
            sha_tag: Some("sha-ceramic-xyz".to_string()),
            force: true,
            rollback: true,
            manual: false,
            layout: None,
            start: None,
        },
    );
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Dequeued);
    let params = params_of(&next);
    assert_eq!(params.sha.as_deref(), Some(test_sha('d').as_str()));
    assert!(!params.manual);
}

#[tokio::test]
async fn test_missing_build_hash_fails_preprocessing() {
    let harness = Harness::new(EnvType::Qa).await;
    let state = deploy_state(
        JobStage::Queued,
        DeployParams {
            component: Component::Cas,
            sha: None,
            ..DeployParams::new(Component::Cas, "")
        },
    );
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Failed);
    assert!(next.error.unwrap().contains("No recorded hash"));
}

#[tokio::test]
async fn test_automated_deploy_of_deployed_hash_is_skipped() {
    let harness = Harness::new(EnvType::Qa).await;
    harness
        .store
        .update_deploy_hash(Component::Ceramic, &test_sha('e'))
        .await
        .unwrap();

    let mut params = DeployParams::new(Component::Ceramic, test_sha('e'));
    params.layout = Some(
        harness
            .deployment
            .generate_env_layout(Component::Ceramic)
            .unwrap(),
    );
    let state = deploy_state(JobStage::Dequeued, params);
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Skipped);
    assert!(harness.deployment.calls_matching("update_service:").is_empty());
}

#[tokio::test]
async fn test_manual_deploy_of_deployed_hash_proceeds() {
    let harness = Harness::new(EnvType::Qa).await;
    harness
        .store
        .update_deploy_hash(Component::Ceramic, &test_sha('e'))
        .await
        .unwrap();

    let mut params = DeployParams::new(Component::Ceramic, test_sha('e'));
    params.manual = true;
    params.layout = Some(
        harness
            .deployment
            .generate_env_layout(Component::Ceramic)
            .unwrap(),
    );
    let state = deploy_state(JobStage::Dequeued, params);
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Started);
    let params = params_of(&next);
    assert!(params.start.is_some());
    // Every service in the layout got updated, and the build hash followed.
    assert!(!harness.deployment.calls_matching("update_service:").is_empty());
    assert_eq!(
        harness.store.build_hashes().await.unwrap()[&Component::Ceramic],
        test_sha('e')
    );
}

#[tokio::test]
async fn test_rollback_uses_sha_tag_as_image_tag() {
    let harness = Harness::new(EnvType::Qa).await;

    let mut params = DeployParams::new(Component::Ceramic, test_sha('d'));
    params.rollback = true;
    params.sha_tag = Some("sha-ceramic-xyz".to_string());
    params.layout = Some(
        harness
            .deployment
            .generate_env_layout(Component::Ceramic)
            .unwrap(),
    );
    let state = deploy_state(JobStage::Dequeued, params);
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Started);
    let updates = harness.deployment.calls_matching("update_service:");
    assert!(!updates.is_empty());
    assert!(updates.iter().all(|call| call.ends_with(":sha-ceramic-xyz")));
}

#[tokio::test]
async fn test_update_env_failure_fails_job() {
    let harness = Harness::new(EnvType::Qa).await;
    harness.deployment.fail_update.store(true, Ordering::SeqCst);

    let mut params = DeployParams::new(Component::Ceramic, test_sha('f'));
    params.manual = true;
    params.layout = Some(
        harness
            .deployment
            .generate_env_layout(Component::Ceramic)
            .unwrap(),
    );
    let state = deploy_state(JobStage::Dequeued, params);
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Failed);
    assert!(next.error.unwrap().contains("update failed"));
}

#[tokio::test]
async fn test_started_completes_when_env_stable() {
    let harness = Harness::new(EnvType::Qa).await;

    let mut params = DeployParams::new(Component::Ceramic, test_sha('1'));
    params.layout = Some(
        harness
            .deployment
            .generate_env_layout(Component::Ceramic)
            .unwrap(),
    );
    let state = deploy_state(JobStage::Started, params);
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Completed);
    assert_eq!(
        harness.store.deploy_hashes().await.unwrap()[&Component::Ceramic],
        test_sha('1')
    );
}

#[tokio::test]
async fn test_started_waits_until_env_stable() {
    let harness = Harness::new(EnvType::Qa).await;
    harness
        .deployment
        .services_running
        .store(false, Ordering::SeqCst);

    let mut params = DeployParams::new(Component::Ceramic, test_sha('1'));
    params.layout = Some(
        harness
            .deployment
            .generate_env_layout(Component::Ceramic)
            .unwrap(),
    );
    let state = deploy_state(JobStage::Started, params);
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Started);
    assert!(next.error.is_none());
    assert!(harness.store.deploy_hashes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ipfs_completion_also_probes_ceramic() {
    let harness = Harness::new(EnvType::Qa).await;

    let mut params = DeployParams::new(Component::Ipfs, test_sha('2'));
    params.layout = Some(
        harness
            .deployment
            .generate_env_layout(Component::Ipfs)
            .unwrap(),
    );
    let state = deploy_state(JobStage::Started, params);
    let next = job::advance(&harness.context(), state).await.unwrap();

    assert_eq!(next.stage, JobStage::Completed);
    // IPFS layout (4 services) plus the regenerated Ceramic layout (4
    // services) were each probed once.
    let probes = harness.deployment.calls_matching("check_service:");
    assert_eq!(probes.len(), 8);
    assert!(probes
        .iter()
        .any(|call| call == "check_service:ceramic-qa/ceramic-qa-node"));
}

#[tokio::test]
async fn test_times_out_in_non_queued_stages() {
    let harness = Harness::new(EnvType::Qa).await;

    for stage in [JobStage::Dequeued, JobStage::Started] {
        let mut params = DeployParams::new(Component::Ceramic, test_sha('3'));
        params.layout = Some(
            harness
                .deployment
                .generate_env_layout(Component::Ceramic)
                .unwrap(),
        );
        let state =
            deploy_state(stage, params).with_ts(Utc::now() - TimeDelta::minutes(31));
        let next = job::advance(&harness.context(), state).await.unwrap();
        assert_eq!(next.stage, JobStage::Failed);
        assert_eq!(next.error.as_deref(), Some("timeout"));
    }

    // A Queued job carries its queue timestamp, which is no basis for a
    // timeout; it still dequeues normally.
    let state = deploy_state(
        JobStage::Queued,
        DeployParams::new(Component::Ceramic, test_sha('4')),
    )
    .with_ts(Utc::now() - TimeDelta::minutes(31));
    let next = job::advance(&harness.context(), state).await.unwrap();
    assert_eq!(next.stage, JobStage::Dequeued);
}
