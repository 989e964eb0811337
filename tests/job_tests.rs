
use cd_manager::deployment::Component;
use cd_manager::job::{
    AnchorParams, DeployParams, E2eParams, JobSpec, JobStage, JobState, JobType, WorkerVersion,
};
use cd_manager::repo::is_valid_sha;
use test_harness::test_sha;

#[test]
fn test_new_job_defaults() {
    let job = JobState::new(JobSpec::Deploy(DeployParams::new(
        Component::Ceramic,
        "latest",
    )));
    assert_eq!(job.stage, JobStage::Queued);
    assert!(!job.id.is_empty());
    assert!(job.error.is_none());
    assert_eq!(job.job_type(), JobType::Deploy);
}

#[test]
fn test_stage_classification() {
    let mut job = JobState::new(JobSpec::TestSmoke(Default::default()));
    for stage in [JobStage::Queued, JobStage::Dequeued] {
        job.stage = stage;
        assert!(!job.is_active());
        assert!(!job.is_finished());
    }
    for stage in [JobStage::Started, JobStage::Waiting] {
        job.stage = stage;
        assert!(job.is_active());
        assert!(!job.is_finished());
    }
    for stage in [
        JobStage::Skipped,
        JobStage::Canceled,
        JobStage::Completed,
        JobStage::Failed,
    ] {
        job.stage = stage;
        assert!(!job.is_active());
        assert!(job.is_finished());
    }
}

#[test]
fn test_persisted_form_is_type_params_map() {
    let job = JobState::new(JobSpec::Deploy(DeployParams::new(
        Component::Ipfs,
        test_sha('b'),
    )));
    let value = serde_json::to_value(&job).unwrap();
    assert_eq!(value["type"], "deploy");
    assert_eq!(value["params"]["component"], "ipfs");
    assert_eq!(value["params"]["sha"], test_sha('b'));
    assert_eq!(value["stage"], "queued");

    let restored: JobState = serde_json::from_value(value).unwrap();
    assert_eq!(restored, job);
}

#[test]
fn test_workflow_params_serialize_ref_key() {
    let job = JobState::new(JobSpec::Workflow(cd_manager::job::WorkflowParams {
        name: None,
        org: "3box".to_string(),
        repo: "ceramic-tests".to_string(),
        git_ref: "main".to_string(),
        workflow: "run-durable.yml".to_string(),
        inputs: Default::default(),
        run_id: None,
    }));
    let value = serde_json::to_value(&job).unwrap();
    assert_eq!(value["type"], "workflow");
    assert_eq!(value["params"]["ref"], "main");

    let restored: JobState = serde_json::from_value(value).unwrap();
    assert_eq!(restored, job);
}

#[test]
fn test_anchor_version_defaults_to_v2() {
    let value = serde_json::json!({
        "id": "job-1",
        "stage": "queued",
        "ts": "2024-01-01T00:00:00Z",
        "type": "anchor",
        "params": {}
    });
    let restored: JobState = serde_json::from_value(value).unwrap();
    assert_eq!(
        restored.spec,
        JobSpec::Anchor(AnchorParams {
            version: WorkerVersion::V2,
            task_id: None
        })
    );
    assert!(!restored.is_v5_worker());
}

#[test]
fn test_v5_worker_detection() {
    let v5 = JobState::new(JobSpec::Anchor(AnchorParams {
        version: WorkerVersion::V5,
        task_id: None,
    }));
    assert!(v5.is_v5_worker());

    let e2e = JobState::new(JobSpec::TestE2e(E2eParams::default()));
    assert!(!e2e.is_v5_worker());
}

#[test]
fn test_deploy_helpers() {
    let mut job = JobState::new(JobSpec::Deploy(DeployParams::new(
        Component::Cas,
        "latest",
    )));
    assert_eq!(job.deploy_component(), Some(Component::Cas));
    assert!(!job.is_force_deploy());
    if let JobSpec::Deploy(params) = &mut job.spec {
        params.force = true;
    }
    assert!(job.is_force_deploy());

    let anchor = JobState::new(JobSpec::Anchor(AnchorParams::default()));
    assert_eq!(anchor.deploy_component(), None);
}

#[test]
fn test_is_valid_sha() {
    assert!(is_valid_sha(&test_sha('a')));
    assert!(is_valid_sha("0123456789abcdef0123456789abcdef01234567"));
    // Too short, sentinel, uppercase, non-hex.
    assert!(!is_valid_sha("abc"));
    assert!(!is_valid_sha("latest"));
    assert!(!is_valid_sha(&test_sha('A')));
    assert!(!is_valid_sha(&test_sha('g')));
    assert!(!is_valid_sha(""));
}
