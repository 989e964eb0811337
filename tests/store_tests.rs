
use chrono::{TimeDelta, Utc};

use cd_manager::deployment::Component;
use cd_manager::job::{
    DeployParams, E2eParams, JobSpec, JobStage, JobState, JobType, SmokeParams,
};
use cd_manager::store::{MemoryStore, Store};
use test_harness::test_sha;

fn queued_smoke(age: TimeDelta) -> JobState {
    JobState::new(JobSpec::TestSmoke(SmokeParams::default())).with_ts(Utc::now() - age)
}

#[tokio::test]
async fn test_queued_jobs_fifo_order() {
    let store = MemoryStore::new();
    let older = queued_smoke(TimeDelta::minutes(10));
    let newer = queued_smoke(TimeDelta::minutes(5));
    store.queue_job(newer.clone()).await.unwrap();
    store.queue_job(older.clone()).await.unwrap();

    let queued = store.queued_jobs().await.unwrap();
    assert_eq!(
        queued.iter().map(|js| js.id.clone()).collect::<Vec<_>>(),
        vec![older.id, newer.id]
    );
}

#[tokio::test]
async fn test_queued_jobs_excludes_deferred() {
    let store = MemoryStore::new();
    let due = queued_smoke(TimeDelta::minutes(1));
    let deferred = queued_smoke(TimeDelta::minutes(-5));
    store.queue_job(due.clone()).await.unwrap();
    store.queue_job(deferred.clone()).await.unwrap();

    let queued = store.queued_jobs().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, due.id);
    // The deferred job is persisted, just not due yet.
    assert!(store.job_by_id(&deferred.id).is_some());
}

#[tokio::test]
async fn test_ordered_jobs_filters_by_stage() {
    let store = MemoryStore::new();
    let mut dequeued = queued_smoke(TimeDelta::minutes(3));
    dequeued.stage = JobStage::Dequeued;
    let queued = queued_smoke(TimeDelta::minutes(2));
    store.queue_job(dequeued.clone()).await.unwrap();
    store.queue_job(queued.clone()).await.unwrap();

    let jobs = store.ordered_jobs(JobStage::Dequeued).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, dequeued.id);
}

#[tokio::test]
async fn test_advance_job_replaces_record() {
    let store = MemoryStore::new();
    let mut job = queued_smoke(TimeDelta::zero());
    store.queue_job(job.clone()).await.unwrap();

    job.stage = JobStage::Failed;
    job.error = Some("timeout".to_string());
    store.advance_job(&job).await.unwrap();

    let stored = store.job_by_id(&job.id).unwrap();
    assert_eq!(stored.stage, JobStage::Failed);
    assert_eq!(stored.error.as_deref(), Some("timeout"));
    assert_eq!(store.all_jobs().len(), 1);
}

#[tokio::test]
async fn test_iterate_by_type_descending_with_early_stop() {
    let store = MemoryStore::new();
    for minutes in [30, 20, 10] {
        store
            .queue_job(queued_smoke(TimeDelta::minutes(minutes)))
            .await
            .unwrap();
    }
    store
        .queue_job(JobState::new(JobSpec::TestE2e(E2eParams::default())))
        .await
        .unwrap();

    // Newest smoke test first; stop after the first hit.
    let mut seen: Vec<JobState> = Vec::new();
    store
        .iterate_by_type(JobType::TestSmoke, false, &mut |js| {
            seen.push(js);
            false
        })
        .await
        .unwrap();
    assert_eq!(seen.len(), 1);

    let mut all: Vec<JobState> = Vec::new();
    store
        .iterate_by_type(JobType::TestSmoke, true, &mut |js| {
            all.push(js);
            true
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|pair| pair[0].ts <= pair[1].ts));
    assert_eq!(seen[0].id, all[2].id);
}

#[tokio::test]
async fn test_hash_and_tag_maps() {
    let store = MemoryStore::new();
    assert!(store.build_hashes().await.unwrap().is_empty());

    store
        .update_build_hash(Component::Ceramic, &test_sha('1'))
        .await
        .unwrap();
    store
        .update_deploy_hash(Component::Ceramic, &test_sha('2'))
        .await
        .unwrap();
    store
        .update_deploy_tag(Component::Ipfs, "sha-ipfs-abc,qa")
        .await
        .unwrap();

    assert_eq!(
        store.build_hashes().await.unwrap()[&Component::Ceramic],
        test_sha('1')
    );
    assert_eq!(
        store.deploy_hashes().await.unwrap()[&Component::Ceramic],
        test_sha('2')
    );
    assert_eq!(
        store.deploy_tags().await.unwrap()[&Component::Ipfs],
        "sha-ipfs-abc,qa"
    );

    // Updates replace the previous entry.
    store
        .update_deploy_hash(Component::Ceramic, &test_sha('3'))
        .await
        .unwrap();
    assert_eq!(
        store.deploy_hashes().await.unwrap()[&Component::Ceramic],
        test_sha('3')
    );
}

#[tokio::test]
async fn test_terminal_jobs_stay_readable() {
    let store = MemoryStore::new();
    let mut job = JobState::new(JobSpec::Deploy(DeployParams::new(
        Component::Ceramic,
        test_sha('a'),
    )));
    store.queue_job(job.clone()).await.unwrap();
    job.stage = JobStage::Completed;
    store.advance_job(&job).await.unwrap();

    // Cache age-out never touches the durable record.
    assert_eq!(
        store.job_by_id(&job.id).unwrap().stage,
        JobStage::Completed
    );
}
