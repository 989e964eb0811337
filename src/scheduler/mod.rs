//! The control loop: a polled tick that ages out finished jobs, advances
//! active ones, ingests the queue, applies admission policy over the dequeued
//! list, and post-processes terminal deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::JobCache;
use crate::config::ManagerConfig;
use crate::deployment::{Component, Deployment};
use crate::error::Result;
use crate::job::{
    self, default_wait_time, AnchorParams, DeployParams, E2eParams, JobContext, JobSpec, JobStage,
    JobState, JobType, SmokeParams, WorkflowParams, DEFAULT_TICK, DEFAULT_TTL_DAYS,
};
use crate::notify::Notifier;
use crate::repo::Repository;
use crate::store::Store;
use crate::SERVICE_NAME;

const TESTS_NAME: &str = "Post-Deployment Tests";
const TESTS_ORG: &str = "3box";
const TESTS_REPO: &str = "ceramic-tests";
const TESTS_REF: &str = "main";
const TESTS_WORKFLOW: &str = "run-durable.yml";
const TESTS_SELECTOR: &str = "fast";

const WORKFLOW_INPUT_ENVIRONMENT: &str = "environment";
const WORKFLOW_INPUT_TEST_SELECTOR: &str = "test_selector";

/// Panic payloads recorded on a failed job are capped at this many bytes.
const PANIC_TEXT_LIMIT: usize = 1024;

/// Schedules and advances jobs against a shared cluster environment.
///
/// One instance owns the tick loop for its environment; ticks never overlap
/// (a one-capacity run token serializes them, and shutdown acquires the token
/// to drain).
pub struct JobManager {
    ctx: JobContext,
    config: ManagerConfig,
    paused: AtomicBool,
    run_token: Mutex<()>,
}

impl JobManager {
    /// Build a manager and prime the cache with every persisted job that was
    /// mid-flight when the previous process stopped.
    pub async fn new(
        config: ManagerConfig,
        cache: Arc<JobCache>,
        store: Arc<dyn Store>,
        deployment: Arc<dyn Deployment>,
        repo: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let manager = Self {
            ctx: JobContext {
                env: config.env,
                store,
                deployment,
                repo,
                notifier,
                cache,
            },
            paused: AtomicBool::new(config.paused),
            run_token: Mutex::new(()),
            config,
        };
        manager.prime_cache().await?;
        Ok(manager)
    }

    async fn prime_cache(&self) -> Result<()> {
        for stage in [JobStage::Dequeued, JobStage::Started, JobStage::Waiting] {
            for job_state in self.ctx.store.ordered_jobs(stage).await? {
                self.ctx.cache.write_job(&job_state);
            }
        }
        Ok(())
    }

    /// Queue a new job, assigning an id if the caller didn't.
    pub async fn new_job(&self, mut state: JobState) -> Result<JobState> {
        state.stage = JobStage::Queued;
        if state.id.is_empty() {
            state.id = Uuid::new_v4().to_string();
        }
        self.ctx.store.queue_job(state.clone()).await?;
        Ok(state)
    }

    /// Latest cached state for a job, if it has been dequeued and not yet
    /// aged out.
    pub fn check_job(&self, job_id: &str) -> Option<JobState> {
        self.ctx.cache.job_by_id(job_id)
    }

    /// Toggle the paused flag; paused ticks keep advancing existing jobs but
    /// admit nothing new. Returns the new value.
    pub fn pause(&self) -> bool {
        let paused = !self.paused.load(Ordering::SeqCst);
        self.paused.store(paused, Ordering::SeqCst);
        tracing::info!(paused, "Job manager pause toggled");
        paused
    }

    /// Run the tick loop until the token is cancelled, then drain the
    /// in-flight tick before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(DEFAULT_TICK);
        // A slow round of processing drops its missed ticks rather than
        // bursting to catch up.
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Start processing jobs");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Stop processing jobs");
                    let _drain = self.run_token.lock().await;
                    return;
                }
                _ = tick.tick() => {
                    self.run_tick().await;
                }
            }
        }
    }

    /// One serialized tick of the control loop.
    pub async fn run_tick(&self) {
        let _token = self.run_token.lock().await;
        self.process_jobs().await;
    }

    async fn process_jobs(&self) {
        let now = Utc::now();
        // Age out finished jobs past their cache TTL; the durable record
        // outlives the cache entry.
        let ttl = TimeDelta::days(DEFAULT_TTL_DAYS);
        let old_jobs = self
            .ctx
            .cache
            .jobs_by_matcher(|js| js.is_finished() && js.ts < now - ttl);
        if !old_jobs.is_empty() {
            tracing::info!(count = old_jobs.len(), "Aging out jobs");
            for old_job in old_jobs {
                self.ctx.cache.delete_job(&old_job.id);
            }
        }
        // Advance everything in progress before looking for new jobs.
        self.advance_jobs(self.ctx.cache.jobs_by_matcher(JobState::is_active))
            .await;
        // Paused managers keep advancing existing jobs but start nothing new.
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        self.check_test_intervals().await;
        // Move freshly queued jobs to Dequeued; first-time preprocessing
        // happens inside the state machines here.
        match self.ctx.store.queued_jobs().await {
            Ok(queued) => self.advance_jobs(queued).await,
            Err(e) => tracing::warn!(error = %e, "Error reading queued jobs"),
        }
        // Anchor processing happens even when nothing was dequeued: a
        // configured minimum may require topping up the queue.
        let mut process_anchor_jobs = true;
        let dequeued = match self.ctx.store.ordered_jobs(JobStage::Dequeued).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "Error reading dequeued jobs");
                return;
            }
        };
        if !dequeued.is_empty() {
            tracing::debug!(count = dequeued.len(), "Dequeued jobs");
            if self.process_force_deploy_jobs(&dequeued).await {
                process_anchor_jobs = false;
            } else if dequeued[0].job_type() == JobType::Deploy {
                self.process_deploy_jobs(&dequeued).await;
                // A deploy at the head normally blocks anchors behind it, in
                // queue order. E2E tests are the exception: they need anchors
                // to make progress while they themselves block the deploy, so
                // anchors skip the queue whenever E2E tests are in flight.
                let active_e2e = self
                    .ctx
                    .cache
                    .jobs_by_matcher(|js| js.is_active() && js.job_type() == JobType::TestE2e);
                process_anchor_jobs = !active_e2e.is_empty();
            } else {
                self.process_test_jobs(&dequeued).await;
                self.process_workflow_jobs(&dequeued).await;
            }
        }
        if process_anchor_jobs {
            self.process_anchor_jobs(&dequeued).await;
        }
    }

    /// Collapse force deploys per component, cancel active deploys they
    /// preempt, and run the survivors. Returns true when force deploys were
    /// present (anchor processing is suppressed for the tick).
    async fn process_force_deploy_jobs(&self, dequeued: &[JobState]) -> bool {
        // Newest force deploy wins per component.
        let mut force_deploys: HashMap<Component, JobState> = HashMap::new();
        for job_state in dequeued {
            if job_state.is_force_deploy() {
                if let Some(component) = job_state.deploy_component() {
                    force_deploys.insert(component, job_state.clone());
                }
            }
        }
        if force_deploys.is_empty() {
            return false;
        }
        // Skip dequeued deploys for components being force deployed.
        for job_state in dequeued {
            if let Some(component) = job_state.deploy_component() {
                if let Some(chosen) = force_deploys.get(&component) {
                    if chosen.id != job_state.id
                        && self
                            .update_job_stage(job_state.clone(), JobStage::Skipped)
                            .await
                            .is_err()
                    {
                        // Leave state alone and let the next tick restart
                        // cleanly; already-skipped jobs stay skipped.
                        return true;
                    }
                }
            }
        }
        // Cancel active deploys for components being force deployed.
        for active_deploy in self.active_deploys() {
            if let Some(component) = active_deploy.deploy_component() {
                if force_deploys.contains_key(&component)
                    && self
                        .update_job_stage(active_deploy, JobStage::Canceled)
                        .await
                        .is_err()
                {
                    return true;
                }
            }
        }
        self.advance_jobs(force_deploys.into_values().collect()).await;
        true
    }

    /// Run the head deploy after collapsing back-to-back deploys for the same
    /// component into the newest one. Deploys are incompatible with every
    /// other running job.
    async fn process_deploy_jobs(&self, dequeued: &[JobState]) -> bool {
        if !self.ctx.cache.jobs_by_matcher(JobState::is_active).is_empty() {
            tracing::debug!("Deploy waiting on other jobs in progress");
            return false;
        }
        let mut deploy_job = dequeued[0].clone();
        let Some(component) = deploy_job.deploy_component() else {
            return false;
        };
        for job_state in &dequeued[1..] {
            match job_state.job_type() {
                // Don't collapse deploys across test jobs.
                JobType::TestE2e | JobType::TestSmoke => break,
                JobType::Deploy if job_state.deploy_component() == Some(component) => {
                    if self
                        .update_job_stage(deploy_job, JobStage::Skipped)
                        .await
                        .is_err()
                    {
                        return true;
                    }
                    deploy_job = job_state.clone();
                }
                _ => {}
            }
        }
        self.advance_jobs(vec![deploy_job]).await;
        true
    }

    /// Collapse tests between deployments into one run per test type and run
    /// the survivors concurrently.
    async fn process_test_jobs(&self, dequeued: &[JobState]) -> bool {
        if !self.active_deploys().is_empty() {
            tracing::debug!("Tests waiting on deployment in progress");
            return false;
        }
        let mut dequeued_tests: HashMap<JobType, JobState> = HashMap::new();
        for job_state in dequeued {
            match job_state.job_type() {
                // Don't collapse tests across deploys.
                JobType::Deploy => break,
                job_type @ (JobType::TestE2e | JobType::TestSmoke) => {
                    // Newest test of each type wins; skip the one it replaces.
                    if let Some(replaced) = dequeued_tests.insert(job_type, job_state.clone()) {
                        if self
                            .update_job_stage(replaced, JobStage::Skipped)
                            .await
                            .is_err()
                        {
                            return true;
                        }
                    }
                }
                _ => {}
            }
        }
        let admitted: Vec<JobState> = dequeued_tests.into_values().collect();
        let count = admitted.len();
        self.advance_jobs(admitted).await;
        count > 0
    }

    /// Run every dequeued workflow up to the next deploy. Workflows are not
    /// collapsed: distinct jobs may target distinct workflows.
    async fn process_workflow_jobs(&self, dequeued: &[JobState]) -> bool {
        if !self.active_deploys().is_empty() {
            tracing::debug!("Workflows waiting on deployment in progress");
            return false;
        }
        let mut dequeued_workflows = Vec::new();
        for job_state in dequeued {
            match job_state.job_type() {
                JobType::Deploy => break,
                JobType::Workflow => dequeued_workflows.push(job_state.clone()),
                _ => {}
            }
        }
        let count = dequeued_workflows.len();
        self.advance_jobs(dequeued_workflows).await;
        count > 0
    }

    /// Process the v5 and v2 anchor partitions independently.
    async fn process_anchor_jobs(&self, dequeued: &[JobState]) -> bool {
        if !self.active_deploys().is_empty() {
            tracing::debug!("Anchors waiting on deployment in progress");
            return false;
        }
        let v5 = self.process_worker_anchor_jobs(dequeued, true).await;
        let v2 = self.process_worker_anchor_jobs(dequeued, false).await;
        v5 || v2
    }

    async fn process_worker_anchor_jobs(&self, dequeued: &[JobState], v5: bool) -> bool {
        let active_anchors = self.ctx.cache.jobs_by_matcher(|js| {
            js.is_active() && js.job_type() == JobType::Anchor && js.is_v5_worker() == v5
        });
        let mut admitted: Vec<JobState> = Vec::new();
        for job_state in dequeued {
            if job_state.job_type() == JobType::Anchor && job_state.is_v5_worker() == v5 {
                // v5 workers are scaled upstream; v2 workers are capped here,
                // counting both active and just-admitted jobs.
                if v5
                    || self.config.max_anchor_jobs == -1
                    || ((active_anchors.len() + admitted.len()) as i64) < self.config.max_anchor_jobs
                {
                    admitted.push(job_state.clone());
                } else if self
                    .update_job_stage(job_state.clone(), JobStage::Skipped)
                    .await
                    .is_err()
                {
                    return true;
                }
            }
        }
        let count = admitted.len();
        self.advance_jobs(admitted).await;
        // Top up the v2 partition to the configured minimum. The synthetic
        // jobs are picked up on subsequent ticks, coordinated with the rest of
        // the queue; transient overshoot past the maximum is acceptable since
        // admission is capped above.
        if !v5 {
            for _ in (count as i64)..self.config.min_anchor_jobs {
                let job_state =
                    JobState::new(JobSpec::Anchor(AnchorParams::default())).with_source(SERVICE_NAME);
                if let Err(e) = self.ctx.store.queue_job(job_state).await {
                    tracing::warn!(error = %e, "Failed to queue additional anchor job");
                }
            }
        }
        count > 0
    }

    /// Keep periodic test coverage flowing: when an interval is configured
    /// and the most recent job of the type is older than it, queue a fresh
    /// synthetic test.
    async fn check_test_intervals(&self) {
        if let Some(interval) = self.config.e2e_test_interval {
            self.check_job_interval(JobType::TestE2e, interval, || {
                JobSpec::TestE2e(E2eParams::default())
            })
            .await;
        }
        if let Some(interval) = self.config.smoke_test_interval {
            self.check_job_interval(JobType::TestSmoke, interval, || {
                JobSpec::TestSmoke(SmokeParams::default())
            })
            .await;
        }
    }

    async fn check_job_interval(
        &self,
        job_type: JobType,
        interval: Duration,
        make_spec: impl Fn() -> JobSpec,
    ) {
        let mut last_job: Option<JobState> = None;
        let result = self
            .ctx
            .store
            .iterate_by_type(job_type, false, &mut |js| {
                last_job = Some(js);
                // The newest record is all we need.
                false
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(%job_type, error = %e, "Error iterating jobs by type");
            return;
        }
        let window = TimeDelta::from_std(interval).unwrap_or_else(|_| TimeDelta::zero());
        if let Some(last_job) = last_job {
            if Utc::now() - last_job.ts > window {
                tracing::info!(%job_type, "Queueing scheduled test job");
                let job_state = JobState::new(make_spec()).with_source(SERVICE_NAME);
                if let Err(e) = self.ctx.store.queue_job(job_state).await {
                    tracing::warn!(%job_type, error = %e, "Failed to queue scheduled test job");
                }
            }
        }
    }

    /// Advance a batch of jobs concurrently and wait for all of them; the
    /// barrier is what keeps ticks from overlapping their own work.
    async fn advance_jobs(&self, jobs: Vec<JobState>) {
        if jobs.is_empty() {
            return;
        }
        let mut tasks: JoinSet<()> = JoinSet::new();
        for job_state in jobs {
            self.spawn_advance(&mut tasks, job_state);
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Run one job advancement as a supervised task: the advancement itself
    /// runs in its own spawned task so a panic is contained at the join and
    /// recorded on the job instead of unwinding the tick.
    fn spawn_advance(&self, tasks: &mut JoinSet<()>, state: JobState) {
        let ctx = self.ctx.clone();
        tasks.spawn(async move {
            let previous_stage = state.stage;
            let advancement = tokio::spawn({
                let ctx = ctx.clone();
                let state = state.clone();
                async move { job::advance(&ctx, state).await }
            });
            match advancement.await {
                Ok(Ok(next)) => {
                    if next.stage != previous_stage {
                        tracing::info!(
                            job_id = %next.id,
                            job_type = %next.job_type(),
                            from = %previous_stage,
                            to = %next.stage,
                            "Job advanced"
                        );
                        post_process_job(&ctx, &next).await;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(job_id = %state.id, error = %e, "Job advancement failed");
                }
                Err(join_error) if join_error.is_panic() => {
                    let text = panic_text(join_error.into_panic());
                    tracing::error!(job_id = %state.id, panic = %text, "Panic while advancing job");
                    if let Err(e) = job::transition(
                        &ctx,
                        state.clone(),
                        JobStage::Failed,
                        Some(format!("panic: {text}")),
                    )
                    .await
                    {
                        tracing::warn!(job_id = %state.id, error = %e, "Job update failed after panic");
                    }
                }
                Err(_) => {}
            }
        });
    }

    async fn update_job_stage(&self, state: JobState, stage: JobStage) -> Result<JobState> {
        job::transition(&self.ctx, state, stage, None)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Job stage update failed");
                e
            })
    }

    fn active_deploys(&self) -> Vec<JobState> {
        self.ctx
            .cache
            .jobs_by_matcher(|js| js.is_active() && js.job_type() == JobType::Deploy)
    }
}

/// Follow-ups after a job changes stage: completed deploys schedule the
/// post-deploy test workflow, failed deploys roll back once.
async fn post_process_job(ctx: &JobContext, state: &JobState) {
    let JobSpec::Deploy(params) = &state.spec else {
        return;
    };
    match state.stage {
        JobStage::Completed => {
            // Give the deployment a few minutes to stabilize before the test
            // workflow becomes eligible.
            let workflow = JobState::new(JobSpec::Workflow(WorkflowParams {
                name: Some(TESTS_NAME.to_string()),
                org: TESTS_ORG.to_string(),
                repo: TESTS_REPO.to_string(),
                git_ref: TESTS_REF.to_string(),
                workflow: TESTS_WORKFLOW.to_string(),
                inputs: BTreeMap::from([
                    (
                        WORKFLOW_INPUT_ENVIRONMENT.to_string(),
                        ctx.env.as_str().to_string(),
                    ),
                    (
                        WORKFLOW_INPUT_TEST_SELECTOR.to_string(),
                        TESTS_SELECTOR.to_string(),
                    ),
                ]),
                run_id: None,
            }))
            .with_ts(Utc::now() + default_wait_time())
            .with_source(SERVICE_NAME);
            if let Err(e) = ctx.store.queue_job(workflow).await {
                tracing::warn!(job_id = %state.id, error = %e, "Failed to queue test workflow after deploy");
            }
        }
        JobStage::Failed => {
            // Roll back to the previously deployed tag, unless this failure
            // was itself a rollback.
            if params.rollback {
                return;
            }
            let deploy_tags = match ctx.store.deploy_tags().await {
                Ok(tags) => tags,
                Err(e) => {
                    tracing::warn!(job_id = %state.id, error = %e, "Failed to retrieve deploy tags");
                    return;
                }
            };
            let Some(deploy_tag) = deploy_tags.get(&params.component) else {
                tracing::warn!(job_id = %state.id, component = %params.component, "Missing component deploy tag");
                return;
            };
            // Strip the deploy target off the recorded tag.
            let sha_tag = deploy_tag.split(',').next().unwrap_or(deploy_tag);
            let rollback = JobState::new(JobSpec::Deploy(DeployParams {
                component: params.component,
                sha: None,
                sha_tag: Some(sha_tag.to_string()),
                // No point waiting on other jobs before redeploying a working
                // image.
                force: true,
                rollback: true,
                manual: false,
                layout: None,
                start: None,
            }))
            .with_source(SERVICE_NAME);
            if let Err(e) = ctx.store.queue_job(rollback).await {
                tracing::warn!(job_id = %state.id, error = %e, "Failed to queue rollback after failed deploy");
            }
        }
        _ => {}
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    let mut text = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    let mut limit = PANIC_TEXT_LIMIT.min(text.len());
    while !text.is_char_boundary(limit) {
        limit -= 1;
    }
    text.truncate(limit);
    text
}
