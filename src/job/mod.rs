//! Job model shared by the scheduler and the per-type state machines.
//!
//! A job is a [`JobState`] record: identity, stage, transition timestamp and
//! typed per-type parameters. The typed [`JobSpec`] serializes to the open
//! `{"type": ..., "params": {...}}` map that the durable store persists.

pub mod anchor;
pub mod deploy;
pub mod e2e;
pub mod smoke;
pub mod workflow;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::JobCache;
use crate::config::EnvType;
use crate::deployment::{Component, Deployment, EnvLayout};
use crate::error::Result;
use crate::notify::Notifier;
use crate::repo::Repository;
use crate::store::Store;

/// Scheduler poll interval.
pub const DEFAULT_TICK: Duration = Duration::from_secs(10);
/// Terminal jobs age out of the cache after this many days.
pub const DEFAULT_TTL_DAYS: i64 = 1;
/// Error recorded when a job exceeds its failure window.
pub const ERROR_TIMEOUT: &str = "timeout";

/// Failure window for deploy, anchor, smoke and workflow jobs.
pub fn default_failure_time() -> TimeDelta {
    TimeDelta::minutes(30)
}

/// Delay before the post-deploy test workflow is eligible to run.
pub fn default_wait_time() -> TimeDelta {
    TimeDelta::minutes(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Deploy,
    Anchor,
    TestE2e,
    TestSmoke,
    Workflow,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Deploy => write!(f, "deploy"),
            JobType::Anchor => write!(f, "anchor"),
            JobType::TestE2e => write!(f, "test_e2e"),
            JobType::TestSmoke => write!(f, "test_smoke"),
            JobType::Workflow => write!(f, "workflow"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Dequeued,
    Started,
    Waiting,
    Skipped,
    Canceled,
    Completed,
    Failed,
}

impl JobStage {
    /// Terminal stages are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStage::Skipped | JobStage::Canceled | JobStage::Completed | JobStage::Failed
        )
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStage::Queued => write!(f, "queued"),
            JobStage::Dequeued => write!(f, "dequeued"),
            JobStage::Started => write!(f, "started"),
            JobStage::Waiting => write!(f, "waiting"),
            JobStage::Skipped => write!(f, "skipped"),
            JobStage::Canceled => write!(f, "canceled"),
            JobStage::Completed => write!(f, "completed"),
            JobStage::Failed => write!(f, "failed"),
        }
    }
}

/// v2 workers are capped by the manager; v5 workers are scaled upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerVersion {
    #[default]
    V2,
    V5,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployParams {
    pub component: Component,
    /// Requested deploy target: a commit hash, the "latest" sentinel, or
    /// absent (falls back to the most recent build hash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Image tag override, used by rollbacks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha_tag: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub manual: bool,
    /// Cluster layout generated on first dequeue and probed on every tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<EnvLayout>,
    /// Deployment start, ms since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
}

impl DeployParams {
    pub fn new(component: Component, sha: impl Into<String>) -> Self {
        Self {
            component,
            sha: Some(sha.into()),
            sha_tag: None,
            force: false,
            rollback: false,
            manual: false,
            layout: None,
            start: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnchorParams {
    #[serde(default)]
    pub version: WorkerVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct E2eParams {
    /// Launched suite task ids, keyed by suite configuration.
    #[serde(default)]
    pub tasks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SmokeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub org: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub workflow: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
}

/// Typed per-type parameters. The serialized form is the persisted
/// `type`/`params` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum JobSpec {
    Deploy(DeployParams),
    Anchor(AnchorParams),
    TestE2e(E2eParams),
    TestSmoke(SmokeParams),
    Workflow(WorkflowParams),
}

impl JobSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            JobSpec::Deploy(_) => JobType::Deploy,
            JobSpec::Anchor(_) => JobType::Anchor,
            JobSpec::TestE2e(_) => JobType::TestE2e,
            JobSpec::TestSmoke(_) => JobType::TestSmoke,
            JobSpec::Workflow(_) => JobType::Workflow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub id: String,
    pub stage: JobStage,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub spec: JobSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl JobState {
    /// A freshly queued job with a generated id and the current timestamp.
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stage: JobStage::Queued,
            ts: Utc::now(),
            spec,
            error: None,
            source: None,
        }
    }

    pub fn with_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn job_type(&self) -> JobType {
        self.spec.job_type()
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Active jobs are advanced every tick; Dequeued jobs wait for policy
    /// admission instead.
    pub fn is_active(&self) -> bool {
        matches!(self.stage, JobStage::Started | JobStage::Waiting)
    }

    pub fn is_v5_worker(&self) -> bool {
        matches!(
            &self.spec,
            JobSpec::Anchor(params) if params.version == WorkerVersion::V5
        )
    }

    /// The component a deploy job targets, if this is a deploy job.
    pub fn deploy_component(&self) -> Option<Component> {
        match &self.spec {
            JobSpec::Deploy(params) => Some(params.component),
            _ => None,
        }
    }

    pub fn is_force_deploy(&self) -> bool {
        matches!(&self.spec, JobSpec::Deploy(params) if params.force)
    }
}

pub fn is_timed_out(state: &JobState, window: TimeDelta) -> bool {
    Utc::now() - state.ts > window
}

/// Capability handles shared by the state machines and the scheduler.
#[derive(Clone)]
pub struct JobContext {
    pub env: EnvType,
    pub store: Arc<dyn Store>,
    pub deployment: Arc<dyn Deployment>,
    pub repo: Arc<dyn Repository>,
    pub notifier: Arc<dyn Notifier>,
    pub cache: Arc<JobCache>,
}

/// Advance a job one step through its per-type state machine.
pub async fn advance(ctx: &JobContext, state: JobState) -> Result<JobState> {
    match state.spec {
        JobSpec::Deploy(_) => deploy::advance(ctx, state).await,
        JobSpec::Anchor(_) => anchor::advance(ctx, state).await,
        JobSpec::TestE2e(_) => e2e::advance(ctx, state).await,
        JobSpec::TestSmoke(_) => smoke::advance(ctx, state).await,
        JobSpec::Workflow(_) => workflow::advance(ctx, state).await,
    }
}

/// Move a job to a new stage: persist first, then publish to the cache, then
/// notify. Waiting transitions are polling progress and stay silent.
pub async fn transition(
    ctx: &JobContext,
    mut state: JobState,
    stage: JobStage,
    error: Option<String>,
) -> Result<JobState> {
    state.stage = stage;
    state.ts = Utc::now();
    if error.is_some() {
        state.error = error;
    }
    ctx.store.advance_job(&state).await?;
    ctx.cache.write_job(&state);
    if !matches!(stage, JobStage::Waiting) {
        ctx.notifier.notify_job(&state).await;
    }
    Ok(state)
}
