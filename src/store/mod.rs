//! Durable store contract: the job queue, ordered stage views, and the
//! per-component hash/tag maps.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::deployment::Component;
use crate::error::Result;
use crate::job::{JobStage, JobState, JobType};

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a freshly queued job.
    async fn queue_job(&self, state: JobState) -> Result<()>;

    /// Queued jobs whose timestamp has come due (`ts <= now`), FIFO by `ts`.
    /// Jobs queued with a future timestamp stay parked until then.
    async fn queued_jobs(&self) -> Result<Vec<JobState>>;

    /// All jobs in the given stage, FIFO by `ts`.
    async fn ordered_jobs(&self, stage: JobStage) -> Result<Vec<JobState>>;

    /// Visit jobs of one type ordered by `ts`; the visitor returns `false` to
    /// stop early.
    async fn iterate_by_type(
        &self,
        job_type: JobType,
        ascending: bool,
        visitor: &mut (dyn FnMut(JobState) -> bool + Send),
    ) -> Result<()>;

    /// Atomically replace the persisted record for this job id.
    async fn advance_job(&self, state: &JobState) -> Result<()>;

    /// Component -> most recent hash with a started deployment.
    async fn build_hashes(&self) -> Result<HashMap<Component, String>>;

    /// Component -> most recent hash with a completed deployment.
    async fn deploy_hashes(&self) -> Result<HashMap<Component, String>>;

    /// Component -> most recent deployed image tag.
    async fn deploy_tags(&self) -> Result<HashMap<Component, String>>;

    async fn update_build_hash(&self, component: Component, sha: &str) -> Result<()>;

    async fn update_deploy_hash(&self, component: Component, sha: &str) -> Result<()>;

    async fn update_deploy_tag(&self, component: Component, tag: &str) -> Result<()>;
}
