use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::deployment::Component;
use crate::error::Result;
use crate::job::{JobStage, JobState, JobType};
use crate::store::Store;

/// In-process store used by the test suite and local runs.
///
/// Records are held in their persisted form (the open `type`/`params` map),
/// so every read and write round-trips the typed job model the same way a
/// durable store would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, Value>,
    build_hashes: HashMap<Component, String>,
    deploy_hashes: HashMap<Component, String>,
    deploy_tags: HashMap<Component, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_by_id(&self, id: &str) -> Option<JobState> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(id)
            .and_then(|record| serde_json::from_value(record.clone()).ok())
    }

    pub fn all_jobs(&self) -> Vec<JobState> {
        let mut jobs = self.decode_jobs(|_| true);
        jobs.sort_by(|a, b| a.ts.cmp(&b.ts));
        jobs
    }

    fn decode_jobs(&self, filter: impl Fn(&JobState) -> bool) -> Vec<JobState> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter_map(|record| serde_json::from_value::<JobState>(record.clone()).ok())
            .filter(|js| filter(js))
            .collect()
    }

    fn write(&self, state: &JobState) -> Result<()> {
        let record = serde_json::to_value(state)?;
        self.inner
            .lock()
            .unwrap()
            .jobs
            .insert(state.id.clone(), record);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn queue_job(&self, state: JobState) -> Result<()> {
        self.write(&state)
    }

    async fn queued_jobs(&self) -> Result<Vec<JobState>> {
        let now = Utc::now();
        let mut jobs = self.decode_jobs(|js| js.stage == JobStage::Queued && js.ts <= now);
        jobs.sort_by(|a, b| a.ts.cmp(&b.ts));
        Ok(jobs)
    }

    async fn ordered_jobs(&self, stage: JobStage) -> Result<Vec<JobState>> {
        let mut jobs = self.decode_jobs(|js| js.stage == stage);
        jobs.sort_by(|a, b| a.ts.cmp(&b.ts));
        Ok(jobs)
    }

    async fn iterate_by_type(
        &self,
        job_type: JobType,
        ascending: bool,
        visitor: &mut (dyn FnMut(JobState) -> bool + Send),
    ) -> Result<()> {
        let mut jobs = self.decode_jobs(|js| js.job_type() == job_type);
        jobs.sort_by(|a, b| a.ts.cmp(&b.ts));
        if !ascending {
            jobs.reverse();
        }
        for job in jobs {
            if !visitor(job) {
                break;
            }
        }
        Ok(())
    }

    async fn advance_job(&self, state: &JobState) -> Result<()> {
        self.write(state)
    }

    async fn build_hashes(&self) -> Result<HashMap<Component, String>> {
        Ok(self.inner.lock().unwrap().build_hashes.clone())
    }

    async fn deploy_hashes(&self) -> Result<HashMap<Component, String>> {
        Ok(self.inner.lock().unwrap().deploy_hashes.clone())
    }

    async fn deploy_tags(&self) -> Result<HashMap<Component, String>> {
        Ok(self.inner.lock().unwrap().deploy_tags.clone())
    }

    async fn update_build_hash(&self, component: Component, sha: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .build_hashes
            .insert(component, sha.to_string());
        Ok(())
    }

    async fn update_deploy_hash(&self, component: Component, sha: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .deploy_hashes
            .insert(component, sha.to_string());
        Ok(())
    }

    async fn update_deploy_tag(&self, component: Component, tag: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .deploy_tags
            .insert(component, tag.to_string());
        Ok(())
    }
}
