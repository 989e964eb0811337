use std::collections::HashMap;
use std::sync::Mutex;

use crate::job::JobState;

/// In-memory index of active and recently finished jobs, keyed by job id.
///
/// Advancement tasks are the only writers (one per job per tick); readers get
/// snapshot copies, so a slightly stale view is acceptable.
#[derive(Debug, Default)]
pub struct JobCache {
    jobs: Mutex<HashMap<String, JobState>>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_job(&self, state: &JobState) {
        self.jobs
            .lock()
            .unwrap()
            .insert(state.id.clone(), state.clone());
    }

    pub fn delete_job(&self, id: &str) {
        self.jobs.lock().unwrap().remove(id);
    }

    pub fn job_by_id(&self, id: &str) -> Option<JobState> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    /// Snapshot of every cached job matching the predicate.
    pub fn jobs_by_matcher(&self, matcher: impl Fn(&JobState) -> bool) -> Vec<JobState> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|js| matcher(js))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().unwrap().is_empty()
    }
}
