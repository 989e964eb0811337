//! Source-control and workflow-invocation contract.

use async_trait::async_trait;

use crate::deployment::Component;
use crate::error::Result;
use crate::job::WorkflowParams;

/// Reported status of an invoked workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Queued,
    InProgress,
    Success,
    Failure,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Head commit hash of a branch.
    async fn latest_commit_hash(&self, repo: &str, branch: &str) -> Result<String>;

    /// Invoke a workflow; returns the run id to poll.
    async fn start_workflow(&self, params: &WorkflowParams) -> Result<u64>;

    async fn workflow_status(&self, params: &WorkflowParams, run_id: u64) -> Result<WorkflowStatus>;
}

/// Source repository holding a component's code.
pub fn component_repo(component: Component) -> &'static str {
    match component {
        Component::Ceramic => "js-ceramic",
        Component::Ipfs => "go-ipfs-daemon",
        Component::Cas => "ceramic-anchor-service",
    }
}

/// A full-length lowercase hex commit hash.
pub fn is_valid_sha(sha: &str) -> bool {
    sha.len() == 40 && sha.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
