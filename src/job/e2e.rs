//! End-to-end test job state machine: three parameterized suites launched as
//! separate tasks in the QA cluster, polled together through running and
//! stopped.

use std::collections::HashMap;

use chrono::TimeDelta;

use crate::error::{ManagerError, Result};
use crate::job::{
    is_timed_out, transition, JobContext, JobSpec, JobStage, JobState, ERROR_TIMEOUT,
};

pub const E2E_TEST_PRIVATE_PUBLIC: &str = "private-public";
pub const E2E_TEST_LOCAL_CLIENT_PUBLIC: &str = "local_client-public";
pub const E2E_TEST_LOCAL_NODE_PRIVATE: &str = "local_node-private";

pub const E2E_SUITES: [&str; 3] = [
    E2E_TEST_PRIVATE_PUBLIC,
    E2E_TEST_LOCAL_CLIENT_PUBLIC,
    E2E_TEST_LOCAL_NODE_PRIVATE,
];

const CLUSTER: &str = "ceramic-qa-tests";
const SERVICE: &str = "ceramic-qa-tests-e2e_tests";
const FAMILY: &str = "ceramic-qa-tests-e2e_tests";
const CONTAINER: &str = "e2e_tests";

/// E2E suites get a longer window than other jobs.
pub fn failure_time() -> TimeDelta {
    TimeDelta::hours(2)
}

pub async fn advance(ctx: &JobContext, state: JobState) -> Result<JobState> {
    match state.stage {
        JobStage::Queued => transition(ctx, state, JobStage::Dequeued, None).await,
        _ if is_timed_out(&state, failure_time()) => {
            tracing::warn!(job_id = %state.id, "E2E test job timed out");
            transition(ctx, state, JobStage::Failed, Some(ERROR_TIMEOUT.to_string())).await
        }
        JobStage::Dequeued => start(ctx, state).await,
        JobStage::Started => check(ctx, state, true, JobStage::Waiting).await,
        JobStage::Waiting => check(ctx, state, false, JobStage::Completed).await,
        stage => Err(ManagerError::UnexpectedStage {
            id: state.id.clone(),
            job_type: state.job_type().to_string(),
            stage: stage.to_string(),
        }),
    }
}

async fn start(ctx: &JobContext, mut state: JobState) -> Result<JobState> {
    let JobSpec::TestE2e(mut params) = state.spec.clone() else {
        unreachable!("e2e machine invoked for non-e2e job");
    };
    for suite in E2E_SUITES {
        let overrides = HashMap::from([("NODE_ENV".to_string(), suite.to_string())]);
        match ctx
            .deployment
            .launch_service(CLUSTER, SERVICE, FAMILY, CONTAINER, &overrides)
            .await
        {
            Ok(task_id) => {
                params.tasks.insert(suite.to_string(), task_id);
            }
            Err(e) => {
                tracing::warn!(job_id = %state.id, suite, error = %e, "Error launching e2e test suite");
                state.spec = JobSpec::TestE2e(params);
                return transition(ctx, state, JobStage::Failed, Some(e.to_string())).await;
            }
        }
    }
    state.spec = JobSpec::TestE2e(params);
    transition(ctx, state, JobStage::Started, None).await
}

/// Poll all three suites for the desired status; advance only when every one
/// of them matches.
async fn check(
    ctx: &JobContext,
    state: JobState,
    running: bool,
    next: JobStage,
) -> Result<JobState> {
    let JobSpec::TestE2e(params) = &state.spec else {
        unreachable!("e2e machine invoked for non-e2e job");
    };
    let task_ids: Vec<String> = params.tasks.values().cloned().collect();
    match ctx.deployment.check_task(running, CLUSTER, &task_ids).await {
        Ok(true) => transition(ctx, state, next, None).await,
        Ok(false) => Ok(state),
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error checking e2e test tasks");
            transition(ctx, state, JobStage::Failed, Some(e.to_string())).await
        }
    }
}
