//! Smoke test job state machine: a single task in the QA cluster, same arc as
//! the E2E suites.

use std::collections::HashMap;

use crate::error::{ManagerError, Result};
use crate::job::{
    default_failure_time, is_timed_out, transition, JobContext, JobSpec, JobStage, JobState,
    ERROR_TIMEOUT,
};

const CLUSTER: &str = "ceramic-qa-tests";
const SERVICE: &str = "ceramic-qa-tests-smoke_tests";
const FAMILY: &str = "ceramic-qa-tests-smoke_tests";
const CONTAINER: &str = "smoke_tests";

pub async fn advance(ctx: &JobContext, state: JobState) -> Result<JobState> {
    match state.stage {
        JobStage::Queued => transition(ctx, state, JobStage::Dequeued, None).await,
        _ if is_timed_out(&state, default_failure_time()) => {
            tracing::warn!(job_id = %state.id, "Smoke test job timed out");
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
    let JobSpec::TestSmoke(mut params) = state.spec.clone() else {
        unreachable!("smoke machine invoked for non-smoke job");
    };
    let overrides = HashMap::from([("NODE_ENV".to_string(), ctx.env.as_str().to_string())]);
    match ctx
        .deployment
        .launch_service(CLUSTER, SERVICE, FAMILY, CONTAINER, &overrides)
        .await
    {
        Ok(task_id) => {
            params.task_id = Some(task_id);
            state.spec = JobSpec::TestSmoke(params);
            transition(ctx, state, JobStage::Started, None).await
        }
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error launching smoke tests");
            transition(ctx, state, JobStage::Failed, Some(e.to_string())).await
        }
    }
}

async fn check(
    ctx: &JobContext,
    state: JobState,
    running: bool,
    next: JobStage,
) -> Result<JobState> {
    let JobSpec::TestSmoke(params) = &state.spec else {
        unreachable!("smoke machine invoked for non-smoke job");
    };
    let Some(task_id) = params.task_id.clone() else {
        let e = ManagerError::MissingTaskId(state.id.clone());
        return transition(ctx, state, JobStage::Failed, Some(e.to_string())).await;
    };
    match ctx
        .deployment
        .check_task(running, CLUSTER, &[task_id])
        .await
    {
        Ok(true) => transition(ctx, state, next, None).await,
        Ok(false) => Ok(state),
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error checking smoke test task");
            transition(ctx, state, JobStage::Failed, Some(e.to_string())).await
        }
    }
}
