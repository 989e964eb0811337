//! Anchor worker job state machine: one containerized worker task in the CAS
//! cluster, polled from running through stopped.

use std::collections::HashMap;

use crate::error::{ManagerError, Result};
use crate::job::{
    default_failure_time, is_timed_out, transition, JobContext, JobSpec, JobStage, JobState,
    WorkerVersion, ERROR_TIMEOUT,
};

const CONTAINER: &str = "cas_anchor";

pub async fn advance(ctx: &JobContext, state: JobState) -> Result<JobState> {
    match state.stage {
        JobStage::Queued => transition(ctx, state, JobStage::Dequeued, None).await,
        _ if is_timed_out(&state, default_failure_time()) => {
            tracing::warn!(job_id = %state.id, "Anchor job timed out");
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
    let JobSpec::Anchor(mut params) = state.spec.clone() else {
        unreachable!("anchor machine invoked for non-anchor job");
    };
    let cluster = crate::deployment::cas_cluster(ctx.env);
    let family = match params.version {
        WorkerVersion::V2 => format!("{cluster}-anchor"),
        WorkerVersion::V5 => format!("ceramic-{}-casv5-anchor", ctx.env),
    };
    let vpc_config_param = format!("/{cluster}/vpc-config");
    match ctx
        .deployment
        .launch_task(&cluster, &family, CONTAINER, &vpc_config_param, &HashMap::new())
        .await
    {
        Ok(task_id) => {
            params.task_id = Some(task_id);
            state.spec = JobSpec::Anchor(params);
            transition(ctx, state, JobStage::Started, None).await
        }
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error launching anchor worker");
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
    let JobSpec::Anchor(params) = &state.spec else {
        unreachable!("anchor machine invoked for non-anchor job");
    };
    let Some(task_id) = params.task_id.clone() else {
        let e = ManagerError::MissingTaskId(state.id.clone());
        return transition(ctx, state, JobStage::Failed, Some(e.to_string())).await;
    };
    let cluster = crate::deployment::cas_cluster(ctx.env);
    match ctx
        .deployment
        .check_task(running, &cluster, &[task_id])
        .await
    {
        Ok(true) => transition(ctx, state, next, None).await,
        Ok(false) => Ok(state),
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error checking anchor worker task");
            transition(ctx, state, JobStage::Failed, Some(e.to_string())).await
        }
    }
}
