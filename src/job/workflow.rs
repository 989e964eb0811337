//! Workflow job state machine: invoke the external workflow endpoint, then
//! poll the reported run status to a terminal stage.

use crate::error::{ManagerError, Result};
use crate::job::{
    default_failure_time, is_timed_out, transition, JobContext, JobSpec, JobStage, JobState,
    ERROR_TIMEOUT,
};
use crate::repo::WorkflowStatus;

pub async fn advance(ctx: &JobContext, state: JobState) -> Result<JobState> {
    match state.stage {
        JobStage::Queued => transition(ctx, state, JobStage::Dequeued, None).await,
        _ if is_timed_out(&state, default_failure_time()) => {
            tracing::warn!(job_id = %state.id, "Workflow job timed out");
            transition(ctx, state, JobStage::Failed, Some(ERROR_TIMEOUT.to_string())).await
        }
        JobStage::Dequeued => start(ctx, state).await,
        JobStage::Started => check(ctx, state).await,
        stage => Err(ManagerError::UnexpectedStage {
            id: state.id.clone(),
            job_type: state.job_type().to_string(),
            stage: stage.to_string(),
        }),
    }
}

async fn start(ctx: &JobContext, mut state: JobState) -> Result<JobState> {
    let JobSpec::Workflow(mut params) = state.spec.clone() else {
        unreachable!("workflow machine invoked for non-workflow job");
    };
    match ctx.repo.start_workflow(&params).await {
        Ok(run_id) => {
            params.run_id = Some(run_id);
            state.spec = JobSpec::Workflow(params);
            transition(ctx, state, JobStage::Started, None).await
        }
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error starting workflow");
            transition(ctx, state, JobStage::Failed, Some(e.to_string())).await
        }
    }
}

async fn check(ctx: &JobContext, state: JobState) -> Result<JobState> {
    let JobSpec::Workflow(params) = &state.spec else {
        unreachable!("workflow machine invoked for non-workflow job");
    };
    let Some(run_id) = params.run_id else {
        let e = ManagerError::MissingTaskId(state.id.clone());
        return transition(ctx, state, JobStage::Failed, Some(e.to_string())).await;
    };
    match ctx.repo.workflow_status(params, run_id).await {
        Ok(WorkflowStatus::Success) => transition(ctx, state, JobStage::Completed, None).await,
        Ok(WorkflowStatus::Failure) => {
            transition(
                ctx,
                state,
                JobStage::Failed,
                Some("workflow run failed".to_string()),
            )
            .await
        }
        Ok(WorkflowStatus::Queued | WorkflowStatus::InProgress) => Ok(state),
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error checking workflow status");
            transition(ctx, state, JobStage::Failed, Some(e.to_string())).await
        }
    }
}
