//! Deploy job state machine.
//!
//! First dequeue resolves the effective commit hash and pins the cluster
//! layout into the job record; the same layout is then applied and probed on
//! every subsequent tick.

use chrono::Utc;

use crate::deployment::Component;
use crate::error::{ManagerError, Result};
use crate::job::{
    default_failure_time, is_timed_out, transition, DeployParams, JobContext, JobSpec, JobStage,
    JobState, ERROR_TIMEOUT,
};
use crate::repo::{component_repo, is_valid_sha};

/// Sentinel deploy target: deploy the branch head for this environment.
pub const SHA_LATEST: &str = "latest";

pub async fn advance(ctx: &JobContext, state: JobState) -> Result<JobState> {
    match state.stage {
        JobStage::Queued => dequeue(ctx, state).await,
        _ if is_timed_out(&state, default_failure_time()) => {
            tracing::warn!(job_id = %state.id, "Deploy job timed out");
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

/// Queued step: resolve the effective SHA, generate the layout, move to
/// Dequeued. Failures here are validation/lookup failures and fail the job.
async fn dequeue(ctx: &JobContext, mut state: JobState) -> Result<JobState> {
    let JobSpec::Deploy(mut params) = state.spec.clone() else {
        unreachable!("deploy machine invoked for non-deploy job");
    };
    match prepare(ctx, &mut params).await {
        Ok(()) => {
            state.spec = JobSpec::Deploy(params);
            transition(ctx, state, JobStage::Dequeued, None).await
        }
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Deploy job preprocessing failed");
            transition(ctx, state, JobStage::Failed, Some(e.to_string())).await
        }
    }
}

async fn prepare(ctx: &JobContext, params: &mut DeployParams) -> Result<()> {
    if params.layout.is_some() {
        // Already preprocessed on an earlier dequeue.
        return Ok(());
    }
    let component = params.component;
    let resolved = if params.rollback {
        // Roll back to the most recent successfully deployed hash.
        lookup_hash(ctx.store.deploy_hashes().await?, component)?
    } else {
        match params.sha.as_deref() {
            Some(SHA_LATEST) => {
                ctx.repo
                    .latest_commit_hash(component_repo(component), ctx.env.branch())
                    .await?
            }
            Some(sha) if is_valid_sha(sha) => {
                params.manual = true;
                sha.to_string()
            }
            // No usable hash supplied: deploy the most recent build.
            _ => {
                params.manual = true;
                lookup_hash(ctx.store.build_hashes().await?, component)?
            }
        }
    };
    params.sha = Some(resolved);
    params.layout = Some(ctx.deployment.generate_env_layout(component)?);
    Ok(())
}

fn lookup_hash(
    hashes: std::collections::HashMap<Component, String>,
    component: Component,
) -> Result<String> {
    hashes
        .get(&component)
        .cloned()
        .ok_or_else(|| ManagerError::MissingHash(component.to_string()))
}

/// Dequeued step: skip automated deploys of the already-deployed hash,
/// otherwise apply the layout and mark the deployment started.
async fn start(ctx: &JobContext, mut state: JobState) -> Result<JobState> {
    let JobSpec::Deploy(mut params) = state.spec.clone() else {
        unreachable!("deploy machine invoked for non-deploy job");
    };
    let component = params.component;
    let deploy_hashes = match ctx.store.deploy_hashes().await {
        Ok(hashes) => hashes,
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error fetching deploy hashes");
            return transition(ctx, state, JobStage::Failed, Some(e.to_string())).await;
        }
    };
    let sha = params.sha.clone().unwrap_or_default();
    // A rollback's target is the recorded deploy hash by construction, and a
    // manual redeploy of it may be intentional; only automated deploys skip.
    if !params.manual && !params.rollback && deploy_hashes.get(&component) == Some(&sha) {
        tracing::info!(job_id = %state.id, %component, sha, "Commit hash same as deployed hash");
        return transition(ctx, state, JobStage::Skipped, None).await;
    }
    let Some(mut layout) = params.layout.clone() else {
        let e = ManagerError::MissingLayout(state.id.clone());
        return transition(ctx, state, JobStage::Failed, Some(e.to_string())).await;
    };
    let tag = params.sha_tag.clone().unwrap_or_else(|| sha.clone());
    if let Err(e) = ctx.deployment.update_env(&mut layout, &tag).await {
        tracing::warn!(job_id = %state.id, error = %e, "Error updating services");
        return transition(ctx, state, JobStage::Failed, Some(e.to_string())).await;
    }
    params.layout = Some(layout);
    params.start = Some(Utc::now().timestamp_millis());
    state.spec = JobSpec::Deploy(params);
    // Best-effort: record the build hash for started deployments.
    if let Err(e) = ctx.store.update_build_hash(component, &sha).await {
        tracing::warn!(job_id = %state.id, error = %e, "Failed to update build hash");
    }
    transition(ctx, state, JobStage::Started, None).await
}

/// Started step: probe the layout until every service update has settled.
async fn check(ctx: &JobContext, state: JobState) -> Result<JobState> {
    let JobSpec::Deploy(params) = &state.spec else {
        unreachable!("deploy machine invoked for non-deploy job");
    };
    let component = params.component;
    let sha = params.sha.clone().unwrap_or_default();
    let Some(layout) = params.layout.clone() else {
        let e = ManagerError::MissingLayout(state.id.clone());
        return transition(ctx, state, JobStage::Failed, Some(e.to_string())).await;
    };
    match check_deployed(ctx, component, &layout).await {
        Err(e) => {
            tracing::warn!(job_id = %state.id, error = %e, "Error checking service status");
            transition(ctx, state, JobStage::Failed, Some(e.to_string())).await
        }
        Ok(false) => Ok(state),
        Ok(true) => {
            // Best-effort: record the deploy hash for completed deployments.
            if let Err(e) = ctx.store.update_deploy_hash(component, &sha).await {
                tracing::warn!(job_id = %state.id, error = %e, "Failed to update deploy hash");
            }
            transition(ctx, state, JobStage::Completed, None).await
        }
    }
}

async fn check_deployed(
    ctx: &JobContext,
    component: Component,
    layout: &crate::deployment::EnvLayout,
) -> Result<bool> {
    let deployed = ctx.deployment.check_env(layout).await?;
    if !deployed || component != Component::Ipfs {
        return Ok(deployed);
    }
    // After IPFS settles, also require stable Ceramic tasks. Any running
    // version is acceptable here, so the layout is rebuilt on the fly rather
    // than read from the job record.
    let ceramic_layout = ctx.deployment.generate_env_layout(Component::Ceramic)?;
    ctx.deployment.check_env(&ceramic_layout).await
}
