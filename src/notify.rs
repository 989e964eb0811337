use async_trait::async_trait;

use crate::job::JobState;

/// Fire-and-forget emission of stage transitions. Implementations swallow and
/// log transport failures; a dropped notification never fails a job.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_job(&self, state: &JobState);
}

/// Notifier that reports transitions through the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_job(&self, state: &JobState) {
        tracing::info!(
            job_id = %state.id,
            job_type = %state.job_type(),
            stage = %state.stage,
            error = state.error.as_deref().unwrap_or(""),
            "Job transition"
        );
    }
}
