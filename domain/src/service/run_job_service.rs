use uuid::Uuid;

use crate::model::entity::job::{JobState, RunResult};
use crate::model::vo::config::JobConfig;

/// The boundary the external runner drives: queue a run, edit a job,
/// or force a state change (pause, resume, cancel, disable, enable).
#[async_trait::async_trait]
pub trait RunJobService: Send + Sync {
    /// Enqueue the job on the global queue. Re-enqueueing a job that is
    /// already queued or running restarts it.
    async fn run_job(&self, id: Uuid) -> anyhow::Result<()>;

    async fn update_job(&self, config: JobConfig) -> anyhow::Result<()>;

    async fn change_state(&self, id: Uuid, to: JobState) -> anyhow::Result<()>;

    async fn last_result(&self, id: Uuid) -> Option<RunResult>;
}
