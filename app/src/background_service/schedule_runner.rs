use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use domain::service::{BackgroundService, RunJobService};
use tokio::time::interval;

use crate::infrastructure::service::controller::JobController;

/// Fixed-interval schedule frontend: ticks once a minute and enqueues every
/// job whose cadence has elapsed. External schedulers invoke `RunJob` on
/// their own cadence instead.
pub struct ScheduleRunner {
    controller: Arc<JobController>,
    tick: Duration,
}

#[async_trait::async_trait]
impl BackgroundService for ScheduleRunner {
    async fn run(&self) {
        let mut interval = interval(self.tick);
        loop {
            interval.tick().await;
            for id in self.controller.jobs_due(Utc::now()) {
                if let Err(e) = self.controller.run_job(id).await {
                    tracing::error!(job = %id, "Scheduled run failed to enqueue: {e}");
                }
            }
        }
    }
}

impl ScheduleRunner {
    pub fn new(controller: Arc<JobController>, tick_secs: u64) -> Self {
        Self {
            controller,
            tick: Duration::from_secs(tick_secs),
        }
    }
}
