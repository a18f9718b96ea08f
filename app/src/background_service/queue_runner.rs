use std::sync::Arc;

use domain::service::BackgroundService;

use crate::infrastructure::service::controller::JobController;

/// Consumes the global job queue; exactly one job executes at a time.
pub struct QueueRunner {
    controller: Arc<JobController>,
}

#[async_trait::async_trait]
impl BackgroundService for QueueRunner {
    async fn run(&self) {
        self.controller.serve_queue().await;
    }
}

impl QueueRunner {
    pub fn new(controller: Arc<JobController>) -> Self {
        Self { controller }
    }
}
