use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use domain::service::BackgroundService;
use infrastructure::sync::timer;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::service::controller::JobController;

const PERSIST_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Flushes every catalogue's snapshot diff to the keyed store every five
/// minutes.
pub struct CataloguePersistRunner {
    controller: Arc<JobController>,
    shutdown: CancellationToken,
}

#[async_trait::async_trait]
impl BackgroundService for CataloguePersistRunner {
    async fn run(&self) {
        let controller = self.controller.clone();
        timer::run(PERSIST_INTERVAL, self.shutdown.clone(), move || {
            let controller = controller.clone();
            async move {
                controller.flush_catalogues().await;
                ControlFlow::<()>::Continue(())
            }
        })
        .await;
    }
}

impl CataloguePersistRunner {
    pub fn new(controller: Arc<JobController>, shutdown: CancellationToken) -> Self {
        Self {
            controller,
            shutdown,
        }
    }
}
