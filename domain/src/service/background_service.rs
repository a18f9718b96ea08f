/// A long-running task spawned at startup and aborted on shutdown.
#[async_trait::async_trait]
pub trait BackgroundService {
    async fn run(&self);
}
