use uuid::Uuid;

/// Mount lifecycle, driven by the external runner. The filesystem callback
/// surface itself lives with the adapter implementation.
#[async_trait::async_trait]
pub trait MountService: Send + Sync {
    async fn mount(&self, job_id: Uuid) -> anyhow::Result<()>;
    async fn unmount(&self, job_id: Uuid) -> anyhow::Result<()>;
}
