mod background_service;
mod config;
mod dto;
mod infrastructure;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use domain::service::BackgroundService;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use self::background_service::{
    CataloguePersistRunner, FileSystemWatchRunner, QueueRunner, ScheduleRunner,
};
use self::config::AgentConfig;
use self::infrastructure::database::JsonDb;
use self::infrastructure::http::middleware::{AuthMiddleware, MiddlewareMenu};
use self::infrastructure::service::controller::JobController;
use self::infrastructure::service::drive::DriveClient;
use self::infrastructure::service::mount::MountManager;
use self::infrastructure::service::token::TokenCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let agent_config: AgentConfig =
        config::build_config().with_context(|| "Failed to build config")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let db = Arc::new(JsonDb::new(&agent_config.state_dir).await?);
    let token_cache =
        TokenCache::init_global(agent_config.auth_server.clone(), db.clone());

    // A seed refresh token from the config file bootstraps the rotation.
    if let Some(refresh_token) = &agent_config.refresh_token {
        token_cache.seed_credentials(&agent_config.drive_config_id, refresh_token).await?;
    }

    let auth = Arc::new(AuthMiddleware::new(
        token_cache.clone(),
        &agent_config.drive_config_id,
    ));
    let http = MiddlewareMenu::builder()
        .retries(3)
        .auth(auth)
        .timeout(Duration::from_secs(agent_config.request_timeout))
        .build()
        .make();
    let client = Arc::new(
        DriveClient::builder()
            .base_url(agent_config.api_server.clone())
            .drive_id(agent_config.drive_id.clone())
            .client(http)
            .build(),
    );

    match client.drive_info().await {
        Ok(info) => tracing::info!(drive = %info.name, user = %info.user_id, "Drive connected"),
        Err(e) => tracing::warn!("Drive info unavailable at startup: {e}"),
    }
    if let Ok(space) = client.space_info().await {
        tracing::info!(used = space.used_size, total = space.total_size, "Drive space");
    }
    if let Ok(vip) = client.vip_info().await {
        tracing::info!(identity = %vip.identity, "Account tier");
    }

    let options = config::load_options(&agent_config.state_dir).await;
    let controller = Arc::new(
        JobController::builder()
            .store(db.clone())
            .token_cache(token_cache.clone())
            .client(client.clone())
            .drive_config_id(agent_config.drive_config_id.clone())
            .cache_dir(agent_config.cache_dir.clone().into())
            .part_size(agent_config.upload_part_size.as_u64())
            .build(),
    );
    for raw in &agent_config.jobs {
        let mut job = match config::parse_job(raw) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("Skipping job: {e:#}");
                continue;
            }
        };
        if job.parallelism.is_none() {
            job.parallelism = options.parallelism;
        }
        let name = job.name.clone();
        if let Err(e) = controller.register(job).await {
            tracing::error!(job = %name, "Skipping job that failed to register: {e:#}");
        }
    }

    let _mounts = Arc::new(
        MountManager::builder()
            .controller(controller.clone())
            .client(client.clone())
            .token_cache(token_cache)
            .drive_config_id(agent_config.drive_config_id.clone())
            .cache_dir(agent_config.cache_dir.clone().into())
            .build(),
    );

    let shutdown = CancellationToken::new();
    let services: Vec<Arc<dyn BackgroundService + Send + Sync>> = vec![
        Arc::new(QueueRunner::new(controller.clone())),
        Arc::new(CataloguePersistRunner::new(controller.clone(), shutdown.clone())),
        Arc::new(ScheduleRunner::new(controller.clone(), agent_config.schedule_tick)),
        Arc::new(FileSystemWatchRunner::new(controller.clone())),
    ];
    let handles: Vec<_> = services
        .into_iter()
        .map(|service| tokio::spawn(async move { service.run().await }))
        .collect();
    tracing::info!("Drive agent started.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Stopping services (ctrl-c handling).");
    shutdown.cancel();
    controller.flush_catalogues().await;
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
