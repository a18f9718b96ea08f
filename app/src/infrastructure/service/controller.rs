//! Job lifecycle: the state machine, the run pipeline (scan → plan →
//! execute → verify), queue binding, and online watcher updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use infrastructure::sync::PauseToken;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use domain::model::entity::{
    ActionKind, Direction, Job, JobState, LocalEntry, PlanAction, RemoteEntry, RunResult,
    Statistics,
};
use domain::model::vo::config::{JobConfig, SyncMode, TargetOptions};
use domain::repository::KeyedStore;
use domain::service::RunJobService;
use domain::SyncError;
use service::{Catalogue, EnqueueOutcome, JobQueue, Plan, PlanInput, Planner};

use super::crypto::CryptoPipeline;
use super::download_file::DownloadFileService;
use super::drive::DriveClient;
use super::executor::{ExecutionReport, Executor, Progress};
use super::scanner::{IgnoreFilter, Scanner};
use super::target::{DriveTarget, SyncTarget};
use super::token::TokenCache;
use super::upload_file::UploadFileService;
use crate::dto::{FileItem, ItemKind};

/// One filesystem watcher notification, already classified.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
    /// The pre-rename path, for renames.
    pub old_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Change,
    Rename,
    Delete,
}

struct RunHandle {
    pause: PauseToken,
    cancel: CancellationToken,
}

#[derive(TypedBuilder)]
pub struct JobController {
    store: Arc<dyn KeyedStore>,
    token_cache: Arc<TokenCache>,
    client: Arc<DriveClient>,
    drive_config_id: String,
    /// Scratch area for sealed envelopes and download temp files.
    cache_dir: PathBuf,
    #[builder(default = 16 * 1024 * 1024)]
    part_size: u64,
    #[builder(default)]
    jobs: DashMap<Uuid, Job>,
    #[builder(default)]
    catalogues: DashMap<Uuid, Arc<Catalogue>>,
    #[builder(default)]
    running: DashMap<Uuid, RunHandle>,
    #[builder(default)]
    results: DashMap<Uuid, RunResult>,
}

impl JobController {
    /// Register a job and bring it to `Idle`, loading its catalogue.
    pub async fn register(&self, config: JobConfig) -> anyhow::Result<()> {
        config.validate()?;
        let id = config.id;

        let catalogue = Arc::new(Catalogue::new(id));
        let loaded = catalogue.load(&*self.store).await?;
        tracing::info!(job = %config.name, loaded, "Catalogue rehydrated");
        self.catalogues.insert(id, catalogue);

        let mut job = Job::new(config);
        job.state = JobState::Idle;
        self.jobs.insert(id, job);
        Ok(())
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|kv| *kv.key()).collect()
    }

    pub fn job_config(&self, id: Uuid) -> Option<JobConfig> {
        self.jobs.get(&id).map(|job| job.config.clone())
    }

    pub fn job_state(&self, id: Uuid) -> Option<JobState> {
        self.jobs.get(&id).map(|job| job.state)
    }

    pub fn catalogue(&self, id: Uuid) -> Option<Arc<Catalogue>> {
        self.catalogues.get(&id).map(|kv| kv.value().clone())
    }

    /// Jobs whose fixed-interval schedule has elapsed and that are free to
    /// run again.
    pub fn jobs_due(&self, now: chrono::DateTime<Utc>) -> Vec<Uuid> {
        self.jobs
            .iter()
            .filter(|kv| {
                let job = kv.value();
                let Some(interval) = job.config.interval_secs else { return false };
                if !job.state.can_transition(JobState::Queued) {
                    return false;
                }
                match job.metadata.last_run {
                    Some(last) => (now - last).num_seconds() >= interval as i64,
                    None => true,
                }
            })
            .map(|kv| *kv.key())
            .collect()
    }

    /// Rebuild one job's remote maps from a fresh listing, e.g. at mount.
    pub async fn refresh_remote(&self, id: Uuid) -> anyhow::Result<()> {
        let config = self.job_config(id).context("unknown job")?;
        let catalogue = self.catalogue(id).context("job has no catalogue")?;
        if let TargetOptions::CloudDrive { save_root, .. } = &config.target {
            self.refresh_remote_listing(save_root, &catalogue).await?;
        }
        Ok(())
    }

    /// Periodic snapshot flush, also invoked on demand.
    pub async fn flush_catalogues(&self) {
        for entry in self.catalogues.iter() {
            match entry.value().persist(&*self.store).await {
                Ok(0) => {}
                Ok(changed) => tracing::debug!(job = %entry.key(), changed, "Catalogue persisted"),
                Err(e) => tracing::error!(job = %entry.key(), "Catalogue persist failed: {e}"),
            }
        }
    }

    /// The queue consumer: runs exactly one job at a time, forever.
    pub async fn serve_queue(&self) {
        let queue = JobQueue::global();
        loop {
            let id = queue.dequeue().await;
            let cancel = queue.begin(id).await;
            if let Err(e) = self.run_instance(id, cancel).await {
                tracing::error!(job = %id, "Run failed: {e:#}");
            }
            queue.finish(id).await;
        }
    }

    async fn run_instance(&self, id: Uuid, cancel: CancellationToken) -> anyhow::Result<()> {
        let config = match self.jobs.get(&id) {
            Some(job) if job.state == JobState::Queued => job.config.clone(),
            Some(job) => {
                tracing::debug!(job = %id, state = %job.state, "Skipping dequeued job");
                return Ok(());
            }
            None => return Ok(()),
        };

        if let Err(e) = config.validate() {
            self.set_state(id, JobState::Error);
            return Err(e.into());
        }

        let pause = PauseToken::default();
        self.running.insert(
            id,
            RunHandle {
                pause: pause.clone(),
                cancel: cancel.clone(),
            },
        );

        let started = Utc::now();
        let outcome = self.phases(id, &config, pause, &cancel).await;
        self.running.remove(&id);

        match outcome {
            Ok((plan, stats)) => {
                let state = if stats.errors > 0 { JobState::Error } else { JobState::Idle };
                self.set_state(id, state);
                self.results.insert(
                    id,
                    RunResult {
                        job_id: id,
                        state,
                        plan,
                        stats,
                        started,
                        finished: Utc::now(),
                    },
                );
                tracing::info!(
                    job = %config.name,
                    copied = stats.files_copied,
                    updated = stats.files_updated,
                    deleted = stats.files_deleted,
                    bytes = stats.bytes_processed,
                    errors = stats.errors,
                    "Run finished"
                );
                Ok(())
            }
            Err(e) if cancel.is_cancelled() || matches!(SyncError::of(&e), Some(SyncError::Canceled)) => {
                self.force_state(id, JobState::Cancelled);
                tracing::info!(job = %config.name, "Run cancelled");
                Ok(())
            }
            Err(e) => {
                self.force_state(id, JobState::Error);
                Err(e)
            }
        }
    }

    async fn phases(
        &self,
        id: Uuid,
        config: &JobConfig,
        pause: PauseToken,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(domain::model::entity::PlanSummary, Statistics)> {
        let catalogue = self.catalogue(id).context("job has no catalogue")?;

        self.transition(id, JobState::Scanning)?;
        self.scan_sources(config, &catalogue).await?;

        let save_root = config.target.save_root().to_owned();
        match &config.target {
            TargetOptions::CloudDrive { .. } => {
                self.refresh_remote_listing(&save_root, &catalogue).await?;
            }
            TargetOptions::Local { root } => {
                self.list_local_tree(Path::new(root), &catalogue).await?;
            }
            _ => {}
        }

        let plan = self.plan(config, &catalogue).await?;
        tracing::info!(
            job = %config.name,
            actions = plan.actions.len(),
            skipped = plan.summary.files_skipped,
            "Plan ready"
        );

        self.transition(id, JobState::BackingUp)?;
        let executor = self.build_run(config, &catalogue, pause.clone())?;
        let summary = plan.summary;
        let report = executor.execute(plan.actions, cancel).await?;
        if report.cancelled {
            return Err(SyncError::Canceled.into());
        }
        let mut stats = report.stats;

        self.transition(id, JobState::Verifying)?;
        self.verify(id, config, &catalogue, &executor, cancel, &mut stats).await?;

        catalogue.persist(&*self.store).await?;
        Ok((summary, stats))
    }

    async fn scan_sources(&self, config: &JobConfig, catalogue: &Catalogue) -> anyhow::Result<()> {
        let previous = catalogue.persisted_snapshot().await;
        let multi_root = config.sources.len() > 1;
        let encryption = config.encryption.as_ref();

        let mut all = Vec::new();
        for source in &config.sources {
            let root = PathBuf::from(source);
            let scanner = Scanner::builder()
                .filter(IgnoreFilter::new(&config.ignore_patterns)?)
                .follow_symlinks(config.follow_symlinks)
                .degree(config.parallelism)
                .encrypted(encryption.is_some())
                .encrypt_names(encryption.map(|e| e.encrypt_names).unwrap_or(false))
                .build();

            let previous = previous.clone();
            let scan_root = root.clone();
            let mut entries = tokio::task::spawn_blocking(move || {
                scanner.scan(&scan_root, &previous)
            })
            .await??;

            if multi_root {
                let prefix = root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                for entry in &mut entries {
                    entry.key = format!("{prefix}/{}", entry.key);
                    entry.parent_key = if entry.parent_key.is_empty() {
                        prefix.clone()
                    } else {
                        format!("{prefix}/{}", entry.parent_key)
                    };
                }
            }
            all.extend(entries);
        }

        tracing::debug!(entries = all.len(), "Scan complete");
        catalogue.replace_local(all);
        Ok(())
    }

    /// Resolve (creating if missing) the save-root chain, then rebuild the
    /// remote maps from a full listing.
    async fn refresh_remote_listing(
        &self,
        save_root: &str,
        catalogue: &Catalogue,
    ) -> anyhow::Result<()> {
        let mut current_id = "root".to_owned();
        let mut current_key = String::new();
        let mut root_entry = None;
        for segment in save_root.split('/').filter(|s| !s.is_empty()) {
            current_key = if current_key.is_empty() {
                segment.to_owned()
            } else {
                format!("{current_key}/{segment}")
            };
            let found = self.client.exist(&current_id, segment, ItemKind::Folder).await?;
            let (folder_id, item) = match found {
                Some(item) => (item.file_id.clone(), Some(item)),
                None => {
                    let resp = self.client.create_folder(&current_id, segment).await?;
                    (resp.file_id, None)
                }
            };
            root_entry = Some(remote_entry_from(&item, &folder_id, &current_id, segment, &current_key));
            current_id = folder_id;
        }
        let root_entry = root_entry.context("save-root path is empty")?;

        let mut folders = vec![root_entry];
        let mut files = Vec::new();
        let mut queue = vec![(current_id, save_root.to_owned())];
        while let Some((folder_id, folder_key)) = queue.pop() {
            for item in self.client.list_children(&folder_id).await? {
                let key = format!("{folder_key}/{}", item.name);
                let entry = remote_entry_from(&Some(item.clone()), &item.file_id, &folder_id, &item.name, &key);
                match item.kind {
                    ItemKind::Folder => {
                        queue.push((item.file_id.clone(), key));
                        folders.push(entry);
                    }
                    ItemKind::File => files.push(entry),
                }
            }
        }

        tracing::debug!(files = files.len(), folders = folders.len(), "Remote listing rebuilt");
        catalogue.set_remote_listing(files, folders);
        Ok(())
    }

    /// For local targets the "remote" side is another local tree.
    async fn list_local_tree(&self, root: &Path, catalogue: &Catalogue) -> anyhow::Result<()> {
        let scanner = Scanner::builder().filter(IgnoreFilter::new(&[])?).build();
        let scan_root = root.to_owned();
        let entries =
            tokio::task::spawn_blocking(move || scanner.scan(&scan_root, &HashMap::new()))
                .await??;

        let mut files = Vec::new();
        let mut folders = Vec::new();
        for entry in entries {
            let remote = RemoteEntry {
                id: entry.key.clone(),
                parent_id: entry.parent_key.clone(),
                name: entry.name().to_owned(),
                is_folder: !entry.is_file,
                size: entry.size,
                sha1: entry.sha1.clone(),
                created: entry.created,
                updated: entry.modified,
                key: entry.key.clone(),
            };
            if remote.is_folder {
                folders.push(remote);
            } else {
                files.push(remote);
            }
        }
        catalogue.set_remote_listing(files, folders);
        Ok(())
    }

    async fn plan(&self, config: &JobConfig, catalogue: &Catalogue) -> anyhow::Result<Plan> {
        let source_roots: Vec<PathBuf> = config.sources.iter().map(PathBuf::from).collect();
        let target_local_root = match &config.target {
            TargetOptions::Local { root } => Some(PathBuf::from(root)),
            _ => None,
        };
        let save_root = match &config.target {
            TargetOptions::CloudDrive { save_root, .. } => save_root.clone(),
            // Local listings already carry relative keys.
            _ => String::new(),
        };

        let local = catalogue.local_snapshot();
        let remote_files = catalogue.remote_files_map();
        let remote_folders = catalogue.remote_folders_map();
        let snapshot = catalogue.persisted_snapshot().await;

        Planner::from_config(config).plan(PlanInput {
            source_roots: &source_roots,
            target_local_root: target_local_root.as_deref(),
            save_root: &save_root,
            local: &local,
            remote_files: &remote_files,
            remote_folders: &remote_folders,
            snapshot: &snapshot,
            now: Utc::now(),
        })
    }

    fn build_run(
        &self,
        config: &JobConfig,
        catalogue: &Arc<Catalogue>,
        pause: PauseToken,
    ) -> anyhow::Result<Executor> {
        let crypto = match &config.encryption {
            Some(enc) => Some(Arc::new(CryptoPipeline::from_config(enc)?)),
            None => None,
        };

        let drive = match &config.target {
            TargetOptions::CloudDrive { save_root, .. } => {
                let uploader = UploadFileService::builder()
                    .client(self.client.clone())
                    .catalogue(catalogue.clone())
                    .token_cache(self.token_cache.clone())
                    .drive_config_id(self.drive_config_id.clone())
                    .save_root(save_root.clone())
                    .part_size(self.part_size)
                    .rapid_upload(config.rapid_upload)
                    .recycle_bin(config.recycle_bin)
                    .crypto(crypto.clone())
                    .cache_dir(self.cache_dir.clone())
                    .pause(pause.clone())
                    .build();
                let downloader = DownloadFileService::builder()
                    .client(self.client.clone())
                    .cache_dir(self.cache_dir.clone())
                    .part_size(self.part_size)
                    .crypto(crypto)
                    .pause(pause.clone())
                    .preserve_time(config.preserve_time)
                    .build();
                Some(DriveTarget {
                    client: self.client.clone(),
                    uploader: Arc::new(uploader),
                    downloader: Arc::new(downloader),
                    catalogue: catalogue.clone(),
                    recycle_bin: config.recycle_bin,
                })
            }
            _ => None,
        };

        let target = Arc::new(SyncTarget::connect(&config.target, drive)?);

        let (progress_tx, progress_rx) = flume::bounded::<Progress>(64);
        tokio::spawn(async move {
            while let Ok(progress) = progress_rx.recv_async().await {
                tracing::debug!(
                    completed = progress.completed,
                    total = progress.total,
                    bytes = progress.bytes,
                    "Progress"
                );
            }
        });

        let executor = Executor::builder()
            .target(target)
            .parallelism(config.parallelism)
            .max_retries(config.max_retries)
            .continue_on_error(config.continue_on_error)
            .progress(Some(progress_tx))
            .pause(pause)
            .build();

        Ok(executor)
    }

    /// Reconcile the remote tree against the local snapshot after upload:
    /// mirror prunes, two-way pulls what only exists remotely, one-way is a
    /// no-op. Records the tree figures on the job.
    async fn verify(
        &self,
        id: Uuid,
        config: &JobConfig,
        catalogue: &Arc<Catalogue>,
        executor: &Executor,
        cancel: &CancellationToken,
        stats: &mut Statistics,
    ) -> anyhow::Result<()> {
        if let TargetOptions::CloudDrive { save_root, .. } = &config.target {
            self.refresh_remote_listing(save_root, catalogue).await?;
        }

        let plan = self.plan(config, catalogue).await?;
        let keep: Vec<PlanAction> = plan
            .actions
            .into_iter()
            .filter(|action| match config.mode {
                SyncMode::OneWay => false,
                SyncMode::Mirror => {
                    matches!(action.kind, ActionKind::DeleteFile | ActionKind::DeleteDirectory)
                }
                SyncMode::TwoWay => {
                    action.kind == ActionKind::CopyFile
                        && action.direction == Direction::TargetToSource
                }
            })
            .collect();

        if !keep.is_empty() {
            tracing::info!(actions = keep.len(), "Verification pass has work left");
            let report: ExecutionReport = executor.execute(keep, cancel).await?;
            if report.cancelled {
                return Err(SyncError::Canceled.into());
            }
            merge_stats(stats, &report.stats);
        }

        let remote_files = catalogue.remote_files_map();
        let remote_folders = catalogue.remote_folders_map();
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.metadata.file_count = remote_files.len() as u64;
            job.metadata.folder_count = remote_folders.len() as u64;
            job.metadata.total_size = remote_files.values().map(|f| f.size).sum();
            job.metadata.last_run = Some(Utc::now());
        }
        Ok(())
    }

    /// Apply one watcher notification to the live catalogue; hashes are
    /// recomputed lazily on the next run or upload.
    pub async fn on_watch_event(&self, id: Uuid, event: WatchEvent) {
        let Some(config) = self.job_config(id) else { return };
        let Some(catalogue) = self.catalogue(id) else { return };

        let key_of = |path: &Path| key_for(&config, path);

        match event.kind {
            WatchEventKind::Delete => {
                if let Some(key) = key_of(&event.path) {
                    if catalogue.is_dir(&key) {
                        catalogue.remove_local_tree(&key);
                    } else {
                        catalogue.remove_local(&key);
                    }
                }
            }
            WatchEventKind::Rename => {
                if let Some(old) = event.old_path.as_deref().and_then(key_of) {
                    if catalogue.is_dir(&old) {
                        catalogue.remove_local_tree(&old);
                    } else {
                        catalogue.remove_local(&old);
                    }
                }
                if let Some(entry) = stat_entry(&config, &event.path).await {
                    catalogue.insert_local(entry);
                }
            }
            WatchEventKind::Create | WatchEventKind::Change => {
                if let Some(entry) = stat_entry(&config, &event.path).await {
                    catalogue.insert_local(entry);
                }
            }
        }
    }

    fn transition(&self, id: Uuid, to: JobState) -> anyhow::Result<()> {
        let mut job = self.jobs.get_mut(&id).context("job disappeared")?;
        anyhow::ensure!(
            job.state.can_transition(to),
            "illegal job transition {} -> {to}",
            job.state
        );
        tracing::debug!(job = %job.config.name, from = %job.state, to = %to, "State");
        job.state = to;
        Ok(())
    }

    fn set_state(&self, id: Uuid, to: JobState) {
        if let Err(e) = self.transition(id, to) {
            tracing::warn!("{e}");
        }
    }

    /// Terminal transitions that may arrive from any phase.
    fn force_state(&self, id: Uuid, to: JobState) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.state = to;
            job.paused_from = None;
        }
    }
}

#[async_trait::async_trait]
impl RunJobService for JobController {
    async fn run_job(&self, id: Uuid) -> anyhow::Result<()> {
        {
            let job = self.jobs.get(&id).context("unknown job")?;
            if job.state == JobState::Disabled {
                anyhow::bail!("job {} is disabled", job.config.name);
            }
        }

        match JobQueue::global().enqueue(id).await {
            EnqueueOutcome::Queued => {
                self.transition(id, JobState::Queued)?;
            }
            EnqueueOutcome::Restarted => {
                tracing::info!(job = %id, "Restarting in-flight run");
                self.force_state(id, JobState::Queued);
            }
        }
        Ok(())
    }

    async fn update_job(&self, config: JobConfig) -> anyhow::Result<()> {
        config.validate()?;
        let id = config.id;
        match self.jobs.get_mut(&id) {
            Some(mut job) => {
                anyhow::ensure!(
                    !job.state.is_executing(),
                    "job {} is executing; pause or cancel it first",
                    job.config.name
                );
                job.config = config;
                Ok(())
            }
            None => self.register(config).await,
        }
    }

    async fn change_state(&self, id: Uuid, to: JobState) -> anyhow::Result<()> {
        match to {
            JobState::Paused => {
                let handle = self.running.get(&id).context("job is not executing")?;
                handle.pause.pause();
                let mut job = self.jobs.get_mut(&id).context("unknown job")?;
                anyhow::ensure!(job.state.can_transition(JobState::Paused), "cannot pause now");
                job.paused_from = Some(job.state);
                job.state = JobState::Paused;
                Ok(())
            }
            JobState::BackingUp | JobState::Restoring => {
                // Resume to the recorded executing state.
                let mut job = self.jobs.get_mut(&id).context("unknown job")?;
                anyhow::ensure!(job.state == JobState::Paused, "job is not paused");
                let back_to = job.paused_from.take().unwrap_or(to);
                job.state = back_to;
                drop(job);
                if let Some(handle) = self.running.get(&id) {
                    handle.pause.resume();
                }
                Ok(())
            }
            JobState::Cancelling | JobState::Cancelled => {
                let handle = self.running.get(&id).context("job is not executing")?;
                // Cancel releases a held pause gate too.
                handle.pause.resume();
                handle.cancel.cancel();
                self.force_state(id, JobState::Cancelling);
                Ok(())
            }
            JobState::Disabled => {
                self.transition(id, JobState::Disabled)
            }
            JobState::Idle => {
                // Explicit enable from Disabled, or plain reset.
                self.transition(id, JobState::Idle)
            }
            JobState::Initializing => {
                self.transition(id, JobState::Initializing)?;
                if let Some(catalogue) = self.catalogue(id) {
                    catalogue.load(&*self.store).await?;
                }
                self.transition(id, JobState::Idle)
            }
            other => anyhow::bail!("state {other} cannot be requested externally"),
        }
    }

    async fn last_result(&self, id: Uuid) -> Option<RunResult> {
        self.results.get(&id).map(|kv| kv.value().clone())
    }
}

fn merge_stats(into: &mut Statistics, other: &Statistics) {
    into.files_copied += other.files_copied;
    into.files_updated += other.files_updated;
    into.files_deleted += other.files_deleted;
    into.folders_created += other.folders_created;
    into.folders_deleted += other.folders_deleted;
    into.files_renamed += other.files_renamed;
    into.files_skipped += other.files_skipped;
    into.bytes_processed += other.bytes_processed;
    into.errors += other.errors;
}

fn remote_entry_from(
    item: &Option<FileItem>,
    id: &str,
    parent_id: &str,
    name: &str,
    key: &str,
) -> RemoteEntry {
    let now = Utc::now();
    RemoteEntry {
        id: id.to_owned(),
        parent_id: parent_id.to_owned(),
        name: name.to_owned(),
        is_folder: item.as_ref().map(|i| i.kind == ItemKind::Folder).unwrap_or(true),
        size: item.as_ref().and_then(|i| i.size).unwrap_or(0),
        sha1: item.as_ref().and_then(|i| i.content_hash.clone()),
        created: item.as_ref().map(|i| i.created_at).unwrap_or(now),
        updated: item.as_ref().map(|i| i.updated_at).unwrap_or(now),
        key: key.to_owned(),
    }
}

/// Map an absolute watched path back to its catalogue key.
fn key_for(config: &JobConfig, path: &Path) -> Option<String> {
    let multi_root = config.sources.len() > 1;
    for source in &config.sources {
        let root = Path::new(source);
        if let Ok(rel) = path.strip_prefix(root) {
            let rel: Vec<_> =
                rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
            let rel = rel.join("/");
            if rel.is_empty() {
                return None;
            }
            return Some(if multi_root {
                let prefix = root.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                format!("{prefix}/{rel}")
            } else {
                rel
            });
        }
    }
    None
}

async fn stat_entry(config: &JobConfig, path: &Path) -> Option<LocalEntry> {
    let key = key_for(config, path)?;
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified = meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
    let created = meta.created().map(Into::into).unwrap_or(modified);
    let encrypted = config.encryption.is_some() && meta.is_file();
    let encrypt_names =
        config.encryption.as_ref().map(|e| e.encrypt_names).unwrap_or(false);
    let name = key.rsplit('/').next().unwrap_or(&key).to_owned();

    Some(LocalEntry {
        path: path.to_owned(),
        parent_key: key.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_default(),
        key,
        is_file: meta.is_file(),
        size: if meta.is_file() { meta.len() } else { 0 },
        created,
        modified,
        fast_hash: None,
        sha1: None,
        encrypted,
        encrypted_name: (encrypted && encrypt_names)
            .then(|| format!("{:x}.e", md5::compute(name.as_bytes()))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::model::vo::config::{CompareMethod, ConflictResolution};

    fn config(sources: &[&str]) -> JobConfig {
        JobConfig {
            id: Uuid::new_v4(),
            name: "t".into(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            target: TargetOptions::CloudDrive {
                drive_id: "d".into(),
                save_root: "backup".into(),
            },
            mode: SyncMode::OneWay,
            compare: CompareMethod::default(),
            conflict: ConflictResolution::default(),
            sampling_rate: 0.1,
            time_drift_secs: 1,
            parallelism: None,
            max_retries: 3,
            preserve_time: false,
            recycle_bin: false,
            follow_symlinks: false,
            ignore_patterns: vec![],
            encryption: None,
            rapid_upload: true,
            interval_secs: None,
            watcher: true,
            continue_on_error: false,
            read_only_mount: false,
            mount_used_space_local: false,
        }
    }

    #[test]
    fn watch_paths_resolve_to_keys() {
        let single = config(&["/data/photos"]);
        assert_eq!(
            key_for(&single, Path::new("/data/photos/2024/a.jpg")).as_deref(),
            Some("2024/a.jpg")
        );
        assert_eq!(key_for(&single, Path::new("/elsewhere/a.jpg")), None);

        let multi = config(&["/data/photos", "/data/docs"]);
        assert_eq!(
            key_for(&multi, Path::new("/data/docs/cv.pdf")).as_deref(),
            Some("docs/cv.pdf")
        );
    }
}
