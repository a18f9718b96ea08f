//! Bounded-parallel runner of planned actions.
//!
//! Priority groups run in strict increasing order. Inside a group, file
//! actions fan out under a counting semaphore; directory actions stay
//! sequential to avoid filesystem ordering pitfalls. Every action checks the
//! cancellation token and the pause gate at entry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use infrastructure::sync::PauseToken;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use domain::model::entity::{ActionKind, ActionStatus, PlanAction, Statistics};
use domain::model::vo::config::ConflictResolution;
use domain::SyncError;

use super::target::SyncTarget;

/// Directory groups larger than this are pre-warmed in one quiet pass.
const PREWARM_THRESHOLD: usize = 100;
/// Minimum interval between progress events, except at 0 % and 100 %.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    pub bytes: u64,
}

pub struct ExecutionReport {
    pub actions: Vec<PlanAction>,
    pub stats: Statistics,
    pub cancelled: bool,
}

#[derive(TypedBuilder)]
pub struct Executor {
    target: Arc<SyncTarget>,
    /// In-flight file actions cap; `None` means one per logical CPU.
    #[builder(default)]
    parallelism: Option<usize>,
    #[builder(default = 3)]
    max_retries: u32,
    #[builder(default)]
    continue_on_error: bool,
    #[builder(default)]
    progress: Option<flume::Sender<Progress>>,
    #[builder(default)]
    pause: PauseToken,
}

struct ExecState {
    actions: Vec<Mutex<PlanAction>>,
    stats: StdMutex<Statistics>,
    completed: AtomicU64,
    total: u64,
    last_emit: StdMutex<Instant>,
    /// Set when an action failed and `continue_on_error` is off.
    halted: CancellationToken,
}

impl Executor {
    pub fn pause_token(&self) -> &PauseToken {
        &self.pause
    }

    pub async fn execute(
        &self,
        actions: Vec<PlanAction>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ExecutionReport> {
        let total = actions.len() as u64;
        let mut groups: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
        for (index, action) in actions.iter().enumerate() {
            groups.entry(action.kind.priority()).or_default().push(index);
        }

        let state = Arc::new(ExecState {
            actions: actions.into_iter().map(Mutex::new).collect(),
            stats: StdMutex::default(),
            completed: AtomicU64::new(0),
            total,
            last_emit: StdMutex::new(Instant::now()),
            halted: CancellationToken::new(),
        });
        self.emit(&state, true);

        let workers = self
            .parallelism
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));
        let semaphore = Arc::new(Semaphore::new(workers));

        'groups: for (priority, indices) in groups {
            if cancel.is_cancelled() || state.halted.is_cancelled() {
                break;
            }

            let directory_group = indices
                .first()
                .map(|&i| {
                    let action = state.actions[i].try_lock().expect("no worker holds it yet");
                    action.kind.is_directory()
                })
                .unwrap_or(false);

            if directory_group {
                let prewarm = priority == 1 && indices.len() > PREWARM_THRESHOLD;
                if prewarm {
                    tracing::info!(count = indices.len(), "Pre-warming directory creation");
                }
                for index in indices {
                    if cancel.is_cancelled() || state.halted.is_cancelled() {
                        break 'groups;
                    }
                    self.run_one(&state, index, cancel, !prewarm).await;
                }
            } else {
                let mut set = JoinSet::new();
                for index in indices {
                    let permit = tokio::select! {
                        permit = semaphore.clone().acquire_owned() => permit.expect("semaphore never closes"),
                        _ = cancel.cancelled() => break,
                        _ = state.halted.cancelled() => break,
                    };
                    let this = self.clone_for_worker();
                    let state = state.clone();
                    let cancel = cancel.clone();
                    set.spawn(async move {
                        let _permit = permit;
                        this.run_one(&state, index, &cancel, true).await;
                    });
                }
                while set.join_next().await.is_some() {}
            }
        }

        self.emit(&state, true);

        let cancelled = cancel.is_cancelled();
        let state = Arc::into_inner(state).expect("all workers have returned");
        let actions: Vec<PlanAction> =
            state.actions.into_iter().map(|m| m.into_inner()).collect();
        let stats = state.stats.into_inner().expect("stats mutex is not poisoned");

        if state.halted.is_cancelled() && !self.continue_on_error {
            if let Some(failed) = actions.iter().find(|a| a.status == ActionStatus::Failed) {
                return Err(SyncError::Fatal(format!(
                    "{} {} failed: {}",
                    failed.kind,
                    failed.key,
                    failed.error.as_deref().unwrap_or("unknown error")
                ))
                .into());
            }
        }

        Ok(ExecutionReport {
            actions,
            stats,
            cancelled,
        })
    }

    /// A cheap handle for spawned workers; the executor itself stays borrowed
    /// by the caller.
    fn clone_for_worker(&self) -> WorkerHandle {
        WorkerHandle {
            target: self.target.clone(),
            max_retries: self.max_retries,
            continue_on_error: self.continue_on_error,
            progress: self.progress.clone(),
            pause: self.pause.clone(),
        }
    }

    async fn run_one(
        &self,
        state: &ExecState,
        index: usize,
        cancel: &CancellationToken,
        report: bool,
    ) {
        self.clone_for_worker().run_one(state, index, cancel, report).await
    }

    fn emit(&self, state: &ExecState, force: bool) {
        self.clone_for_worker().emit(state, force)
    }
}

struct WorkerHandle {
    target: Arc<SyncTarget>,
    max_retries: u32,
    continue_on_error: bool,
    progress: Option<flume::Sender<Progress>>,
    pause: PauseToken,
}

impl WorkerHandle {
    async fn run_one(
        &self,
        state: &ExecState,
        index: usize,
        cancel: &CancellationToken,
        report: bool,
    ) {
        // Completed already, e.g. a rename front-run by its KeepBoth copy.
        {
            let action = state.actions[index].lock().await;
            if action.status != ActionStatus::Pending {
                return;
            }
        }

        // Pause holds here; cancel releases the gate.
        tokio::select! {
            _ = self.pause.wait_ready() => {}
            _ = cancel.cancelled() => return,
        }
        if cancel.is_cancelled() {
            return;
        }

        let snapshot = {
            let mut action = state.actions[index].lock().await;
            action.status = ActionStatus::Running;
            action.clone()
        };

        if snapshot.kind == ActionKind::CopyFile
            && snapshot.resolution == Some(ConflictResolution::KeepBoth)
        {
            self.front_run_rename(state, &snapshot, cancel).await;
        }

        let result = self.run_with_retry(&snapshot, cancel).await;

        let mut action = state.actions[index].lock().await;
        match result {
            Ok(moved) if moved.cancelled => {
                action.status = ActionStatus::Pending;
                return;
            }
            Ok(moved) => {
                action.status = ActionStatus::Completed;
                let mut stats = state.stats.lock().expect("stats mutex is not poisoned");
                stats.bytes_processed += moved.bytes;
                match action.kind {
                    ActionKind::CreateDirectory => stats.folders_created += 1,
                    ActionKind::CopyFile => stats.files_copied += 1,
                    ActionKind::UpdateFile => stats.files_updated += 1,
                    ActionKind::RenameFile => stats.files_renamed += 1,
                    ActionKind::DeleteFile => stats.files_deleted += 1,
                    ActionKind::DeleteDirectory => stats.folders_deleted += 1,
                }
            }
            Err(e) => {
                tracing::error!(key = %action.key, kind = %action.kind, "Action failed: {e:#}");
                action.status = ActionStatus::Failed;
                action.error = Some(format!("{e:#}"));
                state.stats.lock().expect("stats mutex is not poisoned").errors += 1;
                if !self.continue_on_error {
                    state.halted.cancel();
                }
            }
        }
        drop(action);

        state.completed.fetch_add(1, Ordering::Relaxed);
        if report {
            self.emit(state, false);
        }
    }

    /// The paired rename of a KeepBoth conflict must free the name before
    /// its copy lands, even though renames group after copies.
    async fn front_run_rename(
        &self,
        state: &ExecState,
        copy: &PlanAction,
        cancel: &CancellationToken,
    ) {
        for slot in &state.actions {
            let mut candidate = slot.lock().await;
            if candidate.kind == ActionKind::RenameFile
                && candidate.key == copy.key
                && candidate.status == ActionStatus::Pending
            {
                candidate.status = ActionStatus::Running;
                let snapshot = candidate.clone();
                drop(candidate);

                let result = self.run_with_retry(&snapshot, cancel).await;
                let mut candidate = slot.lock().await;
                match result {
                    Ok(_) => {
                        candidate.status = ActionStatus::Completed;
                        let mut stats =
                            state.stats.lock().expect("stats mutex is not poisoned");
                        stats.files_renamed += 1;
                    }
                    Err(e) => {
                        candidate.status = ActionStatus::Failed;
                        candidate.error = Some(format!("{e:#}"));
                        state.stats.lock().expect("stats mutex is not poisoned").errors += 1;
                    }
                }
                state.completed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    async fn run_with_retry(
        &self,
        action: &PlanAction,
        cancel: &CancellationToken,
    ) -> anyhow::Result<super::target::Moved> {
        let mut attempt = 0u32;
        loop {
            let result = self.dispatch(action, cancel).await;
            match result {
                Ok(moved) => return Ok(moved),
                Err(e) => {
                    if cancel.is_cancelled() || attempt >= self.max_retries || !is_io_kind(&e) {
                        return Err(e);
                    }
                    let wait = Duration::from_secs(1 << attempt);
                    tracing::warn!(
                        key = %action.key,
                        attempt,
                        "Retrying after I/O error in {wait:?}: {e}"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        action: &PlanAction,
        cancel: &CancellationToken,
    ) -> anyhow::Result<super::target::Moved> {
        let done = super::target::Moved {
            bytes: 0,
            cancelled: false,
        };
        match action.kind {
            ActionKind::CreateDirectory => {
                self.target.create_dir(action).await?;
                Ok(done)
            }
            ActionKind::CopyFile | ActionKind::UpdateFile => {
                self.target.copy_file(action, cancel).await
            }
            ActionKind::RenameFile => {
                self.target.rename(action).await?;
                Ok(done)
            }
            ActionKind::DeleteFile | ActionKind::DeleteDirectory => {
                self.target.delete(action).await?;
                Ok(done)
            }
        }
    }

    fn emit(&self, state: &ExecState, force: bool) {
        let Some(sender) = &self.progress else { return };

        let completed = state.completed.load(Ordering::Relaxed);
        let at_edge = completed == 0 || completed == state.total;
        if !force && !at_edge {
            let mut last = state.last_emit.lock().expect("emit mutex is not poisoned");
            if last.elapsed() < PROGRESS_INTERVAL {
                return;
            }
            *last = Instant::now();
        }

        let bytes = state.stats.lock().expect("stats mutex is not poisoned").bytes_processed;
        let _ = sender.try_send(Progress {
            completed,
            total: state.total,
            bytes,
        });
    }
}

/// I/O-kind failures retry; policy errors propagate.
fn is_io_kind(error: &anyhow::Error) -> bool {
    if let Some(kind) = SyncError::of(error) {
        return kind.is_retryable();
    }
    error.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some()
            || cause.downcast_ref::<reqwest::Error>().is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kind_detection() {
        let io: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(is_io_kind(&io));

        assert!(is_io_kind(&SyncError::Transient("t".into()).into()));
        assert!(is_io_kind(&SyncError::Throttled(5).into()));
        assert!(!is_io_kind(&SyncError::ConfigInvalid("c".into()).into()));
        assert!(!is_io_kind(&SyncError::PermissionDenied("p".into()).into()));
        assert!(!is_io_kind(&anyhow::anyhow!("logic error")));
    }
}
