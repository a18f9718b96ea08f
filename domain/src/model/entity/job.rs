use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::entity::plan::PlanSummary;
use crate::model::vo::config::JobConfig;

/// Lifecycle state of one sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum JobState {
    None,
    Starting,
    Initializing,
    Idle,
    Queued,
    Scanning,
    BackingUp,
    Restoring,
    Verifying,
    Paused,
    Completed,
    Cancelling,
    Cancelled,
    Error,
    Disabled,
}

impl JobState {
    /// A run is in flight; re-initialization is not allowed from here.
    pub fn is_executing(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::BackingUp | Self::Restoring | Self::Verifying | Self::Cancelling
        )
    }

    /// The guarded transition table. Anything not listed is rejected.
    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;

        // Disabled is sticky until an explicit enable.
        if self == Disabled {
            return matches!(to, Idle | Initializing);
        }

        match (self, to) {
            // Explicit re-initialization from any non-executing state.
            (from, Initializing) if !from.is_executing() => true,
            (Initializing, Idle) => true,
            (None | Starting, Idle) => true,

            // Run trigger and queue handoff.
            (Idle | Error | Cancelled | Completed, Queued) => true,
            (Queued, Scanning) => true,
            (Scanning, BackingUp | Restoring) => true,

            // The executing phases.
            (BackingUp | Restoring, Verifying) => true,
            (Verifying, Idle | Completed) => true,

            // Pause holds an executing run; resume returns to it.
            (BackingUp | Restoring, Paused) => true,
            (Paused, BackingUp | Restoring | Cancelling) => true,

            // Failure and cancellation exits.
            (Queued | Scanning | BackingUp | Restoring | Verifying, Error) => true,
            (Queued | Scanning | BackingUp | Restoring | Verifying | Paused, Cancelled) => true,
            (Scanning | BackingUp | Restoring | Verifying, Cancelling) => true,
            (Cancelling, Cancelled) => true,

            // Disabling is always possible outside a run.
            (from, Disabled) if !from.is_executing() => true,

            _ => false,
        }
    }
}

/// Aggregate figures recorded on the job after verification.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobMetadata {
    pub file_count: u64,
    pub folder_count: u64,
    pub total_size: u64,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub config: JobConfig,
    pub state: JobState,
    /// The executing state a pause interrupted, restored on resume.
    pub paused_from: Option<JobState>,
    pub metadata: JobMetadata,
}

impl Job {
    pub fn new(config: JobConfig) -> Self {
        Self {
            id: config.id,
            config,
            state: JobState::None,
            paused_from: None,
            metadata: JobMetadata::default(),
        }
    }
}

/// What one run actually did.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub files_copied: u64,
    pub files_updated: u64,
    pub files_deleted: u64,
    pub folders_created: u64,
    pub folders_deleted: u64,
    pub files_renamed: u64,
    pub files_skipped: u64,
    pub bytes_processed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub job_id: Uuid,
    pub state: JobState,
    pub plan: PlanSummary,
    pub stats: Statistics,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::JobState::*;

    #[test]
    fn happy_path_run() {
        for (from, to) in [
            (Idle, Queued),
            (Queued, Scanning),
            (Scanning, BackingUp),
            (BackingUp, Verifying),
            (Verifying, Idle),
        ] {
            assert!(from.can_transition(to), "{from} -> {to}");
        }
    }

    #[test]
    fn pause_records_and_returns() {
        assert!(BackingUp.can_transition(Paused));
        assert!(Paused.can_transition(BackingUp));
        assert!(Restoring.can_transition(Paused));
        assert!(Paused.can_transition(Restoring));
        // Cancel must work while paused.
        assert!(Paused.can_transition(Cancelling));
        assert!(Paused.can_transition(Cancelled));
    }

    #[test]
    fn disabled_is_sticky() {
        assert!(!Disabled.can_transition(Queued));
        assert!(!Disabled.can_transition(Scanning));
        assert!(Disabled.can_transition(Idle));
    }

    #[test]
    fn no_reinit_while_executing() {
        assert!(!BackingUp.can_transition(Initializing));
        assert!(!Verifying.can_transition(Initializing));
        assert!(Idle.can_transition(Initializing));
        assert!(Error.can_transition(Initializing));
    }

    #[test]
    fn run_trigger_only_from_rest_states() {
        assert!(Error.can_transition(Queued));
        assert!(Cancelled.can_transition(Queued));
        assert!(!BackingUp.can_transition(Queued));
        assert!(!Paused.can_transition(Queued));
    }
}
