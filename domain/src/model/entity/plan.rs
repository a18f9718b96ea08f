use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::vo::config::ConflictResolution;

/// What a planned action does. The discriminant carries the execution
/// priority: lower numbers run first, and no action of priority `k` starts
/// before every action of priority `k - 1` has completed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ActionKind {
    CreateDirectory,
    CopyFile,
    UpdateFile,
    RenameFile,
    DeleteFile,
    DeleteDirectory,
}

impl ActionKind {
    pub fn priority(self) -> u8 {
        match self {
            Self::CreateDirectory => 1,
            Self::CopyFile | Self::UpdateFile => 2,
            Self::RenameFile => 3,
            Self::DeleteFile => 4,
            Self::DeleteDirectory => 5,
        }
    }

    pub fn is_directory(self) -> bool {
        matches!(self, Self::CreateDirectory | Self::DeleteDirectory)
    }
}

/// Which way the bytes flow for this action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    SourceToTarget,
    TargetToSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// One unit of work consumed by the executor.
///
/// `source` and `target` are always absolute locations (a local path or a
/// remote path-key); the flow direction is encoded only in `direction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAction {
    pub kind: ActionKind,
    pub source: PathBuf,
    pub target: String,
    pub key: String,
    pub size: u64,
    pub direction: Direction,
    pub resolution: Option<ConflictResolution>,
    pub status: ActionStatus,
    pub error: Option<String>,
}

impl PlanAction {
    pub fn new(kind: ActionKind, source: impl Into<PathBuf>, target: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            target: target.into(),
            key: key.into(),
            size: 0,
            direction: Direction::SourceToTarget,
            resolution: None,
            status: ActionStatus::default(),
            error: None,
        }
    }

    pub fn sized(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn towards(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn resolved_by(mut self, resolution: ConflictResolution) -> Self {
        self.resolution = Some(resolution);
        self
    }
}

/// What the planner decided, before any byte moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub directories_to_create: u64,
    pub files_to_copy: u64,
    pub files_to_update: u64,
    pub files_to_rename: u64,
    pub files_to_delete: u64,
    pub directories_to_delete: u64,
    pub files_skipped: u64,
    pub bytes_planned: u64,
}

impl PlanSummary {
    pub fn tally(actions: &[PlanAction], skipped: u64) -> Self {
        let mut summary = Self {
            files_skipped: skipped,
            ..Self::default()
        };
        for action in actions {
            match action.kind {
                ActionKind::CreateDirectory => summary.directories_to_create += 1,
                ActionKind::CopyFile => {
                    summary.files_to_copy += 1;
                    summary.bytes_planned += action.size;
                }
                ActionKind::UpdateFile => {
                    summary.files_to_update += 1;
                    summary.bytes_planned += action.size;
                }
                ActionKind::RenameFile => summary.files_to_rename += 1,
                ActionKind::DeleteFile => summary.files_to_delete += 1,
                ActionKind::DeleteDirectory => summary.directories_to_delete += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_follow_the_execution_order() {
        let order = [
            ActionKind::CreateDirectory,
            ActionKind::CopyFile,
            ActionKind::RenameFile,
            ActionKind::DeleteFile,
            ActionKind::DeleteDirectory,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
        assert_eq!(ActionKind::CopyFile.priority(), ActionKind::UpdateFile.priority());
    }
}
