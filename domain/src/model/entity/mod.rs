pub mod job;
pub mod local_entry;
pub mod plan;
pub mod remote_entry;

#[rustfmt::skip]
pub use self::{
    job::{Job, JobMetadata, JobState, RunResult, Statistics},
    local_entry::LocalEntry,
    plan::{ActionKind, ActionStatus, Direction, PlanAction, PlanSummary},
    remote_entry::RemoteEntry,
};
