pub mod catalogue;
pub mod planner;
pub mod queue;

#[rustfmt::skip]
pub use self::{
    catalogue::Catalogue,
    planner::{Plan, PlanInput, Planner},
    queue::{EnqueueOutcome, JobQueue},
};
