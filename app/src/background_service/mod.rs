mod catalogue_persist_runner;
mod file_system_watch_runner;
mod queue_runner;
mod schedule_runner;

#[rustfmt::skip]
pub use self::{
    catalogue_persist_runner::CataloguePersistRunner,
    file_system_watch_runner::FileSystemWatchRunner,
    queue_runner::QueueRunner,
    schedule_runner::ScheduleRunner,
};
