mod background_service;
mod mount_service;
mod run_job_service;

#[rustfmt::skip]
pub use self::{
    background_service::BackgroundService,
    mount_service::MountService,
    run_job_service::RunJobService,
};
