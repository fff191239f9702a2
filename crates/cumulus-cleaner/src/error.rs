//! Cleaner error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CleanerError {
    #[error("state store error: {0}")]
    State(#[from] cumulus_state::StateError),

    #[error("cloud error: {0}")]
    Cloud(#[from] cumulus_cloud::CloudError),

    #[error("destroy failed: {0}")]
    Scheduler(#[from] cumulus_scheduler::SchedulerError),

    #[error("worker directory error: {0}")]
    Workers(#[from] cumulus_workers::WorkersError),
}

pub type CleanerResult<T> = Result<T, CleanerError>;
