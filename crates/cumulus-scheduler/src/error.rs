//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while provisioning or destroying deployments.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("user data template error: {0}")]
    Template(String),

    #[error("state store error: {0}")]
    State(#[from] cumulus_state::StateError),

    #[error("cloud error: {0}")]
    Cloud(#[from] cumulus_cloud::CloudError),

    #[error("updater error: {0}")]
    Updater(#[from] cumulus_updater::UpdaterError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
