//! Updater error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("cloud error: {0}")]
    Cloud(#[from] cumulus_cloud::CloudError),

    #[error("state store error: {0}")]
    State(#[from] cumulus_state::StateError),
}

pub type UpdaterResult<T> = Result<T, UpdaterError>;
