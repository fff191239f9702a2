//! Autoscaler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("job source request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("job source error: {0}")]
    Source(String),

    #[error("state store error: {0}")]
    State(#[from] cumulus_state::StateError),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
