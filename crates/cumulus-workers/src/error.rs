//! Worker-lifecycle error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkersError {
    #[error("worker directory request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("worker directory error: {0}")]
    Directory(String),

    #[error("state store error: {0}")]
    State(#[from] cumulus_state::StateError),
}

pub type WorkersResult<T> = Result<T, WorkersError>;
