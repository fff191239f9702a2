//! Cloud adapter error types.

use thiserror::Error;

use crate::classify::FailureKind;

/// Errors raised by adapters, the token manager and discovery.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Instance creation was rejected; `kind` is set when the failure is permanent-ish.
    #[error("instance creation failed: {message}")]
    Creation {
        kind: Option<FailureKind>,
        message: String,
    },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cloud API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unsupported cloud type: {0}")]
    Unsupported(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("state store error: {0}")]
    State(#[from] cumulus_state::StateError),
}

impl CloudError {
    /// A creation error whose kind is derived from the message text.
    pub fn creation(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = crate::classify::classify_failure(&message);
        Self::Creation { kind, message }
    }

    /// The failure kind of a creation error, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Creation { kind, .. } => *kind,
            _ => None,
        }
    }
}

pub type CloudResult<T> = Result<T, CloudError>;
