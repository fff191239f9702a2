//! Store failures.
//!
//! Variants carry the underlying redb or serde_json message. Absent rows
//! are not errors: lookups return `Option` and conditional writes `bool`.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or opened.
    #[error("cannot open state database: {0}")]
    Open(String),

    /// Beginning or committing a transaction failed.
    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    #[error("cannot encode state row: {0}")]
    Serialize(String),

    /// A stored row no longer parses as its type.
    #[error("corrupt state row: {0}")]
    Deserialize(String),
}
