//! Error types shared across the crate.

use thiserror::Error;

/// Failures from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A client frame that failed validation at the connection boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("exactly one of `to` or `groupId` is required")]
    Addressing,
}

impl EventError {
    /// Short machine-readable code sent back in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            EventError::Malformed(_) => "malformed",
            EventError::EmptyField(_) => "empty-field",
            EventError::Addressing => "addressing",
        }
    }
}
