use thiserror::Error;

/// Errors surfaced by every collaborator interface in this crate. Per
/// spec.md §6.3, all errors are retryable except `NotFound`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("retryable store error: {0}")]
    Retryable(String),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::NotFound)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Retryable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
