use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox backend is out of capacity: {0}")]
    SandboxUnavailable(String),

    #[error("path escapes the sandbox working directory: {0}")]
    PathTraversal(String),

    #[error("sandbox operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("no such sandbox handle")]
    NotFound,

    #[error("sandbox internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
