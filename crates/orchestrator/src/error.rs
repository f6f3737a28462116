use thiserror::Error;

/// Error kinds surfaced to callers of the public API, per spec.md §7. The
/// backend never leaks raw store/sandbox error strings — every boundary
/// maps into this enum.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("too many concurrent executions")]
    TooManyConcurrent,

    #[error("rate limited")]
    RateLimited,

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("sandbox backend unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("execution setup failed: {0}")]
    SetupFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// The stable `kind` string returned in `{success, error:{kind, message}}`
    /// per spec.md §7.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Forbidden => "Forbidden",
            OrchestratorError::NotFound => "NotFound",
            OrchestratorError::UnsupportedLanguage(_) => "UnsupportedLanguage",
            OrchestratorError::TooManyConcurrent => "TooManyConcurrent",
            OrchestratorError::RateLimited => "RateLimited",
            OrchestratorError::QuotaExceeded => "QuotaExceeded",
            OrchestratorError::SandboxUnavailable(_) => "SandboxUnavailable",
            OrchestratorError::SetupFailed(_) => "SetupFailed",
            OrchestratorError::Internal(_) => "Internal",
        }
    }
}

impl From<store::StoreError> for OrchestratorError {
    fn from(e: store::StoreError) -> Self {
        match e {
            store::StoreError::NotFound => OrchestratorError::NotFound,
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl From<catalogue::CatalogueError> for OrchestratorError {
    fn from(e: catalogue::CatalogueError) -> Self {
        match e {
            catalogue::CatalogueError::UnsupportedLanguage(id) => {
                OrchestratorError::UnsupportedLanguage(id)
            }
        }
    }
}

impl From<sandbox::SandboxError> for OrchestratorError {
    fn from(e: sandbox::SandboxError) -> Self {
        match e {
            sandbox::SandboxError::SandboxUnavailable(msg) => {
                OrchestratorError::SandboxUnavailable(msg)
            }
            other => OrchestratorError::SetupFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
