//! Error types used across the sandboxd control plane.

use thiserror::Error;

/// Result type for sandboxd operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Error taxonomy for box operations.
///
/// Kinds map onto HTTP statuses at the server boundary; the library only
/// distinguishes the kind and carries a human-readable message.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The box (or another addressed object) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation requires a running box but it is in another state.
    #[error("box not running: {0}")]
    NotRunning(String),

    /// Missing or ill-formed request parameter.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The selected backend does not implement the operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The backend RPC failed. Not retried by the core.
    #[error("backend error: {0}")]
    Upstream(String),

    /// A create/exec precondition failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A deadline elapsed before the operation completed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("canceled: {0}")]
    Canceled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Whether the error is the caller's fault rather than the service's.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SandboxError::NotFound(_)
                | SandboxError::NotRunning(_)
                | SandboxError::InvalidRequest(_)
                | SandboxError::Conflict(_)
        )
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Internal(format!("JSON error: {}", err))
    }
}

impl From<String> for SandboxError {
    fn from(err: String) -> Self {
        SandboxError::Internal(err)
    }
}

impl From<&str> for SandboxError {
    fn from(err: &str) -> Self {
        SandboxError::Internal(err.to_string())
    }
}
