use thiserror::Error;

/// Errors that can occur in the checkout engine.
#[derive(Error, Debug)]
pub enum VaultError {
    /// The remote could not be reached (network, auth, timeout).
    #[error("Sync error: {0}")]
    Sync(String),

    /// Local state was stale relative to the remote at publish time.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{path} is already checked out by {owner}")]
    AlreadyLocked { path: String, owner: String },

    #[error("{user} does not hold the checkout on {path}")]
    NotOwner { path: String, user: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{path} is checked out by {owner}")]
    FileLocked { path: String, owner: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Malformed state: {0}")]
    MalformedState(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable response category for a terminal error.
///
/// Front ends map these to status codes without looking at error internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Forbidden,
    BadRequest,
    ServerError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Forbidden => "forbidden",
            ErrorCategory::BadRequest => "bad_request",
            ErrorCategory::ServerError => "server_error",
        }
    }
}

impl VaultError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            VaultError::NotFound(_) | VaultError::InvalidTarget(_) => ErrorCategory::NotFound,
            VaultError::Conflict(_)
            | VaultError::AlreadyLocked { .. }
            | VaultError::FileLocked { .. }
            | VaultError::AlreadyExists(_) => ErrorCategory::Conflict,
            VaultError::NotOwner { .. } | VaultError::Forbidden(_) => ErrorCategory::Forbidden,
            VaultError::InvalidArgument(_) => ErrorCategory::BadRequest,
            VaultError::Sync(_)
            | VaultError::MalformedState(_)
            | VaultError::Io(_)
            | VaultError::Git(_)
            | VaultError::Serialization(_)
            | VaultError::Internal(_) => ErrorCategory::ServerError,
        }
    }

    /// Whether the caller may retry the same request after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Sync(_))
    }

    /// Whether the caller must resynchronize and re-validate before retrying.
    pub fn requires_resync(&self) -> bool {
        matches!(self, VaultError::Conflict(_))
    }
}
