//! Error types for Cubby.

use thiserror::Error;

/// Limits that reject a request without changing any state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// The user table is full.
    #[error("user limit reached")]
    UserLimitReached,

    /// The user already stores the maximum number of files.
    #[error("file limit reached")]
    FileLimitReached,

    /// The change would push the user past their quota.
    #[error("quota exceeded")]
    QuotaExceeded,
}

/// Common error type for Cubby.
#[derive(Error, Debug)]
pub enum CubbyError {
    /// Malformed command or arguments. The connection stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Not logged in, bad credentials or double login.
    #[error("authentication error: {0}")]
    Auth(String),

    /// A user, file or quota limit was hit.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A username was registered twice.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Payload could not be decoded or does not match its declared size.
    #[error("decode error: {0}")]
    Decode(String),

    /// Disk store failure that is not a plain I/O error.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded queue rejected an item.
    #[error("{0} queue is full")]
    QueueFull(&'static str),

    /// A queue was closed for shutdown.
    #[error("{0} queue is closed")]
    QueueClosed(&'static str),

    /// A task finished without reporting back.
    #[error("task {0} was abandoned")]
    TaskAbandoned(uuid::Uuid),

    /// A task did not finish within the configured limit.
    #[error("task {0} timed out")]
    TaskTimeout(uuid::Uuid),

    /// Validation error for user input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<crate::auth::ValidationError> for CubbyError {
    fn from(e: crate::auth::ValidationError) -> Self {
        CubbyError::Validation(e.to_string())
    }
}

/// Result type alias for Cubby operations.
pub type Result<T> = std::result::Result<T, CubbyError>;
