use thiserror::Error;

/// The single result-or-error type every core module boundary returns.
///
/// Host-language exceptions (panics aside, which remain bugs) never cross a
/// module boundary in this crate family: every fallible operation returns
/// `Result<T, Error>`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("buffer too small: needed {needed} bytes, got {got}")]
    BufferFull { needed: usize, got: usize },

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    #[error("overloaded: {0}")]
    Overloaded(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn assertion_failed(msg: impl Into<String>) -> Self {
        Error::AssertionFailed(msg.into())
    }

    pub fn overloaded(msg: impl Into<String>) -> Self {
        Error::Overloaded(msg.into())
    }

    /// True for errors a client should retry against a freshly-merged DPI
    /// (the server may have moved the partition under it).
    pub fn is_retryable_disconnect(&self) -> bool {
        matches!(self, Error::Disconnected(_))
    }

    /// True for errors where the same request should simply be retried
    /// against the same server after a short backoff (§4.2 write stall).
    pub fn is_retryable_overload(&self) -> bool {
        matches!(self, Error::Overloaded(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
