//! Error types for the sign-in flow

/// Errors from sign-in operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("secure random source unavailable: {0}")]
    Randomness(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid authorization request: {0}")]
    InvalidRequest(String),

    #[error("storage parse error: {0}")]
    StorageParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for sign-in operations.
pub type Result<T> = std::result::Result<T, Error>;
