//! Error types for backend calls and view state

/// Errors from the calendar, alarm and activity collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The backend refused the bearer token; the user must sign in again
    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid backend response: {0}")]
    Decode(String),

    #[error("event not found: {0}")]
    UnknownEvent(String),

    /// The requested alarm change does not apply to the event's current status
    #[error("alarm conflict: {0}")]
    Conflict(String),

    #[error("invalid alarm settings: {0}")]
    InvalidSettings(String),
}

impl Error {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Http(_) => "http_error",
            Error::Unauthorized(_) => "unauthorized",
            Error::Backend(_) => "backend_error",
            Error::Decode(_) => "decode_error",
            Error::UnknownEvent(_) => "unknown_event",
            Error::Conflict(_) => "conflict",
            Error::InvalidSettings(_) => "invalid_settings",
        }
    }
}

/// Result alias for collaborator operations.
pub type Result<T> = std::result::Result<T, Error>;
