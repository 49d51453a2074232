//! Error types for the Matrix side

use thiserror::Error;

/// Errors talking to the homeserver
#[derive(Error, Debug)]
pub enum MatrixError {
    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The homeserver answered with an error document
    #[error("Homeserver returned {status} {errcode}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Matrix error code (`M_FORBIDDEN`, ...)
        errcode: String,
        /// Human-readable message
        message: String,
    },

    /// A response body did not have the expected shape
    #[error("Unexpected response: {0}")]
    Decode(String),

    /// Invalid homeserver URL or path component
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Operation needs a logged-in session
    #[error("Not logged in")]
    NotLoggedIn,

    /// Supervisor is shutting down
    #[error("Shutting down")]
    ShuttingDown,
}

impl MatrixError {
    /// Whether retrying later may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            MatrixError::Http(_) => true,
            MatrixError::Api { status, .. } => *status == 429 || *status >= 500,
            MatrixError::Decode(_) => true,
            MatrixError::InvalidUrl(_) | MatrixError::NotLoggedIn | MatrixError::ShuttingDown => {
                false
            }
        }
    }

    /// Whether the access token was rejected
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, MatrixError::Api { status: 401, .. })
            || matches!(self, MatrixError::Api { errcode, .. } if errcode == "M_UNKNOWN_TOKEN")
    }

    /// Get error code for logging and monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            MatrixError::Http(_) => "HTTP_ERROR",
            MatrixError::Api { .. } => "API_ERROR",
            MatrixError::Decode(_) => "DECODE_ERROR",
            MatrixError::InvalidUrl(_) => "INVALID_URL",
            MatrixError::NotLoggedIn => "NOT_LOGGED_IN",
            MatrixError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl From<serde_json::Error> for MatrixError {
    fn from(err: serde_json::Error) -> Self {
        MatrixError::Decode(err.to_string())
    }
}

impl From<MatrixError> for meshrelay_core::RelayError {
    fn from(err: MatrixError) -> Self {
        match err {
            MatrixError::NotLoggedIn => meshrelay_core::RelayError::NotConnected("chat"),
            other => meshrelay_core::RelayError::Chat(other.to_string()),
        }
    }
}

/// Result type for Matrix operations
pub type Result<T> = std::result::Result<T, MatrixError>;
