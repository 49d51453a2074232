//! Error types for the mapping store

use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Error, Debug)]
pub enum StateError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Could not open the database
    #[error("Connection error: {0}")]
    Connection(String),

    /// A stored row does not decode
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(e) => StateError::Connection(e.to_string()),
            sqlx::Error::Io(e) => StateError::Connection(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StateError::Connection(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StateError::InvalidData(err.to_string())
            }
            sqlx::Error::Database(db_err) => StateError::Database(db_err.to_string()),
            _ => StateError::Database(err.to_string()),
        }
    }
}

impl From<StateError> for meshrelay_core::RelayError {
    fn from(err: StateError) -> Self {
        meshrelay_core::RelayError::Store(err.to_string())
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StateError>;
