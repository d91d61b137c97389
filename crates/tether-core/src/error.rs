use std::time::Duration;

use thiserror::Error;

/// Core error type for tether operations.
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Service lifecycle closed")]
    Closed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        TetherError::Serialization(e.to_string())
    }
}

/// Result type alias using TetherError.
pub type Result<T> = std::result::Result<T, TetherError>;
