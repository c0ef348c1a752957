use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to start encoder: {0}")]
    Spawn(String),

    #[error("Encoder input closed: {0}")]
    EncoderWrite(io::Error),

    #[error("Settings error: {0}")]
    Settings(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
