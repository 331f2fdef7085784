//! Error handling for haul

use thiserror::Error;

use crate::types::SourceType;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported source type: {0}")]
    UnsupportedSourceType(SourceType),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("daemon process error: {0}")]
    Process(String),

    #[error("download engine error: {0}")]
    Engine(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<gosh_dl::EngineError> for Error {
    fn from(err: gosh_dl::EngineError) -> Self {
        match err {
            gosh_dl::EngineError::NotFound(msg) => Error::NotFound(msg),
            gosh_dl::EngineError::Network { message, .. } => Error::Transport(message),
            gosh_dl::EngineError::Storage { message, .. } => Error::Io(std::io::Error::other(message)),
            other => Error::Engine(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
