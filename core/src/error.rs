//! Crate-wide error type.

use thiserror::Error;

use crate::envelope::ProtocolError;

#[derive(Debug, Error)]
pub enum MistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown {service} action: {action}")]
    UnknownAction { service: String, action: String },

    #[error("llm request failed: {0}")]
    Llm(String),
}

pub type Result<T> = std::result::Result<T, MistError>;
