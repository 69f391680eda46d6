//! Error types for the entitlement engine.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Entitlement source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed entitlement event: {0}")]
    MalformedEvent(String),

    #[error("Failed to persist {key}: {reason}")]
    PersistenceWriteFailure { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Preference store is locked by another process")]
    Locked,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for GateError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        GateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for GateError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        GateError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, GateError>;
