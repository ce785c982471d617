//! Error types for chkmap

use crate::model::{ChkKey, Key};
use thiserror::Error;

/// Result type alias for chkmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in chkmap operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Serialized node bytes are malformed. Treated as data corruption.
    #[error("Invalid node format: {0}")]
    Format(String),

    #[error("Inconsistent delta: {0}")]
    InconsistentDelta(String),

    #[error("Key not found: {0}")]
    KeyNotFound(Key),

    /// The store has no bytes for a referenced record.
    #[error("Record absent from store: {0}")]
    Absent(ChkKey),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid content key: {0}")]
    InvalidChkKey(String),

    #[error("Unknown search key function: {0}")]
    UnknownSearchKey(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store file: {0}")]
    InvalidFile(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Ref not found: {0}")]
    RefNotFound(String),

    #[error("Config error: {0}")]
    Config(String),
}
