//! Error types for coop-core

use thiserror::Error;

/// Result type alias using coop-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coop-core operations
///
/// Remote failures are not represented here: they are captured per record by
/// the sync engine (see [`crate::remote::RemoteError`]) and never escape a cycle.
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error from the local store
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found in the local store
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be parsed or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A coalesced sync cycle this caller was waiting on failed
    #[error("Sync cycle failed: {0}")]
    Cycle(String),
}
