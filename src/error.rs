//! Error types for patchup operations.

use thiserror::Error;

/// Errors that can occur while building, storing or exchanging patches.
#[derive(Error, Debug)]
pub enum PatchupError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file to patch does not exist.
    #[error("'{0}' not found")]
    FileNotFound(String),

    /// File content is not valid UTF-8 text.
    #[error("'{0}' is not valid UTF-8 text")]
    NotText(String),

    /// A patch blob could not be decoded (base64, authentication tag or compression).
    #[error("Codec error: {0}")]
    Codec(String),

    /// Replayed text does not hash to the hash recorded for the patch.
    #[error("Integrity error: rebuilt {actual} but patch records {expected}")]
    Integrity {
        /// Hash recorded in the chain
        expected: String,
        /// Hash of the reconstructed text
        actual: String,
    },

    /// Strict application refused a patch whose hunks did not all apply.
    #[error("Patch rejected: hunks {failed:?} could not be located")]
    PatchRejected {
        /// Indices of hunks that failed to apply
        failed: Vec<usize>,
    },

    /// Filename is not a single plain path component.
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),

    /// A hash string is not a well-formed content hash.
    #[error("Invalid hash: {0:?}")]
    InvalidHash(String),

    /// Another patch with the same timestamp but a different hash exists.
    #[error("Duplicate timestamp {timestamp} in chain '{filename}'")]
    DuplicateTimestamp {
        /// Chain filename
        filename: String,
        /// Conflicting timestamp
        timestamp: u64,
    },

    /// Patch payload is empty.
    #[error("Patch payload cannot be empty")]
    EmptyPayload,

    /// Signature or public key could not be verified.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Transport failure talking to the server.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with `success=false`.
    #[error("Server error: {0}")]
    Remote(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization of a patch or key file failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Another process holds the cache folder lock.
    #[error("Cache folder {0} is locked by another process")]
    CacheLocked(String),
}

/// Result type for patchup operations.
pub type Result<T> = std::result::Result<T, PatchupError>;
