//! Error types for Flotilla

use ulid::Ulid;

/// Result type alias for Flotilla operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Flotilla
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object store errors
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Block metadata could not be read
    #[error("Block metadata error for {block}: {reason}")]
    BlockMeta { block: String, reason: String },
    /// Corrupted local blocks aborted the sync pass
    #[error("Corrupted blocks found: {blocks:?}")]
    SyncBlockCorrupted { blocks: Vec<String> },
    /// Sync finished but some blocks could not be shipped
    #[error(
        "Failed to sync {failed_uploads} upload(s) and {corrupted_blocks} corrupted block(s), {uploaded} block(s) uploaded"
    )]
    SyncIncomplete {
        uploaded: usize,
        failed_uploads: usize,
        corrupted_blocks: usize,
    },
    /// A compacted block overlaps blocks already in the bucket
    #[error("Shipping compacted block {block} is blocked, overlap spotted: {details}")]
    BlockOverlap { block: Ulid, details: String },
    /// Upload log carries an unrecognized version
    #[error("Unexpected upload log version {version}")]
    UploadLogVersion { version: u32 },
    /// Endpoint transport error
    #[error("Transport error: {0}")]
    Transport(String),
    /// Timeout
    #[error("Operation timed out")]
    Timeout,
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
