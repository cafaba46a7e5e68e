//! Error types for the dirhash crate

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while hashing content
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory traversal error
    #[error("failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    /// Path does not exist
    #[error("path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    /// Failed to hash file
    #[error("failed to hash file {}: {source}", .path.display())]
    HashFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for hashing operations
pub type Result<T> = std::result::Result<T, Error>;
