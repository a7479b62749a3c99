//! Error types for sandboxed filesystem operations.

use std::path::PathBuf;

/// Result type for sandboxed filesystem operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur during sandboxed filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Path validation failed - potential traversal attempt
    #[error("Path validation failed: {path:?} - {reason}")]
    PathValidation { path: PathBuf, reason: String },

    /// Directory creation failed
    #[error("Failed to create directory: {path:?} - {source}")]
    DirectoryCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Refused to remove the sandbox base directory itself
    #[error("Refusing to remove sandbox base directory: {path:?}")]
    BaseRemovalRefused { path: PathBuf },

    /// Publish target could not be written atomically
    #[error("Failed to publish {source_path:?} to {target:?}: {reason}")]
    Publish {
        source_path: PathBuf,
        target: PathBuf,
        reason: String,
    },
}
