//! Error types for scansync
//!
//! Errors fall into three scopes that decide how far they propagate:
//!
//! - **Archive scope**: an upload failed or a matched bundle could not be
//!   read. The archive stays unmarked and is retried on the next run; the
//!   project loop continues.
//! - **Project scope**: the project directory could not be scanned, its
//!   ledger directory could not be created, or its lock is held. The project
//!   is abandoned; other projects continue.
//! - **Run scope**: configuration problems such as an uncreatable ledger root.
//!   These abort the whole run.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in scansync
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for all scansync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Transport-level HTTP failure (connection refused, timeout, ...)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Project data directory missing or unreadable
    #[error("Cannot scan {path:?}: {reason}")]
    Scan {
        /// Directory that failed to scan
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// A matched bundle whose metadata or contents could not be read
    #[error("Cannot read bundle {name}: {reason}")]
    UnreadableBundle {
        /// Bundle base name
        name: String,
        /// Bundle location
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Per-project ledger directory could not be created
    #[error("Cannot create ledger directory {path:?}: {source}")]
    LedgerCreate {
        /// Ledger directory
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Ledger read or write failure
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Remote system rejected an upload
    #[error("Upload failed{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Upload {
        /// HTTP status, when the remote answered at all
        status: Option<u16>,
        /// Response body or transport detail
        message: String,
    },

    /// A resource the uploader tried to create already exists
    #[error("Resource already exists: {0}")]
    ResourceExists(String),

    /// Remote project lookup failed
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    /// Remote subject listing failed
    #[error("Subject listing failed: {0}")]
    SubjectListing(String),

    /// Another process holds the project's advisory lock
    #[error("Lock {path:?} is held by {owner}")]
    LockHeld {
        /// Lock file path
        path: PathBuf,
        /// Owner description read from the lock file
        owner: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Building the compressed transport copy failed
    #[error("Packing error: {0}")]
    Packing(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create an upload error
    pub fn upload(status: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::Upload {
            status,
            message: message.into(),
        }
    }

    /// Create a ledger error with a custom message
    pub fn ledger(msg: impl Into<String>) -> Self {
        SyncError::Ledger(msg.into())
    }

    /// Create a scan error for `path`
    pub fn scan(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SyncError::Scan {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::InvalidConfiguration(msg.into())
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Upload { status, .. } => *status,
            SyncError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            SyncError::LedgerCreate { path, .. } => {
                format!(
                    "Cannot create ledger directory {:?}. Check that the ledger root is writable.",
                    path
                )
            }
            SyncError::LockHeld { path, owner } => {
                format!(
                    "Project is being synchronised by {}. If that process is gone, remove {:?}.",
                    owner, path
                )
            }
            SyncError::Http(e) if e.is_timeout() => {
                "Remote call timed out. The archive stays unmarked and will be retried on the next run."
                    .to_string()
            }
            _ => self.to_string(),
        }
    }
}
