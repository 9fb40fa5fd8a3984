//! Error taxonomy shared by the front-end, the node client and the storage node.
//!
//! Every variant carries enough context to produce the text a client sees, so
//! handlers resolve local failures with [`DfsError::reply_text`] instead of
//! inventing messages at each call site.

use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DfsError>;

#[derive(Debug, Error)]
pub enum DfsError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The path is not rooted at the expected namespace marker.
    #[error("destination must start with {expected}")]
    InvalidDestination { expected: String },

    /// A `..` or absolute component would leave the namespace root.
    #[error("path escapes its namespace: {0}")]
    PathEscape(String),

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("transfer truncated after {received} of {expected} bytes")]
    TruncatedTransfer { expected: u64, received: u64 },

    #[error("nothing to {0}")]
    EmptyResult(EmptyKind),

    /// Local persistence failed; the peer connection is still usable.
    #[error("storage error: {0}")]
    Storage(#[source] io::Error),
}

/// Which operation came back with nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyKind {
    Archive,
    Listing,
}

impl fmt::Display for EmptyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyKind::Archive => f.write_str("archive"),
            EmptyKind::Listing => f.write_str("list"),
        }
    }
}

impl DfsError {
    pub fn timed_out(what: &str) -> Self {
        DfsError::Connection(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }

    /// Text sent back to a client when this error ends an operation.
    pub fn reply_text(&self) -> String {
        match self {
            DfsError::InvalidCommand(_) => "Invalid command.".to_string(),
            DfsError::InvalidDestination { expected } => {
                format!("Destination must start with {expected}.")
            }
            DfsError::PathEscape(_) => "Destination path is not allowed.".to_string(),
            DfsError::UnsupportedType(_) => "Unsupported file type.".to_string(),
            DfsError::NotFound(_) => "File not found.".to_string(),
            DfsError::Connection(_) => "Cannot connect to storage node.".to_string(),
            DfsError::TruncatedTransfer { .. } => "File transfer was interrupted.".to_string(),
            DfsError::EmptyResult(EmptyKind::Archive) => {
                "No files found to create tar archive.".to_string()
            }
            DfsError::EmptyResult(EmptyKind::Listing) => {
                "No files found in the specified path.".to_string()
            }
            DfsError::Storage(_) => "Failed to store file.".to_string(),
        }
    }

    /// Whether the failure happened on the byte stream itself, leaving it in an
    /// unknown position.
    pub fn breaks_stream(&self) -> bool {
        matches!(
            self,
            DfsError::Connection(_) | DfsError::TruncatedTransfer { .. }
        )
    }
}
