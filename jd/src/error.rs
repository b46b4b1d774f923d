//! Error types for job documents

use std::path::PathBuf;

/// Errors raised while reading, parsing or writing job documents
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("No chat blocks found for ids: {}", .0.join(", "))]
    BlocksNotFound(Vec<String>),

    #[error("File {path} is locked by process {pid}")]
    Locked { path: PathBuf, pid: i32 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DocError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for document operations
pub type DocResult<T> = std::result::Result<T, DocError>;
