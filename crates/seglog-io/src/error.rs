//! I/O error types.

use std::path::PathBuf;

/// Errors from the segment file primitives.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Underlying OS I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// File not found.
    #[error("file not found: {path}")]
    NotFound { path: PathBuf },

    /// The reader or appender was already closed.
    #[error("file handle already closed: {path}")]
    Closed { path: PathBuf },

    /// A previous write failed and the file contents are unknown.
    #[error("appender poisoned by an earlier write failure: {path}")]
    Poisoned { path: PathBuf },
}

impl IoError {
    /// Maps a `NotFound` OS error onto [`IoError::NotFound`] for `path`.
    pub(crate) fn from_open(err: std::io::Error, path: &std::path::Path) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io { source: err }
        }
    }
}
