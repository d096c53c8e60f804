use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors shared by every layer of the index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A caller supplied a negative version/position, a negative range
    /// bound, or an empty required input. Nothing was applied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A table file failed its checksum or is structurally damaged.
    #[error("corrupt index file {path}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    /// A table file carries an unknown header marker or format version.
    #[error("invalid table format in {path}: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    /// The manifest failed its checksum or could not be parsed.
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    /// Replaying the log during startup did not reach the target position.
    #[error("index recovery failed: {0}")]
    RecoveryFailed(String),

    /// The operation is not allowed in the index's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A background flush failed permanently. Queued data is still readable
    /// but no further writes are accepted; restart to recover from the log.
    #[error("index faulted: {0}")]
    Faulted(String),

    /// The table was deleted before a reader could acquire it.
    #[error("table {0} has already been disposed")]
    TableDisposed(PathBuf),

    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl IndexError {
    /// Returns `true` for errors that mean on-disk state cannot be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            IndexError::CorruptIndex { .. }
                | IndexError::InvalidFormat { .. }
                | IndexError::CorruptManifest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
