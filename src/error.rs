//! Error types for tablestore.

use std::io;
use thiserror::Error;

/// Result type alias for tablestore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for write-engine operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from the backing store.
    #[error("I/O error: {0}")]
    Io(String),

    /// The codec rejected a block or record of a data file.
    #[error("Corrupt file: {0}")]
    CorruptFile(String),

    /// Operation on a writer that has observed a fatal flush failure.
    #[error("Writer is poisoned by a previous flush failure")]
    WriterPoisoned,

    /// A background compaction task failed; reported at the next trigger.
    #[error("Compaction failed: {0}")]
    CompactionFailed(String),

    /// The operation was cancelled (e.g. writer closed mid-compaction).
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corrupt-file error with the given message.
    pub fn corrupt_file<S: Into<String>>(msg: S) -> Self {
        Error::CorruptFile(msg.into())
    }

    /// Create a compaction-failed error.
    pub fn compaction<S: Into<String>>(msg: S) -> Self {
        Error::CompactionFailed(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error indicates data corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptFile(_))
    }

    /// Check if this error is fatal to the writer.
    ///
    /// Fatal errors poison the writer; non-fatal ones (compaction failures,
    /// cancellation) leave it usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::CorruptFile(_) | Error::WriterPoisoned | Error::Internal(_)
        )
    }
}
