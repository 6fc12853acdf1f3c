use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClaimStoreError {
    #[error("Claim store agent does not recognize the message body's data file path: '{}'", path.display())]
    UnrecognizedDataFilePath { path: PathBuf },

    #[error("{expected} data file cannot handle a data file in the '{actual}' state: '{}'", path.display())]
    UnexpectedState {
        path: PathBuf,
        expected: &'static str,
        actual: String,
    },

    #[error("Cannot {operation} a data file in the {state} state: '{file}'")]
    IllegalTransition {
        operation: &'static str,
        state: &'static str,
        file: String,
    },

    #[error("Claim store agent does not support the tracking mode '{0}'")]
    UnsupportedTrackingMode(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Claim token store error: {0}")]
    TokenStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl ClaimStoreError {
    /// Errors that must bring the host process down instead of being
    /// absorbed by the collection loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClaimStoreError::Fatal(_) => true,
            ClaimStoreError::Io(err) => err.kind() == std::io::ErrorKind::OutOfMemory,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClaimStoreError>;
