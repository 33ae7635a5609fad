//! Error types for Ferry

use std::fmt;

/// Unified error type for all Ferry operations
#[derive(Debug)]
pub enum FerryError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol violation (unexpected packet, bad frame, id mismatch)
    Protocol(String),

    /// Server-reported SFTP status that does not map to a category
    Status {
        /// Numeric SSH_FX_* code
        code: u32,
        /// Server-supplied message
        message: String,
    },

    /// Operation on a closed handle or connection
    Closed,

    /// Remote path does not exist
    NotFound,

    /// Remote server denied access
    PermissionDenied,

    /// End of stream
    Eof,

    /// Invalid argument (bad path shape, precondition failure)
    InvalidArgument(String),
}

impl fmt::Display for FerryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FerryError::Io(e) => write!(f, "IO error: {}", e),
            FerryError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FerryError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FerryError::Status { code, message } => {
                write!(f, "sftp: {:?} (status {})", message, code)
            }
            FerryError::Closed => write!(f, "file already closed"),
            FerryError::NotFound => write!(f, "file does not exist"),
            FerryError::PermissionDenied => write!(f, "permission denied"),
            FerryError::Eof => write!(f, "end of stream"),
            FerryError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for FerryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FerryError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FerryError {
    fn from(err: std::io::Error) -> Self {
        FerryError::Io(err)
    }
}

impl FerryError {
    /// Returns true for the end-of-stream error.
    pub fn is_eof(&self) -> bool {
        matches!(self, FerryError::Eof)
    }
}

/// Result type for Ferry operations
pub type FerryResult<T> = Result<T, FerryError>;
