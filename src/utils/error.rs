use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;

#[derive(Debug)]
pub enum ApngError {
    IoError(io::Error),
    UnsupportedFormat(String),
    CorruptImage(String),
    InsufficientMemory(String),
}

impl Error for ApngError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApngError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ApngError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ApngError::IoError(err) => write!(f, "I/O error: {}", err),
            ApngError::UnsupportedFormat(what) => write!(f, "Unsupported APNG format: {}", what),
            ApngError::CorruptImage(what) => write!(f, "Corrupt APNG image: {}", what),
            ApngError::InsufficientMemory(what) => write!(f, "Not enough memory: {}", what),
        }
    }
}

impl From<io::Error> for ApngError {
    fn from(error: io::Error) -> Self {
        ApngError::IoError(error)
    }
}

impl From<std::collections::TryReserveError> for ApngError {
    fn from(error: std::collections::TryReserveError) -> Self {
        ApngError::InsufficientMemory(error.to_string())
    }
}

// Result type alias for decoder operations
pub type ApngResult<T> = Result<T, ApngError>;
