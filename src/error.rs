use crate::parser::ParseError;
use std::io;

/// Central error type for the ember engine.
#[derive(Debug)]
pub enum EmberError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Error during HTTP request parsing.
    Parse(ParseError),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for EmberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmberError::Io(e) => write!(f, "I/O error: {}", e),
            EmberError::Parse(e) => write!(f, "Parse error: {:?}", e),
            EmberError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for EmberError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmberError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EmberError {
    fn from(e: io::Error) -> Self {
        EmberError::Io(e)
    }
}

impl From<ParseError> for EmberError {
    fn from(e: ParseError) -> Self {
        EmberError::Parse(e)
    }
}

pub type EmberResult<T> = Result<T, EmberError>;
