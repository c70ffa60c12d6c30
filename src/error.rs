use thiserror::Error;

use crate::usb::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned from every stream entry point.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("out of memory")]
    NoMem,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid size: expected at most {expected} bytes, got {actual}")]
    InvalidSize { expected: usize, actual: usize },

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Error::Timeout,
            other => Error::Transport(other),
        }
    }
}
