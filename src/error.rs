use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UmbraError>;

/// Errors surfaced by the persistent-memory checker.
#[derive(Debug, Error)]
pub enum UmbraError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("report serialization error: {0}")]
    Report(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),
}

impl From<csv::Error> for UmbraError {
    fn from(err: csv::Error) -> Self {
        UmbraError::Report(err.to_string())
    }
}
