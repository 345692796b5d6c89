//! Error types shared across the hopper crates.

use thiserror::Error;

/// Result type alias for hopper operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds shared by the record codec and the HTTP surfaces.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record is missing a valid leading identifier
    #[error("invalid record identifier: {0}")]
    InvalidUuid(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True when the error is the invalid-identifier kind, which callers
    /// translate to a client-visible parse failure rather than a retry.
    pub fn is_invalid_uuid(&self) -> bool {
        matches!(self, Error::InvalidUuid(_))
    }
}
