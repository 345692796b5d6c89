//! Queue error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no segments available for reading")]
    NoSegmentsAvailable,

    #[error("queue directory is locked by another process: {path}")]
    Locked { path: PathBuf },
}

impl QueueError {
    /// True when a dequeue found nothing to read; the HTTP surface maps
    /// this to 404.
    pub fn is_no_segments(&self) -> bool {
        matches!(self, QueueError::NoSegmentsAvailable)
    }
}
