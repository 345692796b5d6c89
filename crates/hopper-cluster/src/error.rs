//! Cluster seam error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid node type: {0:?}")]
    InvalidNodeType(String),

    #[error("invalid endpoint: {0:?}")]
    InvalidEndpoint(String),

    #[error("membership error: {0}")]
    Membership(String),
}
