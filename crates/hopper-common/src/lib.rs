//! Shared error type, record codec and metric bundles for the hopper cluster.

pub mod error;
pub mod metrics;
pub mod records;

pub use error::{Error, Result};
