//! The ingest API: accepts producer record batches into the segment
//! queue and hands pending segments out to consumers, one reader per
//! segment, under a per-reservation deadline.

mod api;
mod config;

pub use api::IngestApi;
pub use config::IngestConfig;
