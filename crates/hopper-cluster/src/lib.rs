//! Seams onto the cluster's external collaborators: the membership
//! directory and the HTTP transport.

pub mod client;
pub mod error;
pub mod peer;

pub use client::{Client, HttpClient, Response};
pub use error::{ClusterError, Result};
pub use peer::{NodeTag, NodeType, Peer, StaticPeer};
