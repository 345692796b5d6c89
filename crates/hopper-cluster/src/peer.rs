//! Membership directory seam.
//!
//! The gossip layer itself lives outside this repository; the core only
//! ever asks "give me the live API endpoints of role X" through the
//! [`Peer`] trait. [`StaticPeer`] answers from a fixed, configured
//! membership.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// Role a node advertises to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Buffers producer traffic in a segment queue.
    Ingest,
    /// Holds replicated merged segments.
    Store,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Ingest => "ingest",
            NodeType::Store => "store",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ingest" => Ok(NodeType::Ingest),
            "store" => Ok(NodeType::Store),
            other => Err(ClusterError::InvalidNodeType(other.to_string())),
        }
    }
}

/// Tag published by each live node: its role and API endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTag {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub api_addr: String,
    pub api_port: u16,
}

impl NodeTag {
    /// Parse a `host:port` endpoint into a tag of the given role.
    pub fn parse(node_type: NodeType, endpoint: &str) -> Result<Self> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::InvalidEndpoint(endpoint.to_string()))?;
        if host.is_empty() {
            return Err(ClusterError::InvalidEndpoint(endpoint.to_string()));
        }
        let api_port = port
            .parse()
            .map_err(|_| ClusterError::InvalidEndpoint(endpoint.to_string()))?;
        Ok(Self {
            node_type,
            api_addr: host.to_string(),
            api_port,
        })
    }

    /// The `host:port` form used to build request URLs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.api_addr, self.api_port)
    }
}

/// Directory of live nodes, queryable by role.
pub trait Peer: Send + Sync {
    /// Current API `host:port` endpoints for the given role.
    fn current(&self, node_type: NodeType) -> Result<Vec<String>>;

    /// JSON-serializable dump of membership state, for debugging.
    fn state(&self) -> serde_json::Value;
}

/// Fixed membership fed from configuration.
pub struct StaticPeer {
    members: Vec<NodeTag>,
}

impl StaticPeer {
    /// Build a directory from `host:port` endpoint lists per role.
    pub fn new<S: AsRef<str>>(ingest: &[S], store: &[S]) -> Result<Self> {
        let mut members = Vec::with_capacity(ingest.len() + store.len());
        for endpoint in ingest {
            members.push(NodeTag::parse(NodeType::Ingest, endpoint.as_ref())?);
        }
        for endpoint in store {
            members.push(NodeTag::parse(NodeType::Store, endpoint.as_ref())?);
        }
        Ok(Self { members })
    }
}

impl Peer for StaticPeer {
    fn current(&self, node_type: NodeType) -> Result<Vec<String>> {
        Ok(self
            .members
            .iter()
            .filter(|tag| tag.node_type == node_type)
            .map(NodeTag::endpoint)
            .collect())
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({
            "members": self.members,
            "num_members": self.members.len(),
        })
    }
}
