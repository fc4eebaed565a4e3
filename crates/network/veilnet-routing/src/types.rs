//! Core routing types

use crate::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use veilnet_crypto::{IdentityKeyPair, PublicKey};

/// Node identifier in the network
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A `(host, port)` pair. Serialized as a two-element array, `["host", 9000]`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl From<(String, u16)> for PeerAddress {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<PeerAddress> for (String, u16) {
    fn from(address: PeerAddress) -> Self {
        (address.host, address.port)
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl FromStr for PeerAddress {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| RoutingError::InvalidConfig(format!("unterminated IPv6 literal: {s}")))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| RoutingError::InvalidConfig(format!("missing port: {s}")))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| RoutingError::InvalidConfig(format!("missing port: {s}")))?
        };

        if host.is_empty() {
            return Err(RoutingError::InvalidConfig(format!("missing host: {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| RoutingError::InvalidConfig(format!("invalid port in {s}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

/// What the directory knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub address: PeerAddress,
    pub public_key: Option<PublicKey>,
}

impl PeerRecord {
    pub fn new(node_id: NodeId, address: PeerAddress, public_key: Option<PublicKey>) -> Self {
        Self { node_id, address, public_key }
    }
}

/// The role a listener plays on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Entry,
    Relay,
    Exit,
}

impl NodeRole {
    /// Conventional listening port for the role.
    pub fn default_port(&self) -> u16 {
        match self {
            NodeRole::Entry => 9001,
            NodeRole::Relay => 9002,
            NodeRole::Exit => 9003,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Entry => f.write_str("entry"),
            NodeRole::Relay => f.write_str("relay"),
            NodeRole::Exit => f.write_str("exit"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "entry" => Ok(NodeRole::Entry),
            "relay" => Ok(NodeRole::Relay),
            "exit" => Ok(NodeRole::Exit),
            other => Err(RoutingError::InvalidConfig(format!("unknown role: {other}"))),
        }
    }
}

/// A node's own identity. Created once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub address: PeerAddress,
    keys: Arc<IdentityKeyPair>,
}

impl NodeIdentity {
    pub fn new(node_id: NodeId, address: PeerAddress, keys: Arc<IdentityKeyPair>) -> Self {
        Self { node_id, address, keys }
    }

    pub fn keys(&self) -> &IdentityKeyPair {
        &self.keys
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// The record this node publishes to the directory.
    pub fn record(&self) -> PeerRecord {
        PeerRecord::new(self.node_id, self.address.clone(), Some(self.public_key()))
    }
}
