//! Router configuration

use crate::types::{NodeRole, PeerAddress};
use crate::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use veilnet_crypto::PublicKey;

/// Routing behaviour shared by every role a node can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of relays a message traverses (privacy level)
    pub hop_count: usize,
    pub transport: TransportConfig,
    pub tls: TlsConfig,
    pub directory: DirectoryConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interface to bind listeners on
    pub bind_host: String,
    pub connect_timeout_ms: u64,
    /// Bound on any single read or write, including waiting for an ack
    pub io_timeout_ms: u64,
    pub max_frame_bytes: usize,
    /// Concurrent connection handlers per endpoint
    pub max_connections: usize,
    /// Whether onion dispatch waits for the first hop to acknowledge
    pub wait_for_ack: bool,
    /// Delivered payloads buffered for the local consumer before the relay
    /// stops acknowledging
    pub delivery_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Directory holding `cert.pem` and `key.pem`
    pub dir: PathBuf,
    /// Subject CN for a generated certificate; defaults to the advertised host
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub join_timeout_ms: u64,
    /// Refuse to forward to hosts that are not in the local directory
    pub require_known_next_hop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Attempts per peer when propagating a policy update
    pub propagation_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Identity keys allowed to originate policy updates. Empty accepts any
    /// authenticated peer that is in the directory.
    pub authorities: Vec<PublicKey>,
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hop_count(mut self, count: usize) -> Self {
        self.hop_count = count;
        self
    }

    pub fn with_tls(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tls.enabled = true;
        self.tls.dir = dir.into();
        self
    }

    pub fn without_tls(mut self) -> Self {
        self.tls.enabled = false;
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.transport.bind_host = host.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.transport.io_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.directory.join_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.transport.max_connections = max;
        self
    }

    pub fn with_delivery_queue(mut self, capacity: usize) -> Self {
        self.transport.delivery_queue = capacity;
        self
    }

    pub fn with_wait_for_ack(mut self, wait: bool) -> Self {
        self.transport.wait_for_ack = wait;
        self
    }

    pub fn with_require_known_next_hop(mut self, require: bool) -> Self {
        self.directory.require_known_next_hop = require;
        self
    }

    pub fn with_propagation(mut self, attempts: u32, backoff: Duration) -> Self {
        self.policy.propagation_attempts = attempts;
        self.policy.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_policy_authority(mut self, key: PublicKey) -> Self {
        self.policy.authorities.push(key);
        self
    }

    /// Rejects settings that would make the router unusable.
    pub fn validate(&self) -> Result<()> {
        if self.hop_count == 0 {
            return Err(RoutingError::InvalidConfig("hop_count must be at least 1".into()));
        }
        if self.transport.connect_timeout_ms == 0 || self.transport.io_timeout_ms == 0 {
            return Err(RoutingError::InvalidConfig("transport timeouts must be non-zero".into()));
        }
        if self.directory.join_timeout_ms == 0 {
            return Err(RoutingError::InvalidConfig("join_timeout_ms must be non-zero".into()));
        }
        if self.transport.max_connections == 0 {
            return Err(RoutingError::InvalidConfig("max_connections must be at least 1".into()));
        }
        if self.transport.delivery_queue == 0 {
            return Err(RoutingError::InvalidConfig("delivery_queue must be at least 1".into()));
        }
        if self.transport.max_frame_bytes < 1024 {
            return Err(RoutingError::InvalidConfig("max_frame_bytes must be at least 1024".into()));
        }
        if self.policy.propagation_attempts == 0 {
            return Err(RoutingError::InvalidConfig("propagation_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl DirectoryConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl PolicyConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Whether updates signed by `key` may be applied.
    pub fn accepts_origin(&self, key: &PublicKey) -> bool {
        self.authorities.is_empty() || self.authorities.contains(key)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            hop_count: 2,
            transport: TransportConfig::default(),
            tls: TlsConfig::default(),
            directory: DirectoryConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            connect_timeout_ms: 5_000,
            io_timeout_ms: 10_000,
            max_frame_bytes: 16 * 1024 * 1024,
            max_connections: 256,
            wait_for_ack: true,
            delivery_queue: 64,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("tls"),
            hostname: None,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 5_000,
            require_known_next_hop: false,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            propagation_attempts: 3,
            retry_backoff_ms: 250,
            authorities: Vec::new(),
        }
    }
}

/// Everything needed to start one node role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// Fixed node id; a random one is drawn when absent
    #[serde(default)]
    pub node_id: Option<u64>,
    /// Listening port; the role's default when absent, `0` for an ephemeral port
    #[serde(default)]
    pub port: Option<u16>,
    /// Host other peers use to reach this node
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    /// Where the identity secret is persisted; ephemeral when absent
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    #[serde(default)]
    pub bootstrap: Option<PeerAddress>,
    #[serde(default)]
    pub router: RouterConfig,
}

fn default_advertise_host() -> String {
    "localhost".to_string()
}

impl NodeConfig {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            node_id: None,
            port: None,
            advertise_host: default_advertise_host(),
            identity_path: None,
            bootstrap: None,
            router: RouterConfig::default(),
        }
    }

    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = Some(path.into());
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: PeerAddress) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn listen_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.role.default_port())
    }

    pub fn validate(&self) -> Result<()> {
        if self.advertise_host.trim().is_empty() {
            return Err(RoutingError::InvalidConfig("advertise_host must not be empty".into()));
        }
        self.router.validate()
    }
}
