//! A running node: one relay endpoint plus the sender side.

use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::frame::{Frame, FrameKind};
use crate::handshake::{Ack, HandshakeClient};
use crate::onion::OnionCodec;
use crate::path::{Path, PathSelector};
use crate::policy::{BlockedDestinationSet, Membership, PolicyAdministrator};
use crate::relay::{RelayEndpoint, RelayEvent, RelayHandle, RelayStatsSnapshot};
use crate::transport::Transport;
use crate::types::{NodeId, NodeIdentity, NodeRole, PeerAddress, PeerRecord};
use crate::{Result, RoutingError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use veilnet_crypto::IdentityKeyPair;

/// What an anonymous send did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Node ids in path order
    pub path: Vec<NodeId>,
    pub first_hop: PeerAddress,
    /// Bytes written to the first hop, framing included
    pub bytes_sent: usize,
    pub ack: Ack,
}

pub struct OnionNode {
    role: NodeRole,
    identity: NodeIdentity,
    config: NodeConfig,
    directory: Arc<PeerDirectory>,
    blocked: Arc<BlockedDestinationSet>,
    client: HandshakeClient,
    endpoint: RelayEndpoint,
    handle: RelayHandle,
    selector: PathSelector,
    codec: OnionCodec,
    hop_count: AtomicUsize,
}

impl OnionNode {
    /// Loads key and TLS material, binds the role's port and starts serving.
    ///
    /// Failures here are fatal to the node: bad configuration, unusable key
    /// or TLS material, or a port that cannot be bound.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let keys = match &config.identity_path {
            Some(path) => IdentityKeyPair::load_or_generate(path)?,
            None => IdentityKeyPair::generate(),
        };
        let transport = Transport::from_config(&config.router, &config.advertise_host)?;
        let listener = transport.bind(config.listen_port()).await?;
        let port = listener.local_addr()?.port();

        let node_id = config.node_id.map(NodeId).unwrap_or_else(NodeId::random);
        let address = PeerAddress::new(config.advertise_host.clone(), port);
        let identity = NodeIdentity::new(node_id, address, Arc::new(keys));

        let directory = Arc::new(PeerDirectory::new(identity.record()));
        let blocked = Arc::new(BlockedDestinationSet::new());
        let endpoint = RelayEndpoint::new(
            identity.clone(),
            Arc::clone(&directory),
            Arc::clone(&blocked),
            transport.clone(),
            config.router.clone(),
        );
        let handle = endpoint.serve(listener)?;

        info!(
            node_id = %identity.node_id,
            role = %config.role,
            address = %identity.address,
            public_key = %identity.public_key(),
            "node started"
        );

        Ok(Self {
            role: config.role,
            hop_count: AtomicUsize::new(config.router.hop_count),
            identity,
            directory,
            blocked,
            client: HandshakeClient::new(transport),
            endpoint,
            handle,
            selector: PathSelector::new(),
            codec: OnionCodec::new(),
            config,
        })
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id
    }

    /// Address advertised to peers.
    pub fn address(&self) -> &PeerAddress {
        &self.identity.address
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn record(&self) -> PeerRecord {
        self.identity.record()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn blocked(&self) -> &Arc<BlockedDestinationSet> {
        &self.blocked
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.endpoint.subscribe()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.endpoint.stats()
    }

    /// Payloads delivered at this node. See [`RelayEndpoint::take_deliveries`].
    pub fn take_deliveries(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.endpoint.take_deliveries()
    }

    /// Joins through `bootstrap` within the configured join timeout.
    pub async fn join(&self, bootstrap: &PeerAddress) -> Result<Vec<PeerRecord>> {
        self.directory
            .join(&self.client, bootstrap, self.config.router.directory.join_timeout())
            .await
    }

    /// Joins through the bootstrap named in the node configuration.
    pub async fn join_bootstrap(&self) -> Result<Vec<PeerRecord>> {
        let bootstrap = self
            .config
            .bootstrap
            .as_ref()
            .ok_or_else(|| RoutingError::InvalidConfig("no bootstrap configured".into()))?;
        self.join(bootstrap).await
    }

    /// Joins every remote peer in the directory so each of them registers
    /// this node and its key. Returns how many answered.
    pub async fn announce(&self) -> usize {
        let mut reached = 0;
        for peer in self.directory.remote_peers() {
            match self.join(&peer.address).await {
                Ok(_) => reached += 1,
                Err(e) => warn!(peer = %peer.node_id, error = e.observable_type(), "announce failed"),
            }
        }
        reached
    }

    pub fn privacy_level(&self) -> usize {
        self.hop_count.load(Ordering::Relaxed)
    }

    pub fn set_privacy_level(&self, hops: usize) -> Result<()> {
        if hops == 0 {
            return Err(RoutingError::InvalidConfig("privacy level must be at least 1".into()));
        }
        self.hop_count.store(hops, Ordering::Relaxed);
        info!(hops, "privacy level changed");
        Ok(())
    }

    pub fn select_path(&self) -> Result<Path> {
        self.selector.select_path(&self.directory, self.privacy_level())
    }

    /// Picks a fresh path at the current privacy level and sends `payload`
    /// along it.
    pub async fn send_anonymous(&self, payload: &[u8]) -> Result<Dispatch> {
        let path = self.select_path()?;
        self.send_via(&path, payload).await
    }

    /// Wraps `payload` for `path` and hands it to the first hop.
    pub async fn send_via(&self, path: &Path, payload: &[u8]) -> Result<Dispatch> {
        let layer = self.codec.wrap(path, payload)?;
        let frame = Frame::new(FrameKind::Onion, layer.to_bytes()?);
        let first_hop = path.first().record.address.clone();

        let ack = self
            .client
            .send(&first_hop, &frame, self.config.router.transport.wait_for_ack)
            .await
            .map_err(|e| RoutingError::ForwardingFailed(format!("{first_hop}: {e}")))?;
        debug!(hops = path.len(), bytes = frame.wire_len(), "onion dispatched");

        Ok(Dispatch {
            path: path.node_ids(),
            first_hop,
            bytes_sent: frame.wire_len(),
            ack,
        })
    }

    /// Policy administration backed by this node's directory and blocked set.
    pub fn policy_administrator(&self, membership: Arc<dyn Membership>) -> PolicyAdministrator {
        PolicyAdministrator::new(
            self.identity.clone(),
            membership,
            Arc::clone(&self.blocked),
            Arc::clone(&self.directory),
            self.client.clone(),
            self.config.router.policy.clone(),
        )
    }

    /// Stops accepting new connections.
    pub fn shutdown(&self) {
        info!(node_id = %self.identity.node_id, "node shutting down");
        self.handle.close();
    }
}
