//! Blocked destinations and their administration.
//!
//! Only actors holding an administrative role in the external membership
//! system may change the blocked set. A change is applied locally first, then
//! sent to every known peer as an explicit `Policy` frame; each peer is
//! retried independently and reported as acknowledged or unreachable.
//!
//! Every `Policy` frame is a [`PolicyEnvelope`] tagged with a key shared only
//! by the originating node and the receiver. Receivers apply it only when the
//! origin is in their directory with that key (and, if configured, among the
//! policy authorities).

use crate::config::PolicyConfig;
use crate::directory::PeerDirectory;
use crate::frame::{Frame, FrameKind};
use crate::handshake::HandshakeClient;
use crate::types::{NodeId, NodeIdentity, PeerRecord};
use crate::{Result, RoutingError};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use veilnet_crypto::{IdentityKeyPair, PublicKey};

/// Destinations (hostnames, `host:port` pairs, URL fragments) a relay refuses
/// to forward to or deliver. Matching is case-insensitive and by substring.
#[derive(Debug, Default)]
pub struct BlockedDestinationSet {
    entries: RwLock<BTreeSet<String>>,
}

fn normalize(destination: &str) -> Result<String> {
    let normalized = destination.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(RoutingError::InvalidDestination("destination is empty".into()));
    }
    Ok(normalized)
}

impl BlockedDestinationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, destination: &str) -> Result<bool> {
        let normalized = normalize(destination)?;
        Ok(self.entries.write().insert(normalized))
    }

    pub fn remove(&self, destination: &str) -> Result<bool> {
        let normalized = normalize(destination)?;
        Ok(self.entries.write().remove(&normalized))
    }

    /// Exact membership of a normalized entry.
    pub fn contains(&self, destination: &str) -> bool {
        normalize(destination)
            .map(|normalized| self.entries.read().contains(&normalized))
            .unwrap_or(false)
    }

    /// First blocked entry occurring anywhere in `candidate`.
    pub fn matches(&self, candidate: &str) -> Option<String> {
        let candidate = candidate.to_lowercase();
        self.entries
            .read()
            .iter()
            .find(|entry| candidate.contains(entry.as_str()))
            .cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Applies an update. Returns whether the set changed.
    pub fn apply(&self, update: &PolicyUpdate) -> Result<bool> {
        match update.action {
            PolicyAction::Ban => self.insert(&update.destination),
            PolicyAction::Unban => self.remove(&update.destination),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Ban,
    Unban,
}

/// `{"action":"ban","actor":"alice","destination":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub action: PolicyAction,
    /// Administrator who requested the change
    pub actor: String,
    pub destination: String,
}

impl PolicyUpdate {
    pub fn ban(actor: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Ban,
            actor: actor.into(),
            destination: destination.into(),
        }
    }

    pub fn unban(actor: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Unban,
            actor: actor.into(),
            destination: destination.into(),
        }
    }
}

/// Body of a `Policy` frame.
///
/// `tag` is a hex HMAC over the origin id and the update, keyed from the
/// X25519 agreement between the origin's and the receiver's identity keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEnvelope {
    pub origin: NodeId,
    pub update: PolicyUpdate,
    pub tag: String,
}

impl PolicyEnvelope {
    /// Tags `update` from `origin` for the holder of `recipient`.
    pub fn sign(origin: &NodeIdentity, recipient: &PublicKey, update: PolicyUpdate) -> Result<Self> {
        let message = Self::message(origin.node_id, &update)?;
        let tag = origin.keys().authenticate(recipient, &message)?;
        Ok(Self {
            origin: origin.node_id,
            update,
            tag: hex::encode(tag),
        })
    }

    /// Checks the tag against the origin's published key.
    pub fn verify(&self, local: &IdentityKeyPair, origin_key: &PublicKey) -> Result<()> {
        let denied = || RoutingError::PolicyDenied {
            actor: self.update.actor.clone(),
        };
        let tag = hex::decode(&self.tag).map_err(|_| denied())?;
        let message = Self::message(self.origin, &self.update)?;
        local.verify(origin_key, &message, &tag).map_err(|_| denied())
    }

    fn message(origin: NodeId, update: &PolicyUpdate) -> Result<Vec<u8>> {
        let mut message = origin.0.to_be_bytes().to_vec();
        message.extend_from_slice(&serde_json::to_vec(update)?);
        Ok(message)
    }
}

/// Role lookup in the external membership system.
#[async_trait]
pub trait Membership: Send + Sync {
    async fn is_admin(&self, actor: &str) -> bool;
}

/// Fixed list of administrators.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    admins: HashSet<String>,
}

impl StaticMembership {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_admin(mut self, actor: impl Into<String>) -> Self {
        self.admins.insert(actor.into());
        self
    }
}

#[async_trait]
impl Membership for StaticMembership {
    async fn is_admin(&self, actor: &str) -> bool {
        self.admins.contains(actor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationStatus {
    Acknowledged { attempts: u32 },
    Unreachable { attempts: u32, reason: String },
}

/// Per-peer outcome of propagating one update.
#[derive(Debug, Clone)]
pub struct PropagationReport {
    pub update: PolicyUpdate,
    /// Whether the local set changed
    pub changed_locally: bool,
    pub peers: BTreeMap<NodeId, PropagationStatus>,
}

impl PropagationReport {
    pub fn acknowledged(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, status)| matches!(status, PropagationStatus::Acknowledged { .. }))
            .map(|(node_id, _)| *node_id)
            .collect()
    }

    pub fn unreachable(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, status)| matches!(status, PropagationStatus::Unreachable { .. }))
            .map(|(node_id, _)| *node_id)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.unreachable().is_empty()
    }
}

pub struct PolicyAdministrator {
    identity: NodeIdentity,
    membership: Arc<dyn Membership>,
    blocked: Arc<BlockedDestinationSet>,
    directory: Arc<PeerDirectory>,
    client: HandshakeClient,
    config: PolicyConfig,
}

impl PolicyAdministrator {
    pub fn new(
        identity: NodeIdentity,
        membership: Arc<dyn Membership>,
        blocked: Arc<BlockedDestinationSet>,
        directory: Arc<PeerDirectory>,
        client: HandshakeClient,
        config: PolicyConfig,
    ) -> Self {
        Self {
            identity,
            membership,
            blocked,
            directory,
            client,
            config,
        }
    }

    /// Blocks `destination` here and on every known peer.
    ///
    /// Non-administrators get `PolicyDenied` and nothing changes anywhere.
    pub async fn ban_destination(&self, actor: &str, destination: &str) -> Result<PropagationReport> {
        self.administer(PolicyUpdate::ban(actor, destination)).await
    }

    pub async fn unban_destination(&self, actor: &str, destination: &str) -> Result<PropagationReport> {
        self.administer(PolicyUpdate::unban(actor, destination)).await
    }

    async fn administer(&self, mut update: PolicyUpdate) -> Result<PropagationReport> {
        if !self.membership.is_admin(&update.actor).await {
            warn!(actor = %update.actor, action = ?update.action, "policy change denied");
            return Err(RoutingError::PolicyDenied { actor: update.actor });
        }
        update.destination = normalize(&update.destination)?;

        let changed_locally = self.blocked.apply(&update)?;
        info!(actor = %update.actor, action = ?update.action, destination = %update.destination, "policy applied locally");

        let peers = self.propagate(&update).await?;
        let report = PropagationReport {
            update,
            changed_locally,
            peers,
        };
        info!(
            acknowledged = report.acknowledged().len(),
            unreachable = report.unreachable().len(),
            "policy propagated"
        );
        Ok(report)
    }

    async fn propagate(&self, update: &PolicyUpdate) -> Result<BTreeMap<NodeId, PropagationStatus>> {
        let peers = self.directory.remote_peers();
        let deliveries = peers.iter().map(|peer| self.deliver(peer, update));
        let statuses = join_all(deliveries).await;
        Ok(peers
            .iter()
            .map(|peer| peer.node_id)
            .zip(statuses)
            .collect())
    }

    async fn deliver(&self, peer: &PeerRecord, update: &PolicyUpdate) -> PropagationStatus {
        let frame = match self.envelope_for(peer, update) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer.node_id, error = e.observable_type(), "cannot address policy update");
                return PropagationStatus::Unreachable {
                    attempts: 0,
                    reason: e.to_string(),
                };
            }
        };

        let attempts = self.config.propagation_attempts.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.client.send(&peer.address, &frame, true).await {
                Ok(_) => {
                    debug!(peer = %peer.node_id, attempt, "policy acknowledged");
                    return PropagationStatus::Acknowledged { attempts: attempt };
                }
                Err(e) => {
                    debug!(peer = %peer.node_id, attempt, error = e.observable_type(), "policy delivery failed");
                    reason = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    }
                }
            }
        }
        warn!(peer = %peer.node_id, address = %peer.address, "peer unreachable for policy update");
        PropagationStatus::Unreachable { attempts, reason }
    }

    fn envelope_for(&self, peer: &PeerRecord, update: &PolicyUpdate) -> Result<Frame> {
        let key = peer
            .public_key
            .ok_or_else(|| RoutingError::ForwardingFailed(format!("peer {} has no public key", peer.node_id)))?;
        let envelope = PolicyEnvelope::sign(&self.identity, &key, update.clone())?;
        Frame::json(FrameKind::Policy, &envelope)
    }
}
