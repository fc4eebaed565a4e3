//! Local view of known peers and the bootstrap join exchange.

use crate::frame::{Frame, FrameKind};
use crate::handshake::HandshakeClient;
use crate::types::{NodeId, PeerAddress, PeerRecord};
use crate::{Result, RoutingError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use veilnet_crypto::PublicKey;

pub const JOIN_ACTION: &str = "join";

/// `{"action":"join","node_id":..,"address":[host,port],"public_key":"hex"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub action: String,
    pub node_id: NodeId,
    pub address: PeerAddress,
    #[serde(default)]
    pub public_key: Option<PublicKey>,
}

impl JoinRequest {
    pub fn for_record(record: &PeerRecord) -> Self {
        Self {
            action: JOIN_ACTION.to_string(),
            node_id: record.node_id,
            address: record.address.clone(),
            public_key: record.public_key,
        }
    }

    fn into_record(self) -> PeerRecord {
        PeerRecord::new(self.node_id, self.address, self.public_key)
    }
}

/// One value in the join reply map.
///
/// Written as `{"address":[host,port],"public_key":"hex"}`. A bare
/// `[host, port]` is also accepted and yields an entry without a key, which
/// path selection skips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireEntry")]
pub struct PeerEntry {
    pub address: PeerAddress,
    pub public_key: Option<PublicKey>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireEntry {
    Keyed {
        address: PeerAddress,
        #[serde(default)]
        public_key: Option<PublicKey>,
    },
    Bare(PeerAddress),
}

impl From<WireEntry> for PeerEntry {
    fn from(entry: WireEntry) -> Self {
        match entry {
            WireEntry::Keyed { address, public_key } => Self { address, public_key },
            WireEntry::Bare(address) => Self {
                address,
                public_key: None,
            },
        }
    }
}

/// Reply to a join: node id → address and key.
pub type JoinReply = BTreeMap<NodeId, PeerEntry>;

/// Decides whether a peer is still reachable. Records never expire on their
/// own; [`PeerDirectory::prune`] is the only path that drops them.
#[async_trait]
pub trait Liveness: Send + Sync {
    async fn is_alive(&self, record: &PeerRecord) -> bool;
}

/// Treats every known peer as alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeAlive;

#[async_trait]
impl Liveness for AssumeAlive {
    async fn is_alive(&self, _record: &PeerRecord) -> bool {
        true
    }
}

/// Peer table keyed by node id. The local record is always present.
#[derive(Debug)]
pub struct PeerDirectory {
    local: PeerRecord,
    peers: RwLock<HashMap<NodeId, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new(local: PeerRecord) -> Self {
        let mut peers = HashMap::new();
        peers.insert(local.node_id, local.clone());
        Self {
            local,
            peers: RwLock::new(peers),
        }
    }

    pub fn local(&self) -> &PeerRecord {
        &self.local
    }

    /// Inserts or replaces a record. Returns `true` if the id was new.
    pub fn upsert(&self, record: PeerRecord) -> bool {
        if record.node_id == self.local.node_id && record != self.local {
            debug!(node_id = %record.node_id, "ignoring foreign record for local id");
            return false;
        }
        self.peers.write().insert(record.node_id, record).is_none()
    }

    pub fn get(&self, node_id: NodeId) -> Option<PeerRecord> {
        self.peers.read().get(&node_id).cloned()
    }

    /// Drops a peer. The local record cannot be removed.
    pub fn remove(&self, node_id: NodeId) -> Option<PeerRecord> {
        if node_id == self.local.node_id {
            return None;
        }
        self.peers.write().remove(&node_id)
    }

    /// All records, ordered by node id.
    pub fn all_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|record| record.node_id);
        peers
    }

    /// Records other than the local one.
    pub fn remote_peers(&self) -> Vec<PeerRecord> {
        let mut peers = self.all_peers();
        peers.retain(|record| record.node_id != self.local.node_id);
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Whether some record advertises `address`.
    pub fn knows_address(&self, address: &PeerAddress) -> bool {
        self.peers.read().values().any(|record| &record.address == address)
    }

    /// The table in join-reply form.
    pub fn snapshot(&self) -> JoinReply {
        self.peers
            .read()
            .values()
            .map(|record| {
                (
                    record.node_id,
                    PeerEntry {
                        address: record.address.clone(),
                        public_key: record.public_key,
                    },
                )
            })
            .collect()
    }

    /// Merges a join reply. Returns how many ids were new.
    pub fn merge(&self, reply: JoinReply) -> usize {
        reply
            .into_iter()
            .filter(|(node_id, entry)| {
                self.upsert(PeerRecord::new(*node_id, entry.address.clone(), entry.public_key))
            })
            .count()
    }

    /// Answers a join request received by this node acting as bootstrap.
    pub fn handle_join(&self, request: JoinRequest) -> Result<JoinReply> {
        if request.action != JOIN_ACTION {
            return Err(RoutingError::Protocol(format!("unexpected action {:?}", request.action)));
        }
        let node_id = request.node_id;
        if self.upsert(request.into_record()) {
            info!(peer = %node_id, peers = self.len(), "peer joined");
        }
        Ok(self.snapshot())
    }

    /// Registers with `bootstrap` and merges the peer table it returns.
    ///
    /// Any failure to connect, a timeout, or a malformed reply is reported as
    /// `DirectoryUnreachable`. Nothing is retried.
    pub async fn join(
        &self,
        client: &HandshakeClient,
        bootstrap: &PeerAddress,
        join_timeout: Duration,
    ) -> Result<Vec<PeerRecord>> {
        let fail = |reason: String| {
            warn!(bootstrap = %bootstrap, reason = %reason, "join failed");
            RoutingError::DirectoryUnreachable(format!("{bootstrap}: {reason}"))
        };

        let request = Frame::json(FrameKind::Join, &JoinRequest::for_record(&self.local))?;
        let reply = timeout(join_timeout, client.request(bootstrap, &request))
            .await
            .map_err(|_| fail("timed out".to_string()))?
            .map_err(|e| fail(e.to_string()))?;

        reply
            .expect_kind(FrameKind::JoinReply)
            .map_err(|e| fail(e.to_string()))?;
        let table: JoinReply = reply
            .decode_json()
            .map_err(|e| fail(format!("malformed reply: {e}")))?;

        let added = self.merge(table);
        self.upsert(self.local.clone());
        info!(bootstrap = %bootstrap, added, peers = self.len(), "joined directory");
        Ok(self.all_peers())
    }

    /// Removes every remote peer `liveness` reports as gone.
    pub async fn prune(&self, liveness: &dyn Liveness) -> Vec<NodeId> {
        let mut removed = Vec::new();
        for record in self.remote_peers() {
            if !liveness.is_alive(&record).await {
                self.remove(record.node_id);
                removed.push(record.node_id);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilnet_crypto::IdentityKeyPair;

    fn record(id: u64, port: u16) -> PeerRecord {
        PeerRecord::new(
            NodeId(id),
            PeerAddress::new("localhost", port),
            Some(IdentityKeyPair::generate().public_key()),
        )
    }

    #[test]
    fn test_join_request_wire_format() {
        let mut local = record(1, 9001);
        local.public_key = None;
        let json = serde_json::to_value(JoinRequest::for_record(&local)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "action": "join",
                "node_id": 1,
                "address": ["localhost", 9001],
                "public_key": null,
            })
        );
    }

    #[test]
    fn test_reply_keys_are_node_ids() {
        let directory = PeerDirectory::new(record(1, 9001));
        directory.upsert(record(2, 9002));
        let json = serde_json::to_value(directory.snapshot()).unwrap();
        assert!(json.get("1").is_some());
        assert_eq!(json["2"]["address"], serde_json::json!(["localhost", 9002]));

        let decoded: JoinReply = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_reply_accepts_bare_addresses() {
        let decoded: JoinReply = serde_json::from_str(
            r#"{"1":["127.0.0.1",9001],"2":{"address":["127.0.0.1",9002]},"3":{"address":["::1",9003],"public_key":null}}"#,
        )
        .unwrap();
        assert_eq!(
            decoded[&NodeId(1)],
            PeerEntry {
                address: PeerAddress::new("127.0.0.1", 9001),
                public_key: None,
            }
        );
        assert_eq!(decoded[&NodeId(2)].address.port(), 9002);
        assert!(decoded.values().all(|entry| entry.public_key.is_none()));

        assert!(serde_json::from_str::<JoinReply>(r#"{"1":"127.0.0.1:9001"}"#).is_err());
    }

    #[test]
    fn test_upsert_and_remove() {
        let local = record(1, 9001);
        let directory = PeerDirectory::new(local.clone());
        assert_eq!(directory.len(), 1);

        let peer = record(2, 9002);
        assert!(directory.upsert(peer.clone()));
        assert!(!directory.upsert(peer.clone()));
        assert_eq!(directory.get(NodeId(2)), Some(peer));

        assert!(directory.remove(NodeId(1)).is_none());
        assert!(directory.remove(NodeId(2)).is_some());
        assert_eq!(directory.all_peers(), vec![local]);
    }

    #[test]
    fn test_foreign_record_cannot_replace_local() {
        let local = record(1, 9001);
        let directory = PeerDirectory::new(local.clone());
        assert!(!directory.upsert(record(1, 7777)));
        assert_eq!(directory.get(NodeId(1)), Some(local));
    }

    #[test]
    fn test_handle_join_registers_requester() {
        let directory = PeerDirectory::new(record(1, 9001));
        let joiner = record(5, 9005);
        let reply = tokio_test::assert_ok!(directory.handle_join(JoinRequest::for_record(&joiner)));
        assert!(reply.contains_key(&NodeId(1)));
        assert!(reply.contains_key(&NodeId(5)));

        let mut bogus = JoinRequest::for_record(&joiner);
        bogus.action = "leave".into();
        assert!(matches!(directory.handle_join(bogus), Err(RoutingError::Protocol(_))));
    }

    struct DeadPort(u16);

    #[async_trait]
    impl Liveness for DeadPort {
        async fn is_alive(&self, record: &PeerRecord) -> bool {
            record.address.port() != self.0
        }
    }

    #[tokio::test]
    async fn test_prune_uses_liveness() {
        let directory = PeerDirectory::new(record(1, 9001));
        directory.upsert(record(2, 9002));
        directory.upsert(record(3, 9003));

        assert!(directory.prune(&AssumeAlive).await.is_empty());
        assert_eq!(directory.prune(&DeadPort(9003)).await, vec![NodeId(3)]);
        assert_eq!(directory.len(), 2);
    }
}
