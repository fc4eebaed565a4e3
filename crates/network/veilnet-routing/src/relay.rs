//! The per-node listener.
//!
//! Every accepted connection carries exactly one frame and is handled in its
//! own task:
//!
//! ```text
//! LISTENING -> ACCEPTED -> TLS_NEGOTIATED -> LAYER_DECRYPTED -> FORWARDED
//!                                                            -> DELIVERED
//!                                                            -> BLOCKED
//!            (any error) -> FAILED
//! ```
//!
//! Join and policy frames are answered directly (`ANSWERED`). Failures end
//! only the affected connection and are never retried.
//!
//! Policy frames are applied only when their [`PolicyEnvelope`] verifies
//! against a directory-known origin; anything else is refused without an ack
//! and leaves the blocked set untouched.

use crate::config::RouterConfig;
use crate::directory::{JoinRequest, PeerDirectory};
use crate::frame::{read_frame, write_frame, Frame, FrameKind};
use crate::handshake::HandshakeClient;
use crate::onion::{OnionCodec, Unwrapped};
use crate::policy::{BlockedDestinationSet, PolicyEnvelope, PolicyUpdate};
use crate::transport::{BoxedStream, Transport};
use crate::types::{NodeId, NodeIdentity, PeerAddress};
use crate::{Result, RoutingError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    Accepted,
    TlsNegotiated,
    LayerDecrypted,
    Forwarded,
    Delivered,
    Blocked,
    Failed,
    /// A join or policy frame was answered
    Answered,
}

/// Observable outcome of one handled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// This node was the last hop
    Delivered { payload: Vec<u8> },
    Forwarded { next_hop: NodeId, address: PeerAddress },
    Blocked { destination: String },
    Failed { reason: &'static str },
    Joined { node_id: NodeId },
    PolicyApplied { update: PolicyUpdate },
}

#[derive(Debug, Default)]
pub struct RelayStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    accepted: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    blocked: AtomicU64,
    failed: AtomicU64,
    answered: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub accepted: u64,
    pub forwarded: u64,
    pub delivered: u64,
    pub blocked: u64,
    pub failed: u64,
    pub answered: u64,
}

impl RelayStats {
    fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    fn record(&self, state: ConnectionState) {
        let counter = match state {
            ConnectionState::Forwarded => &self.forwarded,
            ConnectionState::Delivered => &self.delivered,
            ConnectionState::Blocked => &self.blocked,
            ConnectionState::Failed => &self.failed,
            ConnectionState::Answered => &self.answered,
            _ => return,
        };
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
        }
    }
}

struct RelayInner {
    identity: NodeIdentity,
    directory: Arc<PeerDirectory>,
    blocked: Arc<BlockedDestinationSet>,
    transport: Transport,
    client: HandshakeClient,
    codec: OnionCodec,
    config: RouterConfig,
    stats: RelayStats,
    events: broadcast::Sender<RelayEvent>,
    deliveries: mpsc::Sender<Vec<u8>>,
    /// Present until a consumer takes it
    delivery_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    limiter: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct RelayEndpoint {
    inner: Arc<RelayInner>,
}

impl RelayEndpoint {
    pub fn new(
        identity: NodeIdentity,
        directory: Arc<PeerDirectory>,
        blocked: Arc<BlockedDestinationSet>,
        transport: Transport,
        config: RouterConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (deliveries, delivery_rx) = mpsc::channel(config.transport.delivery_queue);
        let limiter = Arc::new(Semaphore::new(config.transport.max_connections));
        let client = HandshakeClient::new(transport.clone());
        Self {
            inner: Arc::new(RelayInner {
                identity,
                directory,
                blocked,
                transport,
                client,
                codec: OnionCodec::new(),
                config,
                stats: RelayStats::default(),
                events,
                deliveries,
                delivery_rx: Mutex::new(Some(delivery_rx)),
                limiter,
            }),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    /// Outcome events for every handled connection.
    ///
    /// Best effort: a subscriber that falls more than 256 events behind gets
    /// `RecvError::Lagged` and misses them, payloads included. Consumers that
    /// must see every delivered payload use [`RelayEndpoint::take_deliveries`].
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Takes the queue of payloads delivered at this node. Only the first
    /// call returns it.
    ///
    /// Once taken, a delivery is acknowledged upstream only after it is
    /// queued. A full queue holds the connection for up to the I/O timeout and
    /// then fails it unacknowledged, so senders see back-pressure instead of
    /// silent loss.
    pub fn take_deliveries(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inner.delivery_rx.lock().take()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Starts the accept loop. Each connection runs in its own task, at most
    /// `max_connections` at a time.
    pub fn serve(&self, listener: TcpListener) -> Result<RelayHandle> {
        let local_addr = listener.local_addr()?;
        let inner = Arc::clone(&self.inner);
        info!(
            node_id = %inner.identity.node_id,
            address = %local_addr,
            state = ?ConnectionState::Listening,
            "relay endpoint started"
        );

        let task = tokio::spawn(async move {
            loop {
                let permit = match Arc::clone(&inner.limiter).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                match listener.accept().await {
                    Ok((socket, remote)) => {
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            inner.handle_connection(socket, remote).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(RelayHandle { local_addr, task })
    }
}

/// Controls a running accept loop.
#[derive(Debug)]
pub struct RelayHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting. Connections already being handled run to completion.
    pub fn close(&self) {
        self.task.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RelayInner {
    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn handle_connection(&self, socket: TcpStream, remote: SocketAddr) {
        RelayStats::add(&self.stats.accepted, 1);
        trace!(peer = %remote, state = ?ConnectionState::Accepted, "connection accepted");

        let state = match self.process(socket, remote).await {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    node_id = %self.identity.node_id,
                    peer = %remote,
                    error = e.observable_type(),
                    severity = ?e.severity(),
                    state = ?ConnectionState::Failed,
                    "connection failed"
                );
                self.emit(RelayEvent::Failed {
                    reason: e.observable_type(),
                });
                ConnectionState::Failed
            }
        };
        self.stats.record(state);
        debug!(peer = %remote, state = ?state, "connection closed");
    }

    async fn process(&self, socket: TcpStream, remote: SocketAddr) -> Result<ConnectionState> {
        let mut stream = self.transport.accept(socket, remote).await?;
        if self.transport.tls_enabled() {
            trace!(peer = %remote, state = ?ConnectionState::TlsNegotiated, "TLS negotiated");
        }

        let transport = self.transport.config();
        let frame = timeout(transport.io_timeout(), read_frame(&mut stream, transport.max_frame_bytes))
            .await
            .map_err(|_| RoutingError::Timeout)??;
        RelayStats::add(&self.stats.bytes_received, frame.wire_len() as u64);

        match frame.kind {
            FrameKind::Onion => self.relay_onion(&mut stream, &frame.body).await,
            FrameKind::Join => {
                let request: JoinRequest = frame.decode_json()?;
                let node_id = request.node_id;
                let reply = self.directory.handle_join(request)?;
                self.respond(&mut stream, &Frame::json(FrameKind::JoinReply, &reply)?)
                    .await?;
                self.emit(RelayEvent::Joined { node_id });
                Ok(ConnectionState::Answered)
            }
            FrameKind::Policy => {
                let envelope: PolicyEnvelope = frame.decode_json()?;
                let update = self.authorize(envelope)?;
                let changed = self.blocked.apply(&update)?;
                info!(
                    actor = %update.actor,
                    action = ?update.action,
                    destination = %update.destination,
                    changed,
                    "policy update received"
                );
                self.respond(&mut stream, &Frame::ack()).await?;
                self.emit(RelayEvent::PolicyApplied { update });
                Ok(ConnectionState::Answered)
            }
            FrameKind::JoinReply | FrameKind::Ack => Err(RoutingError::Protocol(format!(
                "unsolicited {:?} frame",
                frame.kind
            ))),
        }
    }

    async fn relay_onion(&self, stream: &mut BoxedStream, body: &[u8]) -> Result<ConnectionState> {
        let unwrapped = self.codec.unwrap_bytes(body, self.identity.keys())?;
        trace!(state = ?ConnectionState::LayerDecrypted, "layer decrypted");

        match unwrapped {
            Unwrapped::Forward { next_hop, layer } => {
                if let Some(destination) = self.blocked.matches(&next_hop.address.authority()) {
                    return Ok(self.block(destination));
                }
                if self.config.directory.require_known_next_hop
                    && !self.directory.knows_address(&next_hop.address)
                {
                    return Err(RoutingError::ForwardingFailed(format!(
                        "next hop {} is not in the directory",
                        next_hop.node_id
                    )));
                }

                let frame = Frame::new(FrameKind::Onion, layer.to_bytes()?);
                self.client
                    .send(&next_hop.address, &frame, false)
                    .await
                    .map_err(|e| RoutingError::ForwardingFailed(format!("{}: {e}", next_hop.address)))?;
                RelayStats::add(&self.stats.bytes_sent, frame.wire_len() as u64);
                debug!(next_hop = %next_hop.node_id, state = ?ConnectionState::Forwarded, "layer forwarded");

                self.acknowledge(stream).await;
                self.emit(RelayEvent::Forwarded {
                    next_hop: next_hop.node_id,
                    address: next_hop.address,
                });
                Ok(ConnectionState::Forwarded)
            }
            Unwrapped::Deliver { payload } => {
                if let Some(destination) = self.blocked.matches(&String::from_utf8_lossy(&payload)) {
                    return Ok(self.block(destination));
                }
                self.hand_off(&payload).await?;
                info!(
                    node_id = %self.identity.node_id,
                    bytes = payload.len(),
                    state = ?ConnectionState::Delivered,
                    "payload delivered"
                );
                self.acknowledge(stream).await;
                self.emit(RelayEvent::Delivered { payload });
                Ok(ConnectionState::Delivered)
            }
        }
    }

    /// Returns the update carried by `envelope` if its origin may send it.
    fn authorize(&self, envelope: PolicyEnvelope) -> Result<PolicyUpdate> {
        let denied = |reason: &str| {
            warn!(origin = %envelope.origin, actor = %envelope.update.actor, reason, "policy update refused");
            RoutingError::PolicyDenied {
                actor: envelope.update.actor.clone(),
            }
        };

        let origin_key = self
            .directory
            .get(envelope.origin)
            .and_then(|record| record.public_key)
            .ok_or_else(|| denied("unknown origin"))?;
        if !self.config.policy.accepts_origin(&origin_key) {
            return Err(denied("origin is not a policy authority"));
        }
        envelope
            .verify(self.identity.keys(), &origin_key)
            .map_err(|_| denied("bad tag"))?;
        Ok(envelope.update)
    }

    /// Queues a delivered payload for the local consumer, if one took the queue.
    async fn hand_off(&self, payload: &[u8]) -> Result<()> {
        let unclaimed = self.delivery_rx.lock().is_some();
        if unclaimed {
            return Ok(());
        }
        match timeout(self.transport.config().io_timeout(), self.deliveries.send(payload.to_vec())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                debug!("delivery consumer dropped");
                Ok(())
            }
            Err(_) => {
                warn!(node_id = %self.identity.node_id, "delivery queue full");
                Err(RoutingError::Timeout)
            }
        }
    }

    fn block(&self, destination: String) -> ConnectionState {
        info!(
            node_id = %self.identity.node_id,
            destination = %destination,
            state = ?ConnectionState::Blocked,
            "blocked destination"
        );
        self.emit(RelayEvent::Blocked { destination });
        ConnectionState::Blocked
    }

    /// The upstream sender may already have closed; that is not a failure.
    async fn acknowledge(&self, stream: &mut BoxedStream) {
        if let Err(e) = self.respond(stream, &Frame::ack()).await {
            trace!(error = e.observable_type(), "ack not delivered");
        }
    }

    async fn respond(&self, stream: &mut BoxedStream, frame: &Frame) -> Result<()> {
        timeout(self.transport.config().io_timeout(), write_frame(stream, frame))
            .await
            .map_err(|_| RoutingError::Timeout)??;
        RelayStats::add(&self.stats.bytes_sent, frame.wire_len() as u64);
        let _ = stream.shutdown().await;
        Ok(())
    }
}
