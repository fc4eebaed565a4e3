//! # VeilNet Routing
//!
//! Onion routing over a small peer-to-peer overlay. Traffic is relayed
//! through a chain of nodes, each removing one layer of encryption, so no
//! single relay learns both where a message came from and where it goes.
//!
//! The crate provides:
//! - **Peer directory**: a node-id → address/key table filled by one join
//!   exchange with a bootstrap peer
//! - **Path selection**: random distinct hops drawn from the directory
//! - **Onion codec**: hybrid per-hop encryption with authenticated headers
//! - **Relay endpoint**: the TLS listener that decrypts, filters and
//!   forwards or delivers each message
//! - **Policy administration**: blocked destinations propagated to every peer
//!
//! ## Example
//!
//! ```rust,no_run
//! use veilnet_routing::{NodeConfig, NodeRole, OnionNode, PeerAddress};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = OnionNode::start(NodeConfig::new(NodeRole::Entry)).await?;
//!     node.join(&PeerAddress::new("localhost", 9002)).await?;
//!
//!     let dispatch = node.send_anonymous(b"Hello, anonymous world!").await?;
//!     println!("sent through {:?}", dispatch.path);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod node;
pub mod onion;
pub mod path;
pub mod policy;
pub mod relay;
pub mod tls;
pub mod transport;
pub mod types;

pub use config::{DirectoryConfig, NodeConfig, PolicyConfig, RouterConfig, TlsConfig, TransportConfig};
pub use directory::{AssumeAlive, JoinReply, JoinRequest, Liveness, PeerDirectory, PeerEntry};
pub use error::{ErrorSeverity, Result, RoutingError};
pub use frame::{Frame, FrameKind};
pub use handshake::{Ack, HandshakeClient};
pub use node::{Dispatch, OnionNode};
pub use onion::{OnionCodec, OnionLayer, Unwrapped};
pub use path::{Hop, Path, PathSelector};
pub use policy::{
    BlockedDestinationSet, Membership, PolicyAction, PolicyAdministrator, PolicyEnvelope, PolicyUpdate, PropagationReport,
    PropagationStatus, StaticMembership,
};
pub use relay::{ConnectionState, RelayEndpoint, RelayEvent, RelayHandle, RelayStatsSnapshot};
pub use transport::Transport;
pub use types::{NodeId, NodeIdentity, NodeRole, PeerAddress, PeerRecord};
