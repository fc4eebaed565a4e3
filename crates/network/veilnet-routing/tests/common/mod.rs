//! Common test utilities and helpers.

#![allow(dead_code)]

use std::path::Path as FsPath;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;
use veilnet_routing::{NodeConfig, NodeRole, OnionNode, RelayEvent, RouterConfig};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize test logging
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("veilnet_routing=debug".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

/// Loopback router settings with short timeouts and TLS off.
pub fn test_router() -> RouterConfig {
    RouterConfig::new()
        .with_bind_host("127.0.0.1")
        .without_tls()
        .with_connect_timeout(Duration::from_millis(500))
        .with_io_timeout(Duration::from_millis(1_000))
        .with_join_timeout(Duration::from_millis(1_000))
        .with_propagation(2, Duration::from_millis(10))
}

pub fn test_config(role: NodeRole, node_id: u64, router: RouterConfig) -> NodeConfig {
    NodeConfig::new(role)
        .with_node_id(node_id)
        .with_port(0)
        .with_advertise_host("127.0.0.1")
        .with_router(router)
}

pub async fn start_node(role: NodeRole, node_id: u64) -> OnionNode {
    OnionNode::start(test_config(role, node_id, test_router()))
        .await
        .unwrap()
}

pub async fn start_tls_node(role: NodeRole, node_id: u64, tls_dir: &FsPath) -> OnionNode {
    let router = test_router().with_tls(tls_dir.join(node_id.to_string()));
    OnionNode::start(test_config(role, node_id, router)).await.unwrap()
}

/// Entry (1), relay (2) and exit (3), all joined through the entry so every
/// node knows the other two.
pub async fn three_node_network() -> (OnionNode, OnionNode, OnionNode) {
    let entry = start_node(NodeRole::Entry, 1).await;
    let relay = start_node(NodeRole::Relay, 2).await;
    let exit = start_node(NodeRole::Exit, 3).await;
    connect_all(&entry, &[&relay, &exit]).await;
    (entry, relay, exit)
}

/// Joins every node to `bootstrap`, twice, so the later joiners are visible
/// to the earlier ones as well.
pub async fn connect_all(bootstrap: &OnionNode, others: &[&OnionNode]) {
    for _ in 0..2 {
        for node in others {
            node.join(bootstrap.address()).await.unwrap();
        }
    }
}

/// Waits for the first event matching `predicate`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<RelayEvent>, mut predicate: F) -> RelayEvent
where
    F: FnMut(&RelayEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for relay event")
}

/// Everything received within `window`.
pub async fn drain(events: &mut broadcast::Receiver<RelayEvent>, window: Duration) -> Vec<RelayEvent> {
    let mut seen = Vec::new();
    let _ = timeout(window, async {
        while let Ok(event) = events.recv().await {
            seen.push(event);
        }
    })
    .await;
    seen
}
