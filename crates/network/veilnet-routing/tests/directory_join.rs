//! Directory join against live and broken bootstrap peers.

mod common;

use common::*;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use veilnet_routing::frame::{read_frame, write_frame};
use veilnet_routing::{Frame, FrameKind, NodeId, NodeRole, PeerAddress, RelayEvent, RoutingError};

#[tokio::test]
async fn test_join_merges_and_registers_self() {
    init_test_logging();
    let bootstrap = start_node(NodeRole::Entry, 1).await;
    let relay = start_node(NodeRole::Relay, 2).await;
    let exit = start_node(NodeRole::Exit, 3).await;
    let mut bootstrap_events = bootstrap.subscribe();

    relay.join(bootstrap.address()).await.unwrap();
    let joined = wait_for(&mut bootstrap_events, |e| matches!(e, RelayEvent::Joined { .. })).await;
    assert_eq!(joined, RelayEvent::Joined { node_id: NodeId(2) });

    let peers = exit.join(bootstrap.address()).await.unwrap();
    let ids: Vec<_> = peers.iter().map(|record| record.node_id).collect();
    assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);
    assert!(peers.contains(&exit.record()));
    assert_eq!(exit.directory().get(NodeId(2)), Some(relay.record()));

    // The bootstrap learned both joiners.
    assert_eq!(bootstrap.directory().len(), 3);
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let bootstrap = start_node(NodeRole::Entry, 1).await;
    let relay = start_node(NodeRole::Relay, 2).await;

    let first = relay.join(bootstrap.address()).await.unwrap();
    let second = relay.join(bootstrap.address()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(relay.directory().len(), 2);
    assert_eq!(bootstrap.directory().len(), 2);
}

#[tokio::test]
async fn test_refused_bootstrap_is_unreachable() {
    let node = start_node(NodeRole::Relay, 2).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = PeerAddress::from(listener.local_addr().unwrap());
    drop(listener);

    let started = Instant::now();
    let result = node.join(&dead).await;
    assert!(matches!(result, Err(RoutingError::DirectoryUnreachable(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(node.directory().len(), 1);
}

#[tokio::test]
async fn test_silent_bootstrap_times_out() {
    let node = start_node(NodeRole::Relay, 2).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent = PeerAddress::from(listener.local_addr().unwrap());
    let _hold = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(socket);
    });

    let started = Instant::now();
    let result = node.join(&silent).await;
    assert!(matches!(result, Err(RoutingError::DirectoryUnreachable(_))));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_malformed_reply_is_unreachable() {
    let node = start_node(NodeRole::Relay, 2).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let liar = PeerAddress::from(listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut socket, 1 << 16).await.unwrap();
        write_frame(&mut socket, &Frame::new(FrameKind::JoinReply, b"[1,2,3]".to_vec()))
            .await
            .unwrap();
    });

    let result = node.join(&liar).await;
    assert!(matches!(result, Err(RoutingError::DirectoryUnreachable(_))));
    assert_eq!(node.directory().len(), 1);
}

#[tokio::test]
async fn test_reply_with_bare_addresses_is_merged() {
    let node = start_node(NodeRole::Exit, 3).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bootstrap = PeerAddress::from(listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut socket, 1 << 16).await.unwrap();
        let body = br#"{"1":["127.0.0.1",9001],"2":["127.0.0.1",9002]}"#.to_vec();
        write_frame(&mut socket, &Frame::new(FrameKind::JoinReply, body))
            .await
            .unwrap();
    });

    let peers = node.join(&bootstrap).await.unwrap();
    let ids: Vec<_> = peers.iter().map(|record| record.node_id).collect();
    assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);

    let first = node.directory().get(NodeId(1)).unwrap();
    assert_eq!(first.address, PeerAddress::new("127.0.0.1", 9001));
    assert!(first.public_key.is_none());

    // Keyless peers cannot carry a layer.
    assert!(matches!(
        node.send_anonymous(b"hello").await,
        Err(RoutingError::InsufficientPeers { .. })
    ));
}

#[tokio::test]
async fn test_join_bootstrap_requires_configuration() {
    let node = start_node(NodeRole::Relay, 2).await;
    assert!(matches!(
        node.join_bootstrap().await,
        Err(RoutingError::InvalidConfig(_))
    ));
}
