//! Outbound single-message exchanges.
//!
//! Joins, onion forwarding, sender dispatch and policy propagation all open a
//! fresh connection, write exactly one frame, optionally read one frame back
//! and close.

use crate::frame::{read_frame, write_frame, Frame, FrameKind};
use crate::transport::{BoxedStream, Transport};
use crate::types::PeerAddress;
use crate::{Result, RoutingError};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Outcome of a successful [`HandshakeClient::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The peer answered with an `Ack` frame
    Received,
    /// The frame was written and the connection closed without waiting
    NotRequested,
}

#[derive(Debug, Clone)]
pub struct HandshakeClient {
    transport: Transport,
}

impl HandshakeClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Writes `frame` to `address`, waiting for an `Ack` when `expect_ack`
    /// is set. Every step is bounded by the transport timeouts.
    pub async fn send(&self, address: &PeerAddress, frame: &Frame, expect_ack: bool) -> Result<Ack> {
        let mut stream = self.transport.connect(address).await?;
        self.write(&mut stream, frame).await?;
        trace!(peer = %address, kind = ?frame.kind, bytes = frame.wire_len(), "frame sent");

        let outcome = if expect_ack {
            let reply = self.read(&mut stream).await?;
            reply.expect_kind(FrameKind::Ack)?;
            Ack::Received
        } else {
            Ack::NotRequested
        };

        let _ = stream.shutdown().await;
        Ok(outcome)
    }

    /// Writes `frame` and returns the single frame the peer answers with.
    pub async fn request(&self, address: &PeerAddress, frame: &Frame) -> Result<Frame> {
        let mut stream = self.transport.connect(address).await?;
        self.write(&mut stream, frame).await?;
        let reply = self.read(&mut stream).await?;
        debug!(peer = %address, kind = ?reply.kind, "reply received");
        let _ = stream.shutdown().await;
        Ok(reply)
    }

    async fn write(&self, stream: &mut BoxedStream, frame: &Frame) -> Result<()> {
        timeout(self.transport.config().io_timeout(), write_frame(stream, frame))
            .await
            .map_err(|_| RoutingError::Timeout)?
    }

    async fn read(&self, stream: &mut BoxedStream) -> Result<Frame> {
        let config = self.transport.config();
        timeout(config.io_timeout(), read_frame(stream, config.max_frame_bytes))
            .await
            .map_err(|_| RoutingError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn client(io_timeout_ms: u64) -> HandshakeClient {
        HandshakeClient::new(Transport::plain(TransportConfig {
            io_timeout_ms,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_send_waits_for_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = PeerAddress::from(listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut socket, 1024).await.unwrap();
            write_frame(&mut socket, &Frame::ack()).await.unwrap();
            frame
        });

        let frame = Frame::new(FrameKind::Onion, b"blob".to_vec());
        let ack = tokio_test::assert_ok!(client(1_000).send(&address, &frame, true).await);
        assert_eq!(ack, Ack::Received);
        assert_eq!(server.await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = PeerAddress::from(listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let frame = Frame::new(FrameKind::Join, b"{}".to_vec());
        let result = client(200).request(&address, &frame).await;
        assert!(matches!(result, Err(RoutingError::Timeout)));
    }

    #[tokio::test]
    async fn test_wrong_reply_kind_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = PeerAddress::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut socket, 1024).await.unwrap();
            write_frame(&mut socket, &Frame::new(FrameKind::JoinReply, b"{}".to_vec()))
                .await
                .unwrap();
        });

        let frame = Frame::new(FrameKind::Policy, b"{}".to_vec());
        let result = client(1_000).send(&address, &frame, true).await;
        assert!(matches!(result, Err(RoutingError::Protocol(_))));
    }
}
