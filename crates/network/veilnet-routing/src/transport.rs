//! TCP transport with optional TLS.

use crate::config::{RouterConfig, TransportConfig};
use crate::tls;
use crate::types::PeerAddress;
use crate::{Result, RoutingError};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// A bidirectional byte stream, plain TCP or TLS.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens and accepts connections according to [`TransportConfig`].
#[derive(Clone)]
pub struct Transport {
    config: TransportConfig,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("tls", &self.tls_enabled())
            .finish()
    }
}

impl Transport {
    /// Plain TCP in both directions.
    pub fn plain(config: TransportConfig) -> Self {
        Self {
            config,
            acceptor: None,
            connector: None,
        }
    }

    pub fn with_tls(config: TransportConfig, acceptor: TlsAcceptor, connector: TlsConnector) -> Self {
        Self {
            config,
            acceptor: Some(acceptor),
            connector: Some(connector),
        }
    }

    /// Builds the transport for a node, generating TLS material for
    /// `hostname` when TLS is enabled and none exists yet.
    pub fn from_config(config: &RouterConfig, hostname: &str) -> Result<Self> {
        if !config.tls.enabled {
            return Ok(Self::plain(config.transport.clone()));
        }
        let cn = config.tls.hostname.as_deref().unwrap_or(hostname);
        let material = tls::ensure_certificate(&config.tls.dir, cn)?;
        Ok(Self::with_tls(
            config.transport.clone(),
            tls::build_acceptor(&material)?,
            tls::build_connector()?,
        ))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn tls_enabled(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Binds a listener on the configured host.
    pub async fn bind(&self, port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind((self.config.bind_host.as_str(), port)).await?;
        info!(
            address = %listener.local_addr()?,
            tls = self.tls_enabled(),
            "listening"
        );
        Ok(listener)
    }

    /// Connects to `address` within the connect timeout, completing the TLS
    /// handshake when enabled.
    pub async fn connect(&self, address: &PeerAddress) -> Result<BoxedStream> {
        let connect_timeout = self.config.connect_timeout();
        let stream = timeout(connect_timeout, TcpStream::connect((address.host(), address.port())))
            .await
            .map_err(|_| RoutingError::Timeout)?
            .map_err(|e| RoutingError::NetworkError(format!("connect to {address}: {e}")))?;
        stream.set_nodelay(true)?;

        match &self.connector {
            Some(connector) => {
                let name = ServerName::try_from(address.host().to_string())
                    .map_err(|e| RoutingError::Tls(format!("invalid server name {}: {e}", address.host())))?;
                let tls_stream = timeout(connect_timeout, connector.connect(name, stream))
                    .await
                    .map_err(|_| RoutingError::Timeout)?
                    .map_err(|e| RoutingError::Tls(format!("handshake with {address}: {e}")))?;
                debug!(peer = %address, "TLS session established");
                Ok(Box::new(tls_stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// Wraps an accepted socket, completing the server side of TLS when
    /// enabled.
    pub async fn accept(&self, stream: TcpStream, remote: SocketAddr) -> Result<BoxedStream> {
        stream.set_nodelay(true)?;
        match &self.acceptor {
            Some(acceptor) => {
                let tls_stream = timeout(self.config.io_timeout(), acceptor.accept(stream))
                    .await
                    .map_err(|_| RoutingError::Timeout)?
                    .map_err(|e| RoutingError::Tls(format!("handshake from {remote}: {e}")))?;
                Ok(Box::new(tls_stream))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame, Frame, FrameKind};

    async fn echo_once(transport: Transport) -> (PeerAddress, tokio::task::JoinHandle<()>) {
        let listener = transport.bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, remote) = listener.accept().await.unwrap();
            let mut stream = transport.accept(socket, remote).await.unwrap();
            let frame = read_frame(&mut stream, 1024).await.unwrap();
            write_frame(&mut stream, &frame).await.unwrap();
        });
        (PeerAddress::new("127.0.0.1", port), handle)
    }

    #[tokio::test]
    async fn test_plain_round_trip() {
        let config = TransportConfig {
            bind_host: "127.0.0.1".into(),
            ..Default::default()
        };
        let transport = Transport::plain(config);
        let (address, server) = echo_once(transport.clone()).await;

        let mut stream = transport.connect(&address).await.unwrap();
        let frame = Frame::new(FrameKind::Onion, b"ping".to_vec());
        write_frame(&mut stream, &frame).await.unwrap();
        assert_eq!(read_frame(&mut stream, 1024).await.unwrap(), frame);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = RouterConfig::new()
            .with_bind_host("127.0.0.1")
            .with_tls(dir.path());
        let transport = Transport::from_config(&config, "localhost").unwrap();
        assert!(transport.tls_enabled());
        let (address, server) = echo_once(transport.clone()).await;

        let mut stream = transport.connect(&address).await.unwrap();
        let frame = Frame::new(FrameKind::Policy, b"{}".to_vec());
        write_frame(&mut stream, &frame).await.unwrap();
        assert_eq!(read_frame(&mut stream, 1024).await.unwrap(), frame);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = Transport::plain(TransportConfig::default());
        let result = transport.connect(&PeerAddress::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(RoutingError::NetworkError(_))));
    }
}
