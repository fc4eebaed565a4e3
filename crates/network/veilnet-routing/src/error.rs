//! Routing error types

use thiserror::Error;
use veilnet_crypto::CryptoError;

#[derive(Error, Debug)]
pub enum RoutingError {
    /// Join failed: bootstrap down, timed out or replied with garbage.
    #[error("Directory unreachable: {0}")]
    DirectoryUnreachable(String),

    #[error("Insufficient peers: need {required}, have {available}")]
    InsufficientPeers { required: usize, available: usize },

    /// Deliberately carries no detail about which check failed.
    #[error("Layer decryption failed")]
    LayerDecryptionFailed,

    #[error("Forwarding failed: {0}")]
    ForwardingFailed(String),

    #[error("Policy denied for actor {actor}")]
    PolicyDenied { actor: String },

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Key material error: {0}")]
    KeyMaterial(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for response")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, RoutingError>;

/// Error severity levels for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Node cannot keep running
    Critical,
    /// An operation failed and was surfaced to its caller
    Major,
    /// A single connection was dropped
    Minor,
}

impl RoutingError {
    /// Returns the severity of this error for observability purposes.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RoutingError::KeyMaterial(_) | RoutingError::InvalidConfig(_) | RoutingError::Tls(_) => {
                ErrorSeverity::Critical
            }
            RoutingError::DirectoryUnreachable(_)
            | RoutingError::InsufficientPeers { .. }
            | RoutingError::PolicyDenied { .. }
            | RoutingError::InvalidDestination(_)
            | RoutingError::InvalidPath(_) => ErrorSeverity::Major,
            RoutingError::LayerDecryptionFailed
            | RoutingError::ForwardingFailed(_)
            | RoutingError::NetworkError(_)
            | RoutingError::Protocol(_)
            | RoutingError::Serialization(_)
            | RoutingError::Io(_)
            | RoutingError::Timeout => ErrorSeverity::Minor,
        }
    }

    /// Returns an observable error type that doesn't leak message contents.
    pub fn observable_type(&self) -> &'static str {
        match self {
            RoutingError::DirectoryUnreachable(_) => "directory_unreachable",
            RoutingError::InsufficientPeers { .. } => "insufficient_peers",
            RoutingError::LayerDecryptionFailed => "layer_decryption_failed",
            RoutingError::ForwardingFailed(_) => "forwarding_failed",
            RoutingError::PolicyDenied { .. } => "policy_denied",
            RoutingError::InvalidDestination(_) => "invalid_destination",
            RoutingError::InvalidConfig(_) => "invalid_config",
            RoutingError::InvalidPath(_) => "invalid_path",
            RoutingError::NetworkError(_) => "network",
            RoutingError::Tls(_) => "tls",
            RoutingError::Protocol(_) => "protocol",
            RoutingError::Serialization(_) => "serialization",
            RoutingError::KeyMaterial(_) => "key_material",
            RoutingError::Io(_) => "io",
            RoutingError::Timeout => "timeout",
        }
    }
}

impl From<serde_json::Error> for RoutingError {
    fn from(err: serde_json::Error) -> Self {
        RoutingError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for RoutingError {
    fn from(err: bincode::Error) -> Self {
        RoutingError::Serialization(err.to_string())
    }
}

impl From<rustls::Error> for RoutingError {
    fn from(err: rustls::Error) -> Self {
        RoutingError::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for RoutingError {
    fn from(err: rcgen::Error) -> Self {
        RoutingError::Tls(format!("certificate generation failed: {err}"))
    }
}
