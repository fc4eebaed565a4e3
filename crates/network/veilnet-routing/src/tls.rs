//! TLS material and rustls configuration for relay links.
//!
//! Every node serves a self-signed certificate kept in `<dir>/cert.pem` and
//! `<dir>/key.pem`, generated on first start. Clients accept any certificate
//! but still verify the handshake signatures against it, so the link is
//! encrypted and bound to whoever holds the certificate key. Peer
//! authenticity comes from the onion layer keys, not from TLS.

use crate::{Result, RoutingError};
use chrono::Datelike;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

/// Years a generated certificate stays valid.
const VALIDITY_YEARS: i32 = 10;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate chain and key loaded from disk.
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// Loads the certificate in `dir`, generating a self-signed one for
/// `hostname` first if either file is missing.
pub fn ensure_certificate(dir: &Path, hostname: &str) -> Result<TlsMaterial> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);

    if !cert_path.exists() || !key_path.exists() {
        info!(hostname, dir = %dir.display(), "generating self-signed TLS certificate");
        let (cert_pem, key_pem) = generate_self_signed(hostname)?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(&cert_path, cert_pem)?;
        std::fs::write(&key_path, key_pem)?;
    } else {
        info!(dir = %dir.display(), "loading TLS certificate");
    }

    load_material(&cert_path, &key_path)
}

fn load_material(cert_path: &Path, key_path: &Path) -> Result<TlsMaterial> {
    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..]).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(RoutingError::Tls(format!("no certificate in {}", cert_path.display())));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| RoutingError::Tls(format!("no private key in {}", key_path.display())))?;

    Ok(TlsMaterial { certs, key })
}

/// Self-signed certificate with subject CN = `hostname`, valid for ten years
/// from today. Returns `(cert_pem, key_pem)`.
pub fn generate_self_signed(hostname: &str) -> Result<(String, String)> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, hostname.to_string());
    params.distinguished_name = name;

    let today = chrono::Utc::now().date_naive();
    // Day clamped so the expiry date exists in every month.
    let day = today.day().min(28) as u8;
    let month = today.month() as u8;
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + VALIDITY_YEARS, month, day);

    let cert = params.self_signed(&key_pair)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

pub fn build_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(material.certs.clone(), material.key.clone_key())?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn build_connector() -> Result<TlsConnector> {
    let provider = provider();
    let verifier = SelfSignedVerifier {
        provider: provider.clone(),
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts the peer's self-signed certificate without a chain of trust.
#[derive(Debug)]
struct SelfSignedVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SelfSignedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref().is_empty() {
            return Err(rustls::Error::General("empty server certificate".into()));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
