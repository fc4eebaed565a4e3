//! Layered encryption: one layer per hop.
//!
//! Each layer carries a fresh AES-256-GCM session key sealed to the hop's
//! identity key. The additional authenticated data binds the target
//! address, the sealed key and the IV, so a change to any field of the
//! layer fails authentication.

use crate::path::{Hop, Path};
use crate::types::{PeerAddress, PeerRecord};
use crate::{Result, RoutingError};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use veilnet_crypto::cipher::{decrypt_detached, encrypt_detached_with_iv};
use veilnet_crypto::{seal, IdentityKeyPair, SealedBox, SessionKey, IV_LEN, TAG_LEN};

/// One encrypted layer as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionLayer {
    /// Address of the hop this layer is for
    pub target: PeerAddress,
    pub encrypted_session_key: SealedBox,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_LEN],
}

impl OnionLayer {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Malformed input is indistinguishable from any other unwrap failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|_| RoutingError::LayerDecryptionFailed)
    }
}

/// Plaintext of a layer once the session key has opened it.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LayerContent {
    Forward {
        next_hop: PeerRecord,
        layer: Box<OnionLayer>,
    },
    Deliver {
        payload: Vec<u8>,
    },
}

/// Result of removing one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwrapped {
    /// Pass `layer` on to `next_hop`.
    Forward { next_hop: PeerRecord, layer: OnionLayer },
    /// This hop is the last; `payload` is the application message.
    Deliver { payload: Vec<u8> },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OnionCodec;

impl OnionCodec {
    pub fn new() -> Self {
        Self
    }

    /// Wraps `payload` for `path`, innermost layer first. The returned layer
    /// is addressed to the first hop.
    pub fn wrap(&self, path: &Path, payload: &[u8]) -> Result<OnionLayer> {
        let hops = path.hops();
        let mut inner: Option<OnionLayer> = None;

        for (index, hop) in hops.iter().enumerate().rev() {
            let content = match inner.take() {
                None => LayerContent::Deliver {
                    payload: payload.to_vec(),
                },
                Some(layer) => LayerContent::Forward {
                    next_hop: hops[index + 1].record.clone(),
                    layer: Box::new(layer),
                },
            };
            inner = Some(seal_layer(hop, &content)?);
        }

        inner.ok_or_else(|| RoutingError::InvalidPath("path has no hops".into()))
    }

    /// Removes the layer addressed to `identity`. Every failure, whatever its
    /// cause, is `LayerDecryptionFailed`.
    pub fn unwrap(&self, layer: &OnionLayer, identity: &IdentityKeyPair) -> Result<Unwrapped> {
        let key_bytes = identity
            .open(&layer.encrypted_session_key)
            .map_err(|_| RoutingError::LayerDecryptionFailed)?;
        let key = SessionKey::from_slice(&key_bytes).map_err(|_| RoutingError::LayerDecryptionFailed)?;

        let aad = layer_aad(&layer.target, &layer.encrypted_session_key, &layer.iv);
        let plaintext = decrypt_detached(&key, &aad, &layer.iv, &layer.ciphertext, &layer.auth_tag)
            .map_err(|_| RoutingError::LayerDecryptionFailed)?;

        let content: LayerContent =
            bincode::deserialize(&plaintext).map_err(|_| RoutingError::LayerDecryptionFailed)?;
        Ok(match content {
            LayerContent::Forward { next_hop, layer } => Unwrapped::Forward {
                next_hop,
                layer: *layer,
            },
            LayerContent::Deliver { payload } => Unwrapped::Deliver { payload },
        })
    }

    pub fn unwrap_bytes(&self, bytes: &[u8], identity: &IdentityKeyPair) -> Result<Unwrapped> {
        let layer = OnionLayer::from_bytes(bytes)?;
        self.unwrap(&layer, identity)
    }
}

fn seal_layer(hop: &Hop, content: &LayerContent) -> Result<OnionLayer> {
    let plaintext = bincode::serialize(content)?;
    let key = SessionKey::generate();
    let encrypted_session_key = seal(&hop.public_key, key.as_bytes())?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let target = hop.record.address.clone();
    let aad = layer_aad(&target, &encrypted_session_key, &iv);
    let sealed = encrypt_detached_with_iv(&key, iv, &aad, &plaintext)?;

    Ok(OnionLayer {
        target,
        encrypted_session_key,
        iv: sealed.iv,
        ciphertext: sealed.ciphertext,
        auth_tag: sealed.tag,
    })
}

/// `len(target) || target || sealed key || iv`
fn layer_aad(target: &PeerAddress, sealed_key: &SealedBox, iv: &[u8; IV_LEN]) -> Vec<u8> {
    let authority = target.authority();
    let sealed = sealed_key.to_bytes();
    let mut aad = Vec::with_capacity(4 + authority.len() + sealed.len() + IV_LEN);
    aad.extend_from_slice(&(authority.len() as u32).to_be_bytes());
    aad.extend_from_slice(authority.as_bytes());
    aad.extend_from_slice(&sealed);
    aad.extend_from_slice(iv);
    aad
}
