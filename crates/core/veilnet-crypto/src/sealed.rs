//! Sealed boxes: asymmetric encryption of short secrets to an X25519 key.
//!
//! A fresh ephemeral key is agreed with the recipient's static key, the
//! shared secret is expanded with HKDF-SHA256 and the message is sealed with
//! ChaCha20-Poly1305. Only the holder of the recipient's static secret can
//! open the box. Used to wrap per-layer session keys, never bulk payloads.

use crate::keys::{PublicKey, PUBLIC_KEY_LEN};
use crate::{CryptoError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

/// Nonce length for the sealing cipher.
pub const SEAL_NONCE_LEN: usize = 12;

const SEAL_INFO: &[u8] = b"veilnet sealed box v1";

/// Ciphertext produced by [`seal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Ephemeral X25519 public key of the sender
    pub ephemeral_public: [u8; PUBLIC_KEY_LEN],
    /// Nonce used for ChaCha20-Poly1305
    pub nonce: [u8; SEAL_NONCE_LEN],
    /// Ciphertext with the Poly1305 tag appended
    pub ciphertext: Vec<u8>,
}

impl SealedBox {
    /// Flat encoding: `ephemeral_public || nonce || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + SEAL_NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.ephemeral_public);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parses the flat encoding produced by [`SealedBox::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PUBLIC_KEY_LEN + SEAL_NONCE_LEN {
            return Err(CryptoError::OpenFailed);
        }
        let (ephemeral, rest) = bytes.split_at(PUBLIC_KEY_LEN);
        let (nonce, ciphertext) = rest.split_at(SEAL_NONCE_LEN);

        let mut ephemeral_public = [0u8; PUBLIC_KEY_LEN];
        ephemeral_public.copy_from_slice(ephemeral);
        let mut nonce_bytes = [0u8; SEAL_NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce);

        Ok(Self {
            ephemeral_public,
            nonce: nonce_bytes,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Seals `plaintext` so only the owner of `recipient` can open it.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<SealedBox> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(x25519_dalek::PublicKey::from(&ephemeral));

    let shared = ephemeral.diffie_hellman(&recipient.to_dalek());
    let key = derive_key(&shared, &ephemeral_public, recipient)?;

    let mut nonce = [0u8; SEAL_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let aad = associated_data(&ephemeral_public, recipient);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| CryptoError::SealFailed)?;

    Ok(SealedBox {
        ephemeral_public: *ephemeral_public.as_bytes(),
        nonce,
        ciphertext,
    })
}

/// Opens a box sealed to the public half of `secret`.
pub(crate) fn open(secret: &StaticSecret, own_public: &PublicKey, sealed: &SealedBox) -> Result<Vec<u8>> {
    let ephemeral_public = PublicKey::from_bytes(sealed.ephemeral_public);
    let shared = secret.diffie_hellman(&ephemeral_public.to_dalek());
    let key = derive_key(&shared, &ephemeral_public, own_public).map_err(|_| CryptoError::OpenFailed)?;

    let aad = associated_data(&ephemeral_public, own_public);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload { msg: &sealed.ciphertext, aad: &aad },
        )
        .map_err(|_| CryptoError::OpenFailed)
}

fn derive_key(
    shared: &SharedSecret,
    ephemeral_public: &PublicKey,
    recipient: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>> {
    // Low-order points yield an all-zero secret.
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }

    let salt = associated_data(ephemeral_public, recipient);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(SEAL_INFO, okm.as_mut_slice())
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

fn associated_data(ephemeral_public: &PublicKey, recipient: &PublicKey) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PUBLIC_KEY_LEN * 2);
    aad.extend_from_slice(ephemeral_public.as_bytes());
    aad.extend_from_slice(recipient.as_bytes());
    aad
}
