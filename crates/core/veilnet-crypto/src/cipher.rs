//! Symmetric authenticated encryption for onion layer payloads.

use crate::{CryptoError, Result};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Session key length (AES-256).
pub const SESSION_KEY_LEN: usize = 32;
/// GCM nonce length.
pub const IV_LEN: usize = 12;
/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// A fresh symmetric key for exactly one onion layer.
pub struct SessionKey(Zeroizing<[u8; SESSION_KEY_LEN]>);

impl SessionKey {
    /// Generates a random session key.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        OsRng.fill_bytes(key.as_mut_slice());
        Self(key)
    }

    /// Rebuilds a key recovered from a sealed box.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SESSION_KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Raw key bytes, for sealing to the hop.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.as_bytes()).map_err(|_| CryptoError::InvalidKey)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Output of [`encrypt_detached`]: the tag is kept apart from the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedCiphertext {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Encrypts `plaintext` under `key` with a random IV, binding `aad`.
pub fn encrypt_detached(key: &SessionKey, aad: &[u8], plaintext: &[u8]) -> Result<DetachedCiphertext> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    encrypt_detached_with_iv(key, iv, aad, plaintext)
}

/// Encrypts with a caller-chosen IV. The IV must never repeat under one key.
pub fn encrypt_detached_with_iv(
    key: &SessionKey,
    iv: [u8; IV_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<DetachedCiphertext> {
    let cipher = key.cipher()?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(DetachedCiphertext {
        iv,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypts and authenticates. Any mismatch is reported as `OpenFailed`.
pub fn decrypt_detached(
    key: &SessionKey,
    aad: &[u8],
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>> {
    let cipher = key.cipher().map_err(|_| CryptoError::OpenFailed)?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buffer, Tag::from_slice(tag))
        .map_err(|_| CryptoError::OpenFailed)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_round_trip() {
        let key = SessionKey::generate();
        let sealed = encrypt_detached(&key, b"aad", b"layer body").unwrap();
        assert_ne!(sealed.ciphertext, b"layer body");
        let opened = decrypt_detached(&key, b"aad", &sealed.iv, &sealed.ciphertext, &sealed.tag).unwrap();
        assert_eq!(opened, b"layer body");
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let key = SessionKey::generate();
        let sealed = encrypt_detached(&key, b"one", b"body").unwrap();
        let result = decrypt_detached(&key, b"two", &sealed.iv, &sealed.ciphertext, &sealed.tag);
        assert!(matches!(result, Err(CryptoError::OpenFailed)));
    }

    #[test]
    fn test_flipped_tag_fails() {
        let key = SessionKey::generate();
        let sealed = encrypt_detached(&key, b"", b"body").unwrap();
        let mut tag = sealed.tag;
        tag[0] ^= 0x01;
        let result = decrypt_detached(&key, b"", &sealed.iv, &sealed.ciphertext, &tag);
        assert!(matches!(result, Err(CryptoError::OpenFailed)));
    }

    #[test]
    fn test_session_key_length_is_checked() {
        assert!(SessionKey::from_slice(&[0u8; 16]).is_err());
        assert!(SessionKey::from_slice(&[0u8; 32]).is_ok());
    }
}
