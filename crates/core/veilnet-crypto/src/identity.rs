//! Long-term node identity keys.

use crate::auth::{self, AUTH_TAG_LEN};
use crate::keys::PublicKey;
use crate::sealed::{self, SealedBox};
use crate::{CryptoError, Result};
use rand::rngs::OsRng;
use std::fmt;
use std::path::Path;
use tracing::info;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

/// A node's X25519 identity key pair.
///
/// The secret half never leaves this struct; it is read-only after
/// construction and safe to share across tasks behind an `Arc`.
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restores a key pair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    /// Restores a key pair from a hex-encoded secret.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim()).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?,
        );
        let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::from_secret_bytes(array))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Loads the key stored at `path`, generating and persisting one if the
    /// file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let encoded = Zeroizing::new(std::fs::read_to_string(path)?);
            let identity = Self::from_hex(&encoded)?;
            info!(path = %path.display(), public_key = %identity.public, "loaded identity key");
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(path = %path.display(), public_key = %identity.public, "generated identity key");
        Ok(identity)
    }

    /// Writes the hex-encoded secret to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let encoded = Zeroizing::new(hex::encode(self.secret.to_bytes()));
        std::fs::write(path, encoded.as_bytes())?;
        restrict_permissions(path)?;
        Ok(())
    }

    /// The public half, safe to publish in the directory.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Encrypts `plaintext` for the holder of `peer` and returns the flat
    /// sealed-box bytes. Only meant for short secrets such as session keys.
    pub fn encrypt_for(peer: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed::seal(peer, plaintext)?.to_bytes())
    }

    /// Decrypts bytes produced by [`IdentityKeyPair::encrypt_for`] for this key.
    pub fn decrypt(&self, sealed_bytes: &[u8]) -> Result<Vec<u8>> {
        let sealed = SealedBox::from_bytes(sealed_bytes)?;
        self.open(&sealed)
    }

    /// Opens a structured sealed box addressed to this key.
    pub fn open(&self, sealed: &SealedBox) -> Result<Vec<u8>> {
        sealed::open(&self.secret, &self.public, sealed)
    }

    /// Tags `message` so that only `peer` can check it came from this key.
    pub fn authenticate(&self, peer: &PublicKey, message: &[u8]) -> Result<[u8; AUTH_TAG_LEN]> {
        auth::authenticate(&self.secret, &self.public, peer, message)
    }

    /// Checks a tag produced by `peer` with [`IdentityKeyPair::authenticate`]
    /// for this key. Any mismatch is `OpenFailed`.
    pub fn verify(&self, peer: &PublicKey, message: &[u8], tag: &[u8]) -> Result<()> {
        auth::verify(&self.secret, &self.public, peer, message, tag)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_for_and_decrypt() {
        let node = IdentityKeyPair::generate();
        let sealed = IdentityKeyPair::encrypt_for(&node.public_key(), b"hello").unwrap();
        assert_eq!(node.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_other_key_cannot_decrypt() {
        let node = IdentityKeyPair::generate();
        let stranger = IdentityKeyPair::generate();
        let sealed = IdentityKeyPair::encrypt_for(&node.public_key(), b"hello").unwrap();
        assert!(matches!(stranger.decrypt(&sealed), Err(CryptoError::OpenFailed)));
    }

    #[test]
    fn test_hex_restore_keeps_public_key() {
        let node = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_hex(&hex::encode(node.secret.to_bytes())).unwrap();
        assert_eq!(restored.public_key(), node.public_key());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = IdentityKeyPair::load_or_generate(&path).unwrap();
        let second = IdentityKeyPair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_debug_hides_secret() {
        let node = IdentityKeyPair::generate();
        let rendered = format!("{node:?}");
        assert!(!rendered.contains(&hex::encode(node.secret.to_bytes())));
    }
}
