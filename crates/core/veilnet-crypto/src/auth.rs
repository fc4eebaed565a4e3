//! Pairwise message authentication between two identity keys.
//!
//! Both ends derive the same HMAC-SHA256 key from a static X25519 agreement,
//! so a tag proves the message came from the holder of the other identity
//! key. Tags are not transferable: a third node cannot check them.

use crate::keys::{PublicKey, PUBLIC_KEY_LEN};
use crate::{CryptoError, Result};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Length of a pairwise authentication tag.
pub const AUTH_TAG_LEN: usize = 32;

const AUTH_INFO: &[u8] = b"veilnet pairwise auth v1";

pub(crate) fn authenticate(
    secret: &StaticSecret,
    own_public: &PublicKey,
    peer: &PublicKey,
    message: &[u8],
) -> Result<[u8; AUTH_TAG_LEN]> {
    let mut mac = pairwise_mac(secret, own_public, peer)?;
    mac.update(message);
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

pub(crate) fn verify(
    secret: &StaticSecret,
    own_public: &PublicKey,
    peer: &PublicKey,
    message: &[u8],
    tag: &[u8],
) -> Result<()> {
    let mut mac = pairwise_mac(secret, own_public, peer).map_err(|_| CryptoError::OpenFailed)?;
    mac.update(message);
    mac.verify_slice(tag).map_err(|_| CryptoError::OpenFailed)
}

fn pairwise_mac(secret: &StaticSecret, own_public: &PublicKey, peer: &PublicKey) -> Result<HmacSha256> {
    let shared = secret.diffie_hellman(&peer.to_dalek());
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }

    // Same salt on both ends regardless of who signs.
    let (low, high) = if own_public.as_bytes() <= peer.as_bytes() {
        (own_public, peer)
    } else {
        (peer, own_public)
    };
    let mut salt = Vec::with_capacity(PUBLIC_KEY_LEN * 2);
    salt.extend_from_slice(low.as_bytes());
    salt.extend_from_slice(high.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(AUTH_INFO, key.as_mut_slice())
        .map_err(|_| CryptoError::KeyDerivation)?;
    HmacSha256::new_from_slice(key.as_slice()).map_err(|_| CryptoError::InvalidKey)
}

#[cfg(test)]
mod tests {
    use crate::{CryptoError, IdentityKeyPair, PublicKey};

    #[test]
    fn test_both_ends_agree() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let tag = alice.authenticate(&bob.public_key(), b"ban example.com").unwrap();
        bob.verify(&alice.public_key(), b"ban example.com", &tag).unwrap();
        assert_eq!(bob.authenticate(&alice.public_key(), b"ban example.com").unwrap(), tag);
    }

    #[test]
    fn test_third_party_cannot_forge() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();

        let forged = mallory.authenticate(&bob.public_key(), b"ban example.com").unwrap();
        assert!(matches!(
            bob.verify(&alice.public_key(), b"ban example.com", &forged),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn test_message_is_bound() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let tag = alice.authenticate(&bob.public_key(), b"ban example.com").unwrap();
        assert!(bob.verify(&alice.public_key(), b"unban example.com", &tag).is_err());
        assert!(bob.verify(&alice.public_key(), b"ban example.com", &tag[..16]).is_err());
    }

    #[test]
    fn test_low_order_peer_is_rejected() {
        let alice = IdentityKeyPair::generate();
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(alice.authenticate(&zero, b"x"), Err(CryptoError::InvalidKey)));
    }
}
