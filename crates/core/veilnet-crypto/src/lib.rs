//! # VeilNet Crypto
//!
//! Identity keys and hybrid encryption primitives for the VeilNet onion
//! routing layer.
//!
//! Asymmetric encryption has a hard plaintext ceiling, so it is only ever used
//! to wrap a short symmetric session key ([`sealed`]); layer payloads of any
//! size go through AES-256-GCM ([`cipher`]).
//!
//! ## Example
//!
//! ```rust
//! use veilnet_crypto::IdentityKeyPair;
//!
//! let relay = IdentityKeyPair::generate();
//! let sealed = IdentityKeyPair::encrypt_for(&relay.public_key(), b"session key").unwrap();
//! assert_eq!(relay.decrypt(&sealed).unwrap(), b"session key");
//! ```

pub mod auth;
pub mod cipher;
pub mod error;
pub mod identity;
pub mod keys;
pub mod sealed;

pub use auth::AUTH_TAG_LEN;
pub use cipher::{DetachedCiphertext, SessionKey, IV_LEN, SESSION_KEY_LEN, TAG_LEN};
pub use error::{CryptoError, Result};
pub use identity::IdentityKeyPair;
pub use keys::{PublicKey, PUBLIC_KEY_LEN};
pub use sealed::{seal, SealedBox};
