//! Error types for cryptographic operations

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material has the wrong length or is not a usable point
    #[error("Invalid key material")]
    InvalidKey,

    /// Hex or binary encoding could not be decoded
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Encryption failed
    #[error("Seal failed")]
    SealFailed,

    /// Decryption or authentication failed.
    ///
    /// Carries no detail: wrong key, tampered ciphertext and tag mismatch
    /// must look identical to the caller.
    #[error("Open failed")]
    OpenFailed,

    /// Key derivation failed
    #[error("Key derivation failed")]
    KeyDerivation,

    /// Key file could not be read or written
    #[error("Key storage error: {0}")]
    Io(#[from] std::io::Error),
}
