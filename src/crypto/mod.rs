//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - PBKDF2-SHA256 derivation of the shared key material from a passphrase
//! - AES-128-GCM sealing/opening with a salt-plus-sequence nonce scheme

mod cipher;
mod kdf;

pub use cipher::Security;
pub use kdf::{derive_key, derive_nonce_salt};

use thiserror::Error;

/// Length of the symmetric key in bytes
pub const KEY_LEN: usize = 16;

/// Length of the AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Length of the fixed nonce salt in bytes
pub const SALT_LEN: usize = 4;

/// Length of the per-record sequence in bytes
pub const SEQ_LEN: usize = 8;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key setup failed")]
    KeySetup,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,

    #[error("Sealed record too short: {0} bytes")]
    TruncatedRecord(usize),
}
