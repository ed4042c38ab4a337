//! Key derivation
//!
//! PBKDF2-HMAC-SHA256 with fixed salt labels and a fixed iteration count, so
//! that both tunnel endpoints derive identical material from the passphrase
//! alone.

use super::{KEY_LEN, SALT_LEN};
use ring::pbkdf2::{self, PBKDF2_HMAC_SHA256};
use std::num::NonZeroU32;

const ITERATIONS: u32 = 4096;
const KEY_SALT: &[u8] = b"detour/key";
const NONCE_SALT: &[u8] = b"detour/nonce";

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(ITERATIONS).expect("nonzero iteration count")
}

/// Derive the AEAD key from a passphrase.
pub fn derive_key(passkey: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(PBKDF2_HMAC_SHA256, iterations(), KEY_SALT, passkey.as_bytes(), &mut key);
    key
}

/// Derive the fixed nonce salt from the AEAD key.
pub fn derive_nonce_salt(key: &[u8; KEY_LEN]) -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    pbkdf2::derive(PBKDF2_HMAC_SHA256, iterations(), NONCE_SALT, key, &mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_deterministic() {
        let k1 = derive_key("passkey");
        let k2 = derive_key("passkey");
        assert_eq!(k1, k2);
        assert_eq!(derive_nonce_salt(&k1), derive_nonce_salt(&k2));
    }

    #[test]
    fn test_different_passphrases_diverge() {
        assert_ne!(derive_key("one"), derive_key("two"));
    }
}
