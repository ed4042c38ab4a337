//! AEAD sealing/opening for tunnel records
//!
//! One `Security` context is shared by every connection of a proxy or
//! endpoint. The sequence counter lives in the context, not the connection,
//! so a nonce is never reused across concurrent sessions under the same key.

use std::sync::atomic::{AtomicU64, Ordering};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};

use super::{kdf, CryptoError, KEY_LEN, NONCE_LEN, SALT_LEN, SEQ_LEN, TAG_LEN};

/// Shared AEAD context: key, fixed nonce salt, record sequence counter.
///
/// A sealed record is `seq(8, big-endian) ‖ ciphertext ‖ tag`; the nonce is
/// `salt(4) ‖ seq(8)` and the sequence doubles as associated data, so a
/// record replayed under a different sequence fails to open.
pub struct Security {
    key: LessSafeKey,
    salt: [u8; SALT_LEN],
    seq: AtomicU64,
}

impl Security {
    /// Build a context from a passphrase. Both tunnel endpoints must use the
    /// same passphrase or no session will decrypt.
    pub fn new(passkey: &str) -> Result<Self, CryptoError> {
        let key_bytes = kdf::derive_key(passkey);
        let salt = kdf::derive_nonce_salt(&key_bytes);
        let unbound = UnboundKey::new(&AES_128_GCM, &key_bytes).map_err(|_| CryptoError::KeySetup)?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            salt,
            seq: AtomicU64::new(0),
        })
    }

    /// Next sequence value, 1-based, big-endian. Wraps at u64::MAX.
    fn next_seq(&self) -> [u8; SEQ_LEN] {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        seq.to_be_bytes()
    }

    fn nonce_for(&self, seq: &[u8]) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..SALT_LEN].copy_from_slice(&self.salt);
        nonce[SALT_LEN..].copy_from_slice(seq);
        Nonce::assume_unique_for_key(nonce)
    }

    /// Seal a plaintext into a self-describing record.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let seq = self.next_seq();
        let nonce = self.nonce_for(&seq);

        let mut record = Vec::with_capacity(SEQ_LEN + plaintext.len() + TAG_LEN);
        record.extend_from_slice(&seq);
        record.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(seq), &mut record[SEQ_LEN..])
            .map_err(|_| CryptoError::Encryption)?;
        record.extend_from_slice(tag.as_ref());

        Ok(record)
    }

    /// Open a sealed record, verifying tag and sequence binding.
    pub fn open(&self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < SEQ_LEN + TAG_LEN {
            return Err(CryptoError::TruncatedRecord(record.len()));
        }

        let (seq, ciphertext) = record.split_at(SEQ_LEN);
        let nonce = self.nonce_for(seq);

        let mut buf = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(seq), &mut buf)
            .map_err(|_| CryptoError::Decryption)?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let sealer = Security::new("passkey").unwrap();
        let opener = Security::new("passkey").unwrap();

        for payload in [&b"hello"[..], &[0u8; 0][..], &[0xAA; 64 * 1024][..]] {
            let record = sealer.seal(payload).unwrap();
            assert_eq!(opener.open(&record).unwrap(), payload);
        }
    }

    #[test]
    fn test_sequences_never_repeat() {
        let sec = Security::new("passkey").unwrap();
        let a = sec.seal(b"one").unwrap();
        let b = sec.seal(b"one").unwrap();
        assert_ne!(a[..SEQ_LEN], b[..SEQ_LEN]);
        // identical plaintexts must not produce identical ciphertexts
        assert_ne!(a[SEQ_LEN..], b[SEQ_LEN..]);
    }

    #[test]
    fn test_tamper_detection() {
        let sec = Security::new("passkey").unwrap();
        let mut record = sec.seal(b"payload").unwrap();

        for i in 0..record.len() {
            record[i] ^= 0xFF;
            assert!(sec.open(&record).is_err(), "byte {i} tamper not caught");
            record[i] ^= 0xFF;
        }
        // untouched record still opens
        assert_eq!(sec.open(&record).unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealer = Security::new("passkey").unwrap();
        let opener = Security::new("other").unwrap();
        let record = sealer.seal(b"payload").unwrap();
        assert!(opener.open(&record).is_err());
    }

    #[test]
    fn test_truncated_record_rejected() {
        let sec = Security::new("passkey").unwrap();
        match sec.open(&[0u8; SEQ_LEN + TAG_LEN - 1]) {
            Err(CryptoError::TruncatedRecord(_)) => {}
            other => panic!("expected TruncatedRecord, got {:?}", other),
        }
    }
}
