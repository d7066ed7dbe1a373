//! # AES-256-GCM Payload Cipher
//!
//! The symmetric half of the envelope scheme. Every message and every file
//! chunk is sealed here under a key that exists for exactly one envelope,
//! so nonce reuse under a given key cannot happen in practice. We still
//! draw the 96-bit IV from `OsRng` rather than using a counter: the IV is
//! transmitted anyway, and a random one costs nothing.
//!
//! The envelope header (version byte and ephemeral public key) is passed as
//! AAD. Swapping the ephemeral key of one envelope onto another therefore
//! fails GCM authentication even before the integrity tag is looked at.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH};

/// Errors from the payload cipher.
///
/// Kept vague on purpose. "Wrong key" and "corrupted ciphertext" look the
/// same from the outside.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {AES_TAG_LENGTH} bytes")]
    CiphertextTooShort,
}

/// Generate a fresh random IV.
pub fn random_iv() -> [u8; AES_NONCE_LENGTH] {
    let mut iv = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Seal `plaintext` under `key` with a fresh random IV, authenticating `aad`.
///
/// Returns `(iv, ciphertext)`. The ciphertext carries the 16-byte GCM tag
/// at its end.
pub fn seal(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; AES_NONCE_LENGTH], Vec<u8>), EncryptionError> {
    let iv = random_iv();
    let ciphertext = seal_with_iv(key, &iv, plaintext, aad)?;
    Ok((iv, ciphertext))
}

/// Seal with a caller-chosen IV. Only the envelope code and tests need this.
pub(crate) fn seal_with_iv(
    key: &[u8; AES_KEY_LENGTH],
    iv: &[u8; AES_NONCE_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    cipher
        .encrypt(Nonce::from_slice(iv), payload)
        .map_err(|_| EncryptionError::EncryptFailed)
}

/// Open a ciphertext produced by [`seal`]. `iv` and `aad` must match.
pub fn open(
    key: &[u8; AES_KEY_LENGTH],
    iv: &[u8; AES_NONCE_LENGTH],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if ciphertext.len() < AES_TAG_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    cipher
        .decrypt(Nonce::from_slice(iv), payload)
        .map_err(|_| EncryptionError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(7);
        }
        key
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let (iv, ct) = seal(&key, b"meet at the usual relay", b"header").unwrap();
        assert_eq!(ct.len(), 23 + AES_TAG_LENGTH);
        assert_eq!(open(&key, &iv, &ct, b"header").unwrap(), b"meet at the usual relay");
    }

    #[test]
    fn test_empty_plaintext_is_just_a_tag() {
        let key = test_key();
        let (iv, ct) = seal(&key, b"", b"").unwrap();
        assert_eq!(ct.len(), AES_TAG_LENGTH);
        assert!(open(&key, &iv, &ct, b"").unwrap().is_empty());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = test_key();
        let (iv, ct) = seal(&key, b"secret", b"right").unwrap();
        assert_eq!(
            open(&key, &iv, &ct, b"wrong"),
            Err(EncryptionError::DecryptFailed)
        );
    }

    #[test]
    fn test_wrong_key_and_wrong_iv_fail() {
        let key = test_key();
        let (iv, ct) = seal(&key, b"secret", b"").unwrap();

        let mut other_key = key;
        other_key[31] ^= 1;
        assert!(open(&other_key, &iv, &ct, b"").is_err());

        let mut other_iv = iv;
        other_iv[0] ^= 1;
        assert!(open(&key, &other_iv, &ct, b"").is_err());
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let key = test_key();
        assert_eq!(
            open(&key, &[0u8; AES_NONCE_LENGTH], &[0u8; 3], b""),
            Err(EncryptionError::CiphertextTooShort)
        );
    }

    #[test]
    fn test_random_ivs_differ() {
        assert_ne!(random_iv(), random_iv());
    }
}
