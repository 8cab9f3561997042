//! Randomized authenticated encryption for fields without query support.
//!
//! Uses ChaCha20-Poly1305 with a fresh random nonce per call, so encrypting
//! the same value twice yields unrelated ciphertexts.

use crate::error::Error;
use crate::kdf::SUBKEY_SIZE;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Randomized cipher over a 32-byte sub-key.
pub struct RandomizedCipher {
    key: SecretVec<u8>,
}

impl RandomizedCipher {
    /// Creates a cipher from a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` if the key is not 32 bytes.
    pub fn new(key: SecretVec<u8>) -> Result<Self, Error> {
        let actual = key.expose_secret().len();
        if actual != SUBKEY_SIZE {
            return Err(Error::InvalidKeyLength { expected: SUBKEY_SIZE, actual });
        }
        Ok(Self { key })
    }

    /// Encrypts `plaintext` under a fresh nonce, returning `(nonce, ciphertext)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if the AEAD fails.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), Error> {
        let cipher = ChaCha20Poly1305::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::Encryption(format!("Invalid key: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher.encrypt(&nonce, Payload { msg: plaintext, aad }).map_err(|e| {
            Error::Encryption(format!("ChaCha20-Poly1305 encryption failed: {e}"))
        })?;

        Ok((nonce_bytes, ciphertext))
    }

    /// Decrypts a ciphertext produced by [`RandomizedCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` for a malformed nonce and
    /// `Error::AuthenticationFailed` if the tag does not verify.
    pub fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = ChaCha20Poly1305::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::Decryption(format!("Invalid key: {e}")))?;

        let nonce_bytes: [u8; NONCE_SIZE] = nonce
            .try_into()
            .map_err(|_| Error::Decryption("Invalid nonce size".to_string()))?;
        let nonce = Nonce::from(nonce_bytes);

        cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| Error::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> RandomizedCipher {
        RandomizedCipher::new(SecretVec::new(vec![42u8; SUBKEY_SIZE])).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let c = cipher();
        let (nonce, ct) = c.encrypt(b"John G", b"aad").unwrap();
        assert_eq!(c.decrypt(&nonce, &ct, b"aad").unwrap(), b"John G");
    }

    #[test]
    fn test_same_plaintext_different_ciphertexts() {
        let c = cipher();
        let (n1, ct1) = c.encrypt(b"John G", b"aad").unwrap();
        let (n2, ct2) = c.encrypt(b"John G", b"aad").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let c = cipher();
        let (nonce, ct) = c.encrypt(b"John G", b"aad").unwrap();
        assert!(matches!(c.decrypt(&nonce, &ct, b"other"), Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_corrupted_ciphertext_fails() {
        let c = cipher();
        let (nonce, mut ct) = c.encrypt(b"John G", b"aad").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(c.decrypt(&nonce, &ct, b"aad").is_err());
    }

    #[test]
    fn test_bad_nonce_size() {
        let c = cipher();
        let (_, ct) = c.encrypt(b"x", b"aad").unwrap();
        assert!(matches!(c.decrypt(&[0; 5], &ct, b"aad"), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_large_plaintext() {
        let c = cipher();
        let plaintext = vec![42u8; 10_000];
        let (nonce, ct) = c.encrypt(&plaintext, b"aad").unwrap();
        assert_eq!(c.decrypt(&nonce, &ct, b"aad").unwrap(), plaintext);
    }

    #[test]
    fn test_invalid_key_length() {
        let result = RandomizedCipher::new(SecretVec::new(vec![0; 64]));
        assert!(matches!(result, Err(Error::InvalidKeyLength { expected: 32, actual: 64 })));
    }
}
