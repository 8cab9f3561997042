//! Deterministic encryption using AES-SIV for equality-queryable fields.
//!
//! AES-SIV (Synthetic IV) is a misuse-resistant authenticated encryption mode
//! that produces identical output for identical plaintext, key and associated
//! data. Equality lookups then compare ciphertext without decrypting the
//! collection.
//!
//! # Security Warning
//!
//! Deterministic encryption reveals equality patterns. Use it only for fields
//! declared with equality queries. Other fields use the randomized cipher.

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead,
};
use secrecy::{ExposeSecret, SecretVec};

use crate::error::Error;
use crate::kdf::DEK_SIZE;

/// Deterministic encryption using AES-256-SIV.
///
/// # Example
///
/// ```
/// use fieldseal::deterministic::DeterministicCipher;
/// use secrecy::SecretVec;
///
/// let cipher = DeterministicCipher::new(SecretVec::new(vec![7u8; 64])).unwrap();
/// let ct1 = cipher.encrypt(b"1111-1111-1111-1111", b"qe.users|card").unwrap();
/// let ct2 = cipher.encrypt(b"1111-1111-1111-1111", b"qe.users|card").unwrap();
/// assert_eq!(ct1, ct2);
/// ```
pub struct DeterministicCipher {
    /// AES-256-SIV requires a 64-byte key (512 bits)
    key: SecretVec<u8>,
}

impl DeterministicCipher {
    /// Creates a cipher from a 64-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` if the key is not 64 bytes.
    pub fn new(key: SecretVec<u8>) -> Result<Self, Error> {
        let actual = key.expose_secret().len();
        if actual != DEK_SIZE {
            return Err(Error::InvalidKeyLength { expected: DEK_SIZE, actual });
        }
        Ok(Self { key })
    }

    /// Encrypts `plaintext`, binding it to `aad`.
    ///
    /// Same plaintext and same `aad` always produce the same ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if the cipher cannot be constructed or
    /// fails.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Aes256SivAead::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::Encryption(format!("Failed to create AES-SIV cipher: {e}")))?;

        // AES-SIV derives its IV from the input; a fixed nonce keeps it deterministic
        cipher
            .encrypt(&Default::default(), Payload { msg: plaintext, aad })
            .map_err(|e| Error::Encryption(format!("AES-SIV encryption failed: {e}")))
    }

    /// Decrypts ciphertext produced with the same key and `aad`.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthenticationFailed` if the ciphertext is corrupted,
    /// the key differs or `aad` differs.
    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Aes256SivAead::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::Decryption(format!("Failed to create AES-SIV cipher: {e}")))?;

        cipher
            .decrypt(&Default::default(), Payload { msg: ciphertext, aad })
            .map_err(|_| Error::AuthenticationFailed)
    }
}
