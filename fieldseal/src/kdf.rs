//! Key generation and sub-key derivation using HKDF (HMAC-based Key Derivation
//! Function).
//!
//! A data encryption key is 64 random bytes: the full key drives AES-256-SIV
//! for equality-queryable fields, and a 32-byte sub-key derived with
//! HKDF-SHA256 drives ChaCha20-Poly1305 for randomized fields.

use crate::context::FieldContext;
use crate::error::Error;
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

/// Data encryption key size in bytes (AES-256-SIV needs 512 bits).
pub const DEK_SIZE: usize = 64;

/// Randomized-mode sub-key size in bytes (256 bits).
pub const SUBKEY_SIZE: usize = 32;

const RANDOMIZED_INFO_PREFIX: &str = "fieldseal/randomized/v1|";

/// Derives the randomized-mode sub-key of a DEK for one field.
///
/// The derivation uses the field context as part of the `info` parameter so
/// that sub-keys are never shared between fields, even if a DEK were.
///
/// # Errors
///
/// Returns `Error::KeyDerivation` if the derivation fails.
///
/// # Example
///
/// ```
/// use fieldseal::kdf::{derive_randomized_key, DEK_SIZE};
/// use fieldseal::context::{FieldContext, FieldPath};
/// use secrecy::SecretVec;
///
/// let dek = SecretVec::new(vec![0u8; DEK_SIZE]);
/// let context = FieldContext::new("db.users".parse().unwrap(), FieldPath::new("email").unwrap());
/// let key = derive_randomized_key(&dek, &context).expect("sub-key derivation failed");
/// ```
pub fn derive_randomized_key(
    dek: &SecretVec<u8>,
    context: &FieldContext,
) -> Result<SecretVec<u8>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, dek.expose_secret());

    let info = format!("{RANDOMIZED_INFO_PREFIX}{context}");

    let mut key = vec![0u8; SUBKEY_SIZE];
    hkdf.expand(info.as_bytes(), &mut key).map_err(|_| Error::KeyDerivation)?;

    Ok(SecretVec::new(key))
}

/// Generates a fresh random DEK.
///
/// This DEK must be wrapped by the KMS before it is stored.
///
/// # Example
///
/// ```
/// use fieldseal::kdf::generate_dek;
/// use secrecy::ExposeSecret;
///
/// let dek = generate_dek();
/// assert_eq!(dek.expose_secret().len(), 64);
/// ```
#[must_use]
pub fn generate_dek() -> SecretVec<u8> {
    use chacha20poly1305::aead::{rand_core::RngCore, OsRng};

    let mut dek = vec![0u8; DEK_SIZE];
    OsRng.fill_bytes(&mut dek);
    SecretVec::new(dek)
}
