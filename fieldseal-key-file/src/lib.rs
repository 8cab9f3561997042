//! Local master key KMS for `FieldSeal`.
//!
//! The master key is held in process memory, loaded from base64 text or from
//! a key file. This client is suitable for development and testing
//! environments; production deployments should wrap DEKs with a managed KMS.
//!
//! Key directory layout written by [`LocalKms::init`]:
//! ```text
//! keys/
//! └── master.key      (base64 of 32 bytes, 0600 permissions)
//! ```

#![warn(clippy::pedantic, clippy::nursery)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use fieldseal::error::KmsError;
use fieldseal::kms::{KmsClient, KmsProviderKind, LocalCredentials, MasterKeyRef};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString, SecretVec};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Size of the local master key in bytes.
pub const MASTER_KEY_SIZE: usize = 32;

/// File name of the master key inside a key directory.
pub const MASTER_KEY_FILE: &str = "master.key";

const NONCE_SIZE: usize = 12;

/// KMS that wraps DEKs with a locally held master key.
///
/// Wrapped blobs are `nonce || ChaCha20-Poly1305(dek)`, authenticated against
/// the master key id so a blob cannot be unwrapped under another reference.
pub struct LocalKms {
    master_key: SecretVec<u8>,
}

impl fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKms").field("master_key", &"[REDACTED]").finish()
    }
}

impl LocalKms {
    /// Creates a client from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::KeyNotFound` if the key is not 32 bytes.
    pub fn new(master_key: SecretVec<u8>) -> Result<Self, KmsError> {
        let len = master_key.expose_secret().len();
        if len != MASTER_KEY_SIZE {
            return Err(KmsError::KeyNotFound(format!(
                "local master key must be {MASTER_KEY_SIZE} bytes, got {len}"
            )));
        }
        Ok(Self { master_key })
    }

    /// Creates a client from base64 text.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::KeyNotFound` if the text is not base64 of a
    /// 32-byte key.
    pub fn from_base64(encoded: &SecretString) -> Result<Self, KmsError> {
        let bytes = STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|e| KmsError::KeyNotFound(format!("local master key is not base64: {e}")))?;
        Self::new(SecretVec::new(bytes))
    }

    /// Creates a client from configured credentials.
    ///
    /// # Errors
    ///
    /// See [`LocalKms::from_base64`].
    pub fn from_credentials(credentials: &LocalCredentials) -> Result<Self, KmsError> {
        Self::from_base64(&credentials.key)
    }

    /// Loads the master key from a key file or a key directory.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Io` if the file cannot be read, or
    /// `KmsError::KeyNotFound` if its content is not a valid key.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KmsError> {
        let path = key_file_path(path.as_ref());
        let text = Zeroizing::new(fs::read_to_string(&path)?);
        debug!(path = %path.display(), "loaded local master key");
        Self::from_base64(&SecretString::new(text.trim().to_string()))
    }

    /// Creates `key_dir` if needed and writes a fresh master key into it.
    ///
    /// Returns the path of the key file. An existing key file is never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Io` if the directory cannot be created or the key
    /// file already exists.
    pub fn init(key_dir: impl Into<PathBuf>) -> Result<PathBuf, KmsError> {
        let key_dir = key_dir.into();
        fs::create_dir_all(&key_dir)?;
        let path = key_dir.join(MASTER_KEY_FILE);

        let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        let encoded = Zeroizing::new(STANDARD.encode(&key[..]));

        write_secret_file(&path, encoded.as_bytes())?;
        info!(path = %path.display(), "generated local master key");
        Ok(path)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.master_key.expose_secret()))
    }
}

fn key_file_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(MASTER_KEY_FILE)
    } else {
        path.to_path_buf()
    }
}

fn write_secret_file(path: &Path, contents: &[u8]) -> Result<(), KmsError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.flush()?;
    Ok(())
}

#[async_trait::async_trait]
impl KmsClient for LocalKms {
    fn provider(&self) -> KmsProviderKind {
        KmsProviderKind::Local
    }

    async fn wrap(&self, master_key: &MasterKeyRef, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError> {
        self.ensure_provider(master_key)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let payload = Payload { msg: dek.expose_secret(), aad: master_key.key_id().as_bytes() };
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| KmsError::WrapFailed("AEAD encryption failed".into()))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    async fn unwrap(&self, master_key: &MasterKeyRef, wrapped: &[u8]) -> Result<SecretVec<u8>, KmsError> {
        self.ensure_provider(master_key)?;

        if wrapped.len() < NONCE_SIZE {
            return Err(KmsError::UnwrapFailed("wrapped key is truncated".into()));
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_SIZE);
        let payload = Payload { msg: ciphertext, aad: master_key.key_id().as_bytes() };
        let dek = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| KmsError::UnwrapFailed("wrong master key or corrupted wrapped key".into()))?;
        Ok(SecretVec::new(dek))
    }
}
