//! Error types for `FieldSeal` operations.

use std::fmt;
use std::time::Duration;

/// Main error type for `FieldSeal` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed (wrong key, wrong field binding, malformed payload)
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Authentication tag verification failed (data may be corrupted or tampered)
    #[error("authentication failed: ciphertext may be corrupted or tampered")]
    AuthenticationFailed,

    /// The KMS or the key vault rejected or could not serve a key request.
    #[error("key resolution failed for {context}: {reason}")]
    KeyResolution {
        /// `namespace|path` of the field whose key was requested
        context: String,
        /// Collaborator-provided reason
        reason: String,
    },

    /// Collection or schema provisioning failed for a reason other than
    /// "already exists". Nothing was left behind.
    #[error("provisioning of {namespace} failed: {reason}")]
    Provisioning {
        /// Target collection namespace
        namespace: String,
        /// What went wrong
        reason: String,
    },

    /// A network-bound collaborator call exceeded its timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Name of the collaborator call
        operation: &'static str,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Document database operation failed
    #[error("database error: {0}")]
    Database(#[from] StoreError),

    /// Ciphertext envelope parsing failed
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Unsupported envelope version
    #[error("unsupported version: {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version found in the ciphertext
        version: u8,
        /// Supported versions
        supported: String,
    },

    /// Key material has the wrong size
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Length supplied
        actual: usize,
    },

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,

    /// A sensitive value was supplied for a path the schema does not declare.
    #[error("field {path} is not declared in the encrypted schema of {namespace}")]
    UndeclaredField {
        /// Collection namespace
        namespace: String,
        /// Offending path
        path: String,
    },

    /// Plaintext was supplied at a path that must only hold ciphertext.
    #[error("field {path} of {namespace} is encrypted and cannot be stored in plaintext")]
    PlaintextForEncryptedField {
        /// Collection namespace
        namespace: String,
        /// Offending path
        path: String,
    },

    /// Document shape is not acceptable
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Schema declaration is not acceptable
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Configuration is inconsistent or incomplete
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` when the same call may succeed if simply repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Database(StoreError::Unavailable(_)))
    }

    /// Returns `true` for every flavour of failed decryption.
    #[must_use]
    pub const fn is_decryption_failure(&self) -> bool {
        matches!(self, Self::Decryption(_) | Self::AuthenticationFailed)
    }

    pub(crate) fn key_resolution(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::KeyResolution { context: context.to_string(), reason: reason.to_string() }
    }

    pub(crate) fn provisioning(namespace: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::Provisioning { namespace: namespace.to_string(), reason: reason.to_string() }
    }
}

/// Errors reported by a document database or key vault backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the operation (permissions, constraint other than uniqueness)
    #[error("store rejected operation: {0}")]
    Rejected(String),

    /// Stored data could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors specific to KMS operations.
#[derive(Debug)]
pub enum KmsError {
    /// Master key does not exist or is not visible to these credentials
    KeyNotFound(String),

    /// The client serves a different KMS provider than the one requested
    ProviderMismatch {
        /// Provider the master key reference names
        requested: String,
        /// Provider this client talks to
        served: String,
    },

    /// DEK wrapping failed
    WrapFailed(String),

    /// DEK unwrapping failed
    UnwrapFailed(String),

    /// KMS endpoint unreachable
    Unavailable(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound(id) => write!(f, "master key not found: {id}"),
            Self::ProviderMismatch { requested, served } => {
                write!(f, "master key targets {requested} but client serves {served}")
            }
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::Unavailable(msg) => write!(f, "KMS unavailable: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KmsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KmsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
