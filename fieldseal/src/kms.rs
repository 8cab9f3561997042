//! KMS boundary: master key references, provider credentials and the client
//! trait used to wrap and unwrap data encryption keys.

use crate::error::{Error, KmsError};
use secrecy::{SecretString, SecretVec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The KMS providers a deployment can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KmsProviderKind {
    /// AWS Key Management Service
    Aws,
    /// Google Cloud KMS
    Gcp,
    /// Azure Key Vault
    Azure,
    /// Any KMIP-compliant key server
    Kmip,
    /// Locally held master key (development and testing)
    Local,
}

impl KmsProviderKind {
    /// Returns the lowercase provider name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::Kmip => "kmip",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for KmsProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KmsProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            "kmip" => Ok(Self::Kmip),
            "local" => Ok(Self::Local),
            other => Err(Error::Config(format!("unknown KMS provider: {other}"))),
        }
    }
}

/// Reference to a customer master key held by a KMS.
///
/// `key_id` is provider specific: an ARN for AWS, a key resource name for GCP,
/// a key name for Azure, a key identifier for KMIP and a free label for the
/// local provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterKeyRef {
    provider: KmsProviderKind,
    key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<String>,
}

impl MasterKeyRef {
    /// Creates a master key reference without a region.
    #[must_use]
    pub fn new(provider: KmsProviderKind, key_id: impl Into<String>) -> Self {
        Self { provider, key_id: key_id.into(), region: None }
    }

    /// Sets the region (or the provider's equivalent location).
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Reference to the local provider's single master key.
    #[must_use]
    pub fn local() -> Self {
        Self::new(KmsProviderKind::Local, "local")
    }

    /// Returns the provider.
    #[must_use]
    pub const fn provider(&self) -> KmsProviderKind {
        self.provider
    }

    /// Returns the provider-specific key identifier.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Returns the region, if set.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

impl fmt::Display for MasterKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}:{}@{}", self.provider, self.key_id, region),
            None => write!(f, "{}:{}", self.provider, self.key_id),
        }
    }
}

/// AWS access key credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsCredentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: SecretString,
    /// Session token for temporary credentials
    #[serde(default)]
    pub session_token: Option<SecretString>,
}

/// GCP service account credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct GcpCredentials {
    /// Service account e-mail
    pub email: String,
    /// PKCS#8 private key, base64
    pub private_key: SecretString,
    /// Optional token endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Azure application credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct AzureCredentials {
    /// Directory (tenant) id
    pub tenant_id: String,
    /// Application (client) id
    pub client_id: String,
    /// Client secret
    pub client_secret: SecretString,
    /// Optional identity platform endpoint override
    #[serde(default)]
    pub identity_platform_endpoint: Option<String>,
}

/// KMIP server location.
#[derive(Debug, Clone, Deserialize)]
pub struct KmipCredentials {
    /// `host:port` of the KMIP server
    pub endpoint: String,
}

/// Locally held master key.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalCredentials {
    /// Base64-encoded master key
    pub key: SecretString,
}

/// Credentials for the selected KMS provider.
///
/// Each provider carries its own record; code dispatches on the variant, never
/// on provider name strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum KmsCredentials {
    /// AWS KMS
    Aws(AwsCredentials),
    /// GCP KMS
    Gcp(GcpCredentials),
    /// Azure Key Vault
    Azure(AzureCredentials),
    /// KMIP
    Kmip(KmipCredentials),
    /// Local master key
    Local(LocalCredentials),
}

impl KmsCredentials {
    /// Returns the provider these credentials belong to.
    #[must_use]
    pub const fn provider(&self) -> KmsProviderKind {
        match self {
            Self::Aws(_) => KmsProviderKind::Aws,
            Self::Gcp(_) => KmsProviderKind::Gcp,
            Self::Azure(_) => KmsProviderKind::Azure,
            Self::Kmip(_) => KmsProviderKind::Kmip,
            Self::Local(_) => KmsProviderKind::Local,
        }
    }
}

/// Wraps and unwraps data encryption keys with a master key.
///
/// Implementations must be thread-safe (`Send + Sync`) to support concurrent
/// key resolution. Implementations must never log the key bytes they are
/// handed or return.
#[async_trait::async_trait]
pub trait KmsClient: Send + Sync {
    /// Returns the provider this client talks to.
    fn provider(&self) -> KmsProviderKind;

    /// Wraps (encrypts) a raw DEK with the referenced master key.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::WrapFailed`, `KmsError::KeyNotFound` or
    /// `KmsError::Unavailable`.
    async fn wrap(&self, master_key: &MasterKeyRef, dek: &SecretVec<u8>)
        -> Result<Vec<u8>, KmsError>;

    /// Unwraps (decrypts) a wrapped DEK with the referenced master key.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::UnwrapFailed`, `KmsError::KeyNotFound` or
    /// `KmsError::Unavailable`.
    async fn unwrap(
        &self,
        master_key: &MasterKeyRef,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError>;

    /// Fails unless `master_key` targets this client's provider.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::ProviderMismatch`.
    fn ensure_provider(&self, master_key: &MasterKeyRef) -> Result<(), KmsError> {
        if master_key.provider() == self.provider() {
            Ok(())
        } else {
            Err(KmsError::ProviderMismatch {
                requested: master_key.provider().to_string(),
                served: self.provider().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip() {
        for kind in [
            KmsProviderKind::Aws,
            KmsProviderKind::Gcp,
            KmsProviderKind::Azure,
            KmsProviderKind::Kmip,
            KmsProviderKind::Local,
        ] {
            assert_eq!(kind.as_str().parse::<KmsProviderKind>().unwrap(), kind);
        }
        assert!("vault".parse::<KmsProviderKind>().is_err());
    }

    #[test]
    fn test_master_key_display() {
        let key = MasterKeyRef::new(KmsProviderKind::Aws, "arn:aws:kms:key/1").with_region("us-east-1");
        assert_eq!(key.to_string(), "aws:arn:aws:kms:key/1@us-east-1");
        assert_eq!(MasterKeyRef::local().to_string(), "local:local");
    }

    #[test]
    fn test_credentials_are_tagged_by_provider() {
        let json = r#"{"provider":"aws","access_key_id":"AKIA","secret_access_key":"s3cr3t"}"#;
        let creds: KmsCredentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.provider(), KmsProviderKind::Aws);

        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("s3cr3t"), "secrets must not appear in Debug output");
    }

    #[test]
    fn test_credentials_reject_wrong_shape() {
        let json = r#"{"provider":"azure","access_key_id":"AKIA"}"#;
        assert!(serde_json::from_str::<KmsCredentials>(json).is_err());
    }
}
