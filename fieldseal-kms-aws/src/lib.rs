//! AWS KMS client for `FieldSeal`.
//!
//! DEKs are wrapped with a customer master key held in AWS Key Management
//! Service; the raw master key never leaves the HSM.
//!
//! # Example
//!
//! ```rust,no_run
//! use fieldseal::kms::{AwsCredentials, KmsProviderKind, MasterKeyRef};
//! use fieldseal_kms_aws::AwsKms;
//!
//! # async fn example(credentials: AwsCredentials) -> Result<(), Box<dyn std::error::Error>> {
//! let master_key = MasterKeyRef::new(
//!     KmsProviderKind::Aws,
//!     "arn:aws:kms:us-east-1:123456789012:key/12345678-1234-1234-1234-123456789012",
//! )
//! .with_region("us-east-1");
//!
//! // Explicit credentials, as configured for the pipeline
//! let kms = AwsKms::from_credentials(&credentials, &master_key).await?;
//!
//! // Or the SDK's default credential chain
//! let kms = AwsKms::from_env(&master_key).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! [`AwsKms::from_env`] uses the AWS SDK's default credential chain:
//! - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! - AWS credentials file (~/.aws/credentials)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client;
use fieldseal::error::KmsError;
use fieldseal::kms::{AwsCredentials, KmsClient, KmsProviderKind, MasterKeyRef};
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;
use tracing::{debug, warn};

const CREDENTIALS_SOURCE: &str = "fieldseal";

/// AWS KMS backed [`KmsClient`].
#[derive(Clone)]
pub struct AwsKms {
    client: Client,
    region: Option<String>,
}

impl fmt::Debug for AwsKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsKms").field("region", &self.region).finish_non_exhaustive()
    }
}

impl AwsKms {
    /// Builds a client from explicit access keys, in the master key's region.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::KeyNotFound` if `master_key` is not an AWS key or
    /// names no region.
    pub async fn from_credentials(
        credentials: &AwsCredentials,
        master_key: &MasterKeyRef,
    ) -> Result<Self, KmsError> {
        let region = aws_region(master_key)?;
        let provider = Credentials::new(
            &credentials.access_key_id,
            credentials.secret_access_key.expose_secret(),
            credentials.session_token.as_ref().map(|t| t.expose_secret().clone()),
            None,
            CREDENTIALS_SOURCE,
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(provider)
            .load()
            .await;

        debug!(region = %region, "AWS KMS client configured from explicit credentials");
        Ok(Self { client: Client::new(&config), region: Some(region) })
    }

    /// Builds a client from the SDK's default credential chain.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::KeyNotFound` if `master_key` is not an AWS key.
    pub async fn from_env(master_key: &MasterKeyRef) -> Result<Self, KmsError> {
        if master_key.provider() != KmsProviderKind::Aws {
            return Err(KmsError::KeyNotFound(format!("{master_key} is not an AWS master key")));
        }
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = master_key.region() {
            loader = loader.region(Region::new(region.to_string()));
        }
        let config = loader.load().await;
        let region = config.region().map(ToString::to_string);

        debug!(region = ?region, "AWS KMS client configured from environment");
        Ok(Self { client: Client::new(&config), region })
    }

    /// Wraps an already configured SDK client.
    #[must_use]
    pub const fn from_client(client: Client) -> Self {
        Self { client, region: None }
    }
}

fn aws_region(master_key: &MasterKeyRef) -> Result<String, KmsError> {
    if master_key.provider() != KmsProviderKind::Aws {
        return Err(KmsError::KeyNotFound(format!("{master_key} is not an AWS master key")));
    }
    master_key
        .region()
        .map(ToString::to_string)
        .ok_or_else(|| KmsError::KeyNotFound(format!("{master_key} names no region")))
}

/// Maps an SDK failure to the collaborator error taxonomy.
///
/// Transport failures become `Unavailable`; a missing key becomes
/// `KeyNotFound`; everything else goes through `otherwise`.
fn classify<E, R>(
    key_id: &str,
    err: SdkError<E, R>,
    otherwise: fn(String) -> KmsError,
) -> KmsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            warn!(key_id, "AWS KMS unreachable");
            KmsError::Unavailable(DisplayErrorContext(&err).to_string())
        }
        SdkError::ServiceError(service) if service.err().code() == Some("NotFoundException") => {
            KmsError::KeyNotFound(key_id.to_string())
        }
        _ => otherwise(DisplayErrorContext(&err).to_string()),
    }
}

#[async_trait::async_trait]
impl KmsClient for AwsKms {
    fn provider(&self) -> KmsProviderKind {
        KmsProviderKind::Aws
    }

    async fn wrap(&self, master_key: &MasterKeyRef, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError> {
        self.ensure_provider(master_key)?;

        let response = self
            .client
            .encrypt()
            .key_id(master_key.key_id())
            .plaintext(Blob::new(dek.expose_secret().clone()))
            .send()
            .await
            .map_err(|e| classify(master_key.key_id(), e, KmsError::WrapFailed))?;

        let ciphertext = response
            .ciphertext_blob()
            .ok_or_else(|| KmsError::WrapFailed("no ciphertext returned".to_string()))?;
        Ok(ciphertext.as_ref().to_vec())
    }

    async fn unwrap(&self, master_key: &MasterKeyRef, wrapped: &[u8]) -> Result<SecretVec<u8>, KmsError> {
        self.ensure_provider(master_key)?;

        let response = self
            .client
            .decrypt()
            .key_id(master_key.key_id())
            .ciphertext_blob(Blob::new(wrapped.to_vec()))
            .send()
            .await
            .map_err(|e| classify(master_key.key_id(), e, KmsError::UnwrapFailed))?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| KmsError::UnwrapFailed("no plaintext returned".to_string()))?;
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }
}
