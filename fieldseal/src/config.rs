//! Pipeline configuration.

use crate::context::{FieldPath, KeyVaultNamespace, Namespace};
use crate::error::Error;
use crate::extract::{ExtractionPolicy, PatternValidator, CARD_NUMBER_PATTERN};
use crate::kms::{KmsCredentials, KmsProviderKind, MasterKeyRef};
use crate::provider::DEFAULT_CACHE_TTL;
use crate::schema::{EncryptedCollectionSchema, EncryptedFieldSpec, FieldType, QueryType};
use crate::timeout::{millis, Timeouts};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default target database.
pub const DEFAULT_DATABASE: &str = "mongodb-qe-genai";

/// Default target collection.
pub const DEFAULT_COLLECTION: &str = "user_accounts";

/// Default dedup field.
pub const DEFAULT_DEDUP_PATH: &str = "credit_card.number";

/// Extraction settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Maximum extractor calls per input.
    pub max_attempts: u32,

    /// Bound on a single extractor call.
    #[serde(with = "millis")]
    pub attempt_timeout: Duration,

    /// Pause between a rejected attempt and the next one.
    #[serde(with = "millis")]
    pub retry_delay: Duration,

    /// Full-match pattern a candidate must satisfy.
    pub pattern: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(60),
            retry_delay: Duration::ZERO,
            pattern: CARD_NUMBER_PATTERN.to_string(),
        }
    }
}

/// Everything needed to run the pipeline against one collection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FieldSealConfig {
    /// Document database location (a SQLite path for the bundled store).
    pub database_url: String,

    /// KMS provider credentials.
    pub kms: Option<KmsCredentials>,

    /// Master key protecting the DEKs.
    pub master_key: MasterKeyRef,

    /// Where wrapped DEKs live.
    pub key_vault: KeyVaultNamespace,

    /// Optional path to a query-analysis shared library. Checked for
    /// existence only.
    pub crypt_shared_lib_path: Option<PathBuf>,

    /// Target collection.
    pub namespace: Namespace,

    /// Encrypted field declaration of the target collection.
    pub schema: EncryptedCollectionSchema,

    /// Field used to detect duplicates.
    pub dedup_path: FieldPath,

    /// Extraction retry settings.
    pub extraction: ExtractionConfig,

    /// Collaborator call timeouts.
    pub timeouts: Timeouts,

    /// How long a resolved DEK stays cached.
    #[serde(with = "millis")]
    pub dek_cache_ttl: Duration,
}

impl Default for FieldSealConfig {
    fn default() -> Self {
        let dedup_path = FieldPath::builtin(DEFAULT_DEDUP_PATH);
        Self {
            database_url: "fieldseal.db".to_string(),
            kms: None,
            master_key: MasterKeyRef::local(),
            key_vault: KeyVaultNamespace::default(),
            crypt_shared_lib_path: None,
            namespace: Namespace::builtin(DEFAULT_DATABASE, DEFAULT_COLLECTION),
            schema: card_number_schema(dedup_path.clone()),
            dedup_path,
            extraction: ExtractionConfig::default(),
            timeouts: Timeouts::default(),
            dek_cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Schema with a single equality-queryable string field.
#[must_use]
pub fn card_number_schema(path: FieldPath) -> EncryptedCollectionSchema {
    EncryptedCollectionSchema::from_validated(vec![
        EncryptedFieldSpec::new(path, FieldType::String).with_query(QueryType::Equality)
    ])
}

impl FieldSealConfig {
    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when credentials are missing or target a
    /// different provider than the master key, the AWS master key has no
    /// region, the key vault and target collection coincide, the dedup field
    /// is not an equality-queryable declared field, extraction settings are
    /// unusable, a timeout is zero, or the shared library path does not exist.
    pub fn validate(&self) -> Result<(), Error> {
        let credentials = self
            .kms
            .as_ref()
            .ok_or_else(|| Error::Config("no KMS credentials configured".into()))?;
        if credentials.provider() != self.master_key.provider() {
            return Err(Error::Config(format!(
                "KMS credentials are for {} but the master key targets {}",
                credentials.provider(),
                self.master_key.provider()
            )));
        }
        if self.master_key.provider() == KmsProviderKind::Aws && self.master_key.region().is_none() {
            return Err(Error::Config("AWS master key requires a region".into()));
        }

        if self.key_vault.namespace() == &self.namespace {
            return Err(Error::Config(format!(
                "key vault and target collection are both {}",
                self.namespace
            )));
        }

        self.schema.validate().map_err(|e| Error::Config(e.to_string()))?;
        let dedup_ok = self
            .schema
            .field(&self.dedup_path)
            .is_some_and(|f| f.query_type() == Some(QueryType::Equality));
        if !dedup_ok {
            return Err(Error::Config(format!(
                "dedup field {} is not an equality-queryable encrypted field",
                self.dedup_path
            )));
        }

        self.extraction_policy()?;
        self.validator()?;

        let timeouts = [self.timeouts.kms, self.timeouts.key_vault, self.timeouts.database];
        if timeouts.iter().any(Duration::is_zero) {
            return Err(Error::Config("timeouts must be greater than zero".into()));
        }

        if let Some(path) = &self.crypt_shared_lib_path {
            if !path.exists() {
                return Err(Error::Config(format!("shared library not found: {}", path.display())));
            }
        }

        Ok(())
    }

    /// Builds the extraction policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `max_attempts` is zero.
    pub fn extraction_policy(&self) -> Result<ExtractionPolicy, Error> {
        Ok(ExtractionPolicy::new(self.extraction.max_attempts)?
            .with_attempt_timeout(self.extraction.attempt_timeout)
            .with_retry_delay(self.extraction.retry_delay))
    }

    /// Compiles the candidate validator.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the pattern does not compile.
    pub fn validator(&self) -> Result<PatternValidator, Error> {
        PatternValidator::new(&self.extraction.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::{AwsCredentials, LocalCredentials};
    use secrecy::SecretString;

    fn local_config() -> FieldSealConfig {
        FieldSealConfig {
            kms: Some(KmsCredentials::Local(LocalCredentials { key: SecretString::new("AAAA".into()) })),
            ..FieldSealConfig::default()
        }
    }

    #[test]
    fn test_default_local_config_is_valid() {
        local_config().validate().unwrap();
    }

    #[test]
    fn test_missing_credentials() {
        assert!(matches!(FieldSealConfig::default().validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_provider_mismatch() {
        let config = FieldSealConfig {
            kms: Some(KmsCredentials::Aws(AwsCredentials {
                access_key_id: "AKIA".into(),
                secret_access_key: SecretString::new("secret".into()),
                session_token: None,
            })),
            ..FieldSealConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("aws"));
    }

    #[test]
    fn test_aws_requires_region() {
        let mut config = FieldSealConfig {
            kms: Some(KmsCredentials::Aws(AwsCredentials {
                access_key_id: "AKIA".into(),
                secret_access_key: SecretString::new("secret".into()),
                session_token: None,
            })),
            master_key: MasterKeyRef::new(KmsProviderKind::Aws, "arn:aws:kms:us-east-1:1:key/abc"),
            ..FieldSealConfig::default()
        };
        assert!(config.validate().is_err());

        config.master_key = config.master_key.clone().with_region("us-east-1");
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = local_config();
        config.extraction.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_dedup_must_be_declared() {
        let mut config = local_config();
        config.dedup_path = FieldPath::new("user_id").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_shared_library() {
        let mut config = local_config();
        config.crypt_shared_lib_path = Some(PathBuf::from("/nonexistent/mongo_crypt_v1.so"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: FieldSealConfig = serde_json::from_value(serde_json::json!({
            "database_url": "/tmp/qe.db",
            "kms": {"provider": "local", "key": "AAAA"},
            "extraction": {"max_attempts": 5, "retry_delay": 250},
            "timeouts": {"kms": 2000}
        }))
        .unwrap();

        assert_eq!(config.database_url, "/tmp/qe.db");
        assert_eq!(config.extraction.max_attempts, 5);
        assert_eq!(config.extraction.retry_delay, Duration::from_millis(250));
        assert_eq!(config.timeouts.kms, Duration::from_secs(2));
        assert_eq!(config.namespace.to_string(), "mongodb-qe-genai.user_accounts");
        config.validate().unwrap();
    }
}
