//! Connection settings shared by every command, read from flags or the
//! environment.

use anyhow::{bail, Context, Result};
use clap::Args;
use fieldseal::client::FieldSealClient;
use fieldseal::config::{FieldSealConfig, DEFAULT_COLLECTION, DEFAULT_DATABASE};
use fieldseal::context::{KeyVaultNamespace, Namespace};
use fieldseal::extract::Extractor;
use fieldseal::kms::{AwsCredentials, KmsClient, KmsCredentials, KmsProviderKind, LocalCredentials, MasterKeyRef};
use fieldseal_key_file::LocalKms;
use fieldseal_kms_aws::AwsKms;
use fieldseal_sqlite::SqliteDatabase;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

#[derive(Args)]
pub struct Settings {
    /// `SQLite` database file
    #[arg(long, env = "FIELDSEAL_DATABASE_URL", default_value = "fieldseal.db")]
    database_url: String,

    /// KMS provider: aws, gcp, azure, kmip or local
    #[arg(long, env = "FIELDSEAL_KMS_PROVIDER", default_value = "local")]
    kms_provider: KmsProviderKind,

    /// AWS access key id
    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    aws_access_key_id: Option<String>,

    /// AWS secret access key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    aws_secret_access_key: Option<String>,

    /// AWS session token
    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    aws_session_token: Option<String>,

    /// ARN of the AWS master key
    #[arg(long, env = "AWS_KEY_ARN")]
    aws_key_arn: Option<String>,

    /// Region of the AWS master key
    #[arg(long, env = "AWS_KEY_REGION")]
    aws_key_region: Option<String>,

    /// Base64 local master key
    #[arg(long, env = "FIELDSEAL_LOCAL_MASTER_KEY", hide_env_values = true)]
    local_master_key: Option<String>,

    /// Local master key file written by `keygen`
    #[arg(long, conflicts_with = "local_master_key")]
    master_key_file: Option<PathBuf>,

    /// Query-analysis shared library
    #[arg(long, env = "SHARED_LIB_PATH")]
    shared_lib_path: Option<PathBuf>,

    /// Key vault namespace
    #[arg(long, env = "FIELDSEAL_KEY_VAULT", default_value = "encryption.__keyVault")]
    key_vault: KeyVaultNamespace,

    /// Target database
    #[arg(long, env = "FIELDSEAL_DATABASE", default_value = DEFAULT_DATABASE)]
    database: String,

    /// Target collection
    #[arg(long, env = "FIELDSEAL_COLLECTION", default_value = DEFAULT_COLLECTION)]
    collection: String,

    /// Extraction attempts per input
    #[arg(long, env = "FIELDSEAL_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Seconds allowed for one extraction attempt
    #[arg(long, default_value_t = 60)]
    attempt_timeout_secs: u64,
}

impl Settings {
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    fn credentials(&self) -> Result<(KmsCredentials, MasterKeyRef)> {
        match self.kms_provider {
            KmsProviderKind::Local => {
                let key = match (&self.local_master_key, &self.master_key_file) {
                    (Some(key), _) => key.clone(),
                    (None, Some(path)) => {
                        let text = Zeroizing::new(
                            std::fs::read_to_string(path)
                                .with_context(|| format!("failed to read {}", path.display()))?,
                        );
                        text.trim().to_string()
                    }
                    (None, None) => bail!("local KMS needs FIELDSEAL_LOCAL_MASTER_KEY or --master-key-file"),
                };
                Ok((KmsCredentials::Local(LocalCredentials { key: SecretString::new(key) }), MasterKeyRef::local()))
            }
            KmsProviderKind::Aws => {
                let access_key_id = self.aws_access_key_id.clone().context("AWS_ACCESS_KEY_ID is not set")?;
                let secret = self.aws_secret_access_key.clone().context("AWS_SECRET_ACCESS_KEY is not set")?;
                let arn = self.aws_key_arn.clone().context("AWS_KEY_ARN is not set")?;
                let region = self.aws_key_region.clone().context("AWS_KEY_REGION is not set")?;
                let credentials = AwsCredentials {
                    access_key_id,
                    secret_access_key: SecretString::new(secret),
                    session_token: self.aws_session_token.clone().map(SecretString::new),
                };
                Ok((KmsCredentials::Aws(credentials), MasterKeyRef::new(KmsProviderKind::Aws, arn).with_region(region)))
            }
            other => bail!("no {other} KMS client is available in this build; use aws or local"),
        }
    }

    fn config(&self) -> Result<FieldSealConfig> {
        let (credentials, master_key) = self.credentials()?;
        let mut config = FieldSealConfig {
            database_url: self.database_url.clone(),
            kms: Some(credentials),
            master_key,
            key_vault: self.key_vault.clone(),
            crypt_shared_lib_path: self.shared_lib_path.clone(),
            namespace: Namespace::new(&self.database, &self.collection)?,
            ..FieldSealConfig::default()
        };
        config.extraction.max_attempts = self.max_attempts;
        config.extraction.attempt_timeout = self.attempt_timeout();
        config.validate()?;
        Ok(config)
    }

    /// Builds the client: KMS, `SQLite` store and key vault, and the
    /// optional extractor.
    pub async fn connect(&self, extractor: Option<Arc<dyn Extractor>>) -> Result<FieldSealClient> {
        let config = self.config()?;

        let kms: Arc<dyn KmsClient> = match &config.kms {
            Some(KmsCredentials::Local(credentials)) => Arc::new(LocalKms::from_credentials(credentials)?),
            Some(KmsCredentials::Aws(credentials)) => {
                Arc::new(AwsKms::from_credentials(credentials, &config.master_key).await?)
            }
            _ => bail!("no KMS client for {}", config.master_key.provider()),
        };

        let db = SqliteDatabase::open(&config.database_url)
            .with_context(|| format!("failed to open {}", config.database_url))?;
        let key_vault = Arc::new(db.key_vault(config.key_vault.clone()));
        let store = Arc::new(db.document_store());

        let mut builder = FieldSealClient::builder(config).kms(kms).key_vault(key_vault).document_store(store);
        if let Some(extractor) = extractor {
            builder = builder.extractor(extractor);
        }
        Ok(builder.build()?)
    }
}
