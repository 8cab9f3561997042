//! Process-wide entry point owning the shared collaborators.

use crate::config::FieldSealConfig;
use crate::error::Error;
use crate::extract::{CancellationFlag, ExtractionController, ExtractionOutcome, Extractor};
use crate::ingest::IngestionCoordinator;
use crate::key_vault::KeyVaultStore;
use crate::kms::KmsClient;
use crate::provider::EncryptionProvider;
use crate::registrar::{Provisioned, SchemaRegistrar};
use crate::schema::CollectionHandle;
use crate::store::DocumentStore;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Builder for [`FieldSealClient`].
#[derive(Default)]
pub struct FieldSealClientBuilder {
    config: FieldSealConfig,
    kms: Option<Arc<dyn KmsClient>>,
    key_vault: Option<Arc<dyn KeyVaultStore>>,
    store: Option<Arc<dyn DocumentStore>>,
    extractor: Option<Arc<dyn Extractor>>,
}

impl FieldSealClientBuilder {
    /// Starts from `config`.
    #[must_use]
    pub fn new(config: FieldSealConfig) -> Self {
        Self { config, ..Self::default() }
    }

    /// Sets the KMS client. Required.
    #[must_use]
    pub fn kms(mut self, kms: Arc<dyn KmsClient>) -> Self {
        self.kms = Some(kms);
        self
    }

    /// Sets the key vault. Required.
    #[must_use]
    pub fn key_vault(mut self, key_vault: Arc<dyn KeyVaultStore>) -> Self {
        self.key_vault = Some(key_vault);
        self
    }

    /// Sets the document store. Required.
    #[must_use]
    pub fn document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the extraction collaborator. Only needed for
    /// [`FieldSealClient::extract`].
    #[must_use]
    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Validates the configuration and assembles the client.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid, a required
    /// collaborator is missing, the KMS client serves another provider than
    /// the master key names, or the key vault lives in another namespace
    /// than configured.
    pub fn build(self) -> Result<FieldSealClient, Error> {
        self.config.validate()?;

        let kms = self.kms.ok_or_else(|| Error::Config("no KMS client configured".into()))?;
        let key_vault = self.key_vault.ok_or_else(|| Error::Config("no key vault configured".into()))?;
        let store = self.store.ok_or_else(|| Error::Config("no document store configured".into()))?;

        kms.ensure_provider(&self.config.master_key).map_err(|e| Error::Config(e.to_string()))?;
        if key_vault.namespace() != &self.config.key_vault {
            return Err(Error::Config(format!(
                "key vault serves {} but {} is configured",
                key_vault.namespace(),
                self.config.key_vault
            )));
        }
        if let Some(path) = &self.config.crypt_shared_lib_path {
            info!(path = %path.display(), "query-analysis shared library configured");
        }

        let provider = Arc::new(
            EncryptionProvider::new(kms, key_vault, self.config.timeouts).with_cache_ttl(self.config.dek_cache_ttl),
        );
        let registrar = SchemaRegistrar::new(Arc::clone(&provider), Arc::clone(&store));
        let extraction = self.extractor.map(ExtractionController::new);

        info!(
            namespace = %self.config.namespace,
            key_vault = %self.config.key_vault,
            master_key = %self.config.master_key,
            "fieldseal client ready"
        );
        Ok(FieldSealClient { config: self.config, provider, store, registrar, extraction })
    }
}

/// Shared pipeline context, built once per process.
pub struct FieldSealClient {
    config: FieldSealConfig,
    provider: Arc<EncryptionProvider>,
    store: Arc<dyn DocumentStore>,
    registrar: SchemaRegistrar,
    extraction: Option<ExtractionController>,
}

impl fmt::Debug for FieldSealClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSealClient")
            .field("namespace", &self.config.namespace)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl FieldSealClient {
    /// Starts building a client.
    #[must_use]
    pub fn builder(config: FieldSealConfig) -> FieldSealClientBuilder {
        FieldSealClientBuilder::new(config)
    }

    /// Returns the validated configuration.
    #[must_use]
    pub const fn config(&self) -> &FieldSealConfig {
        &self.config
    }

    /// Returns the encryption provider.
    #[must_use]
    pub const fn provider(&self) -> &Arc<EncryptionProvider> {
        &self.provider
    }

    /// Returns the schema registrar.
    #[must_use]
    pub const fn registrar(&self) -> &SchemaRegistrar {
        &self.registrar
    }

    /// Provisions the configured collection with the configured schema.
    ///
    /// # Errors
    ///
    /// See [`SchemaRegistrar::provision_collection`].
    pub async fn provision(&self) -> Result<Provisioned<CollectionHandle>, Error> {
        self.registrar
            .provision_collection(&self.config.namespace, &self.config.schema, &self.config.master_key)
            .await
    }

    /// Returns a coordinator for the configured collection, provisioning it
    /// first if needed.
    ///
    /// # Errors
    ///
    /// Returns provisioning errors, or the errors of
    /// [`IngestionCoordinator::new`].
    pub async fn coordinator(&self) -> Result<IngestionCoordinator, Error> {
        let handle = self.provision().await?.into_inner();
        IngestionCoordinator::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
            handle,
            self.config.dedup_path.clone(),
        )
        .await
    }

    /// Returns a read-only coordinator for an already provisioned collection.
    /// Nothing is created when the collection is missing.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provisioning` if the collection does not exist, or the
    /// errors of [`IngestionCoordinator::open`].
    pub async fn open_coordinator(&self) -> Result<IngestionCoordinator, Error> {
        let handle = self.registrar.open_collection(&self.config.namespace, &self.config.master_key).await?;
        IngestionCoordinator::open(
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
            handle,
            self.config.dedup_path.clone(),
        )
    }

    /// Extracts a validated value from `input` under the configured policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no extractor was configured or the
    /// extraction settings are invalid. Exhaustion is not an error.
    pub async fn extract(&self, input: &str, cancel: &CancellationFlag) -> Result<ExtractionOutcome, Error> {
        let controller = self
            .extraction
            .as_ref()
            .ok_or_else(|| Error::Config("no extractor configured".into()))?;
        let policy = self.config.extraction_policy()?;
        let validator = self.config.validator()?;
        Ok(controller.extract_validated_until(input, &policy, &validator, cancel).await)
    }

    /// Releases cached key material.
    pub fn shutdown(&self) {
        self.provider.clear_cache();
        info!("fieldseal client shut down");
    }
}
