//! Collection provisioning with an explicit encrypted-field schema.
//!
//! Provisioning either leaves a collection bound to a schema whose every
//! field has a DEK, or leaves nothing behind: DEKs created by a failed call
//! are deleted from the key vault and evicted from the cache. Calls for the
//! same namespace through one registrar run one at a time, so a rollback
//! never deletes a DEK another call has already bound.

use crate::context::{FieldContext, Namespace};
use crate::error::Error;
use crate::kms::MasterKeyRef;
use crate::provider::{DataEncryptionKey, EncryptionProvider};
use crate::schema::{CollectionHandle, EncryptedCollectionSchema};
use crate::store::{CreateOutcome, DocumentStore};
use crate::timeout::with_timeout;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of provisioning: `Created` or `AlreadyExists`, both carrying a
/// usable handle.
pub type Provisioned<T> = CreateOutcome<T>;

/// Creates encrypted collections and their backing DEKs.
#[derive(Clone)]
pub struct SchemaRegistrar {
    provider: Arc<EncryptionProvider>,
    store: Arc<dyn DocumentStore>,
    /// Per-namespace provisioning locks, shared by clones.
    locks: Arc<Mutex<HashMap<Namespace, Arc<tokio::sync::Mutex<()>>>>>,
}

impl std::fmt::Debug for SchemaRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistrar").field("provider", &self.provider).finish_non_exhaustive()
    }
}

impl SchemaRegistrar {
    /// Creates a registrar.
    #[must_use]
    pub fn new(provider: Arc<EncryptionProvider>, store: Arc<dyn DocumentStore>) -> Self {
        Self { provider, store, locks: Arc::default() }
    }

    fn namespace_lock(&self, namespace: &Namespace) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(namespace.clone()).or_default())
    }

    /// Provisions `namespace` with `schema`, creating one DEK per field
    /// under `master_key`.
    ///
    /// Provisioning an existing collection with the same declaration is a
    /// no-op returning `AlreadyExists`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidSchema` if `schema` is not valid
    /// - `Error::Provisioning` if the collection exists with a different
    ///   declaration, or a DEK or the collection cannot be created
    /// - `Error::Timeout` if a collaborator call times out; nothing created
    ///   by this call survives
    pub async fn provision_collection(
        &self,
        namespace: &Namespace,
        schema: &EncryptedCollectionSchema,
        master_key: &MasterKeyRef,
    ) -> Result<Provisioned<CollectionHandle>, Error> {
        schema.validate()?;

        let lock = self.namespace_lock(namespace);
        let _guard = lock.lock().await;

        if let Some(existing) = self.stored_schema(namespace).await? {
            return Self::adopt(namespace, schema, existing, master_key);
        }

        let mut created: Vec<Arc<DataEncryptionKey>> = Vec::new();
        let mut key_ids = HashMap::new();
        for field in schema.fields() {
            let context = FieldContext::new(namespace.clone(), field.path().clone());
            match self.provider.resolve_key_tracked(&context, master_key).await {
                Ok(CreateOutcome::Created(key)) => {
                    key_ids.insert(field.path().clone(), key.id());
                    created.push(key);
                }
                Ok(CreateOutcome::AlreadyExists(key)) => {
                    // Another process may have rolled this key back since it
                    // was cached.
                    if let Err(err) = self.ensure_stored(&key).await {
                        self.rollback(&created).await;
                        return Err(provisioning_failure(namespace, err));
                    }
                    key_ids.insert(field.path().clone(), key.id());
                }
                Err(err) => {
                    self.rollback(&created).await;
                    return Err(provisioning_failure(namespace, err));
                }
            }
        }

        let bound = match schema.bind_key_ids(&key_ids) {
            Ok(bound) => bound,
            Err(err) => {
                self.rollback(&created).await;
                return Err(provisioning_failure(namespace, err));
            }
        };

        let limit = self.provider.timeouts().database;
        let outcome = match with_timeout(
            "database.create_collection",
            limit,
            self.store.create_collection(namespace, &bound),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                self.rollback(&created).await;
                return Err(Error::provisioning(namespace, err));
            }
            Err(timeout) => {
                self.rollback(&created).await;
                return Err(timeout);
            }
        };

        match outcome {
            CreateOutcome::Created(stored) => {
                info!(namespace = %namespace, fields = stored.fields().len(), "provisioned encrypted collection");
                Ok(Provisioned::Created(CollectionHandle::new(namespace.clone(), stored, master_key.clone())))
            }
            CreateOutcome::AlreadyExists(winner) => {
                // A concurrent provisioner won; keep only the DEKs it bound.
                let orphaned: Vec<_> = created
                    .into_iter()
                    .filter(|key| !winner.fields().iter().any(|f| f.key_id() == Some(key.id())))
                    .collect();
                self.rollback(&orphaned).await;
                Self::adopt(namespace, schema, winner, master_key)
            }
        }
    }

    /// Returns a handle for an already provisioned collection.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provisioning` if the collection does not exist and
    /// `Error::Timeout` if the lookup times out.
    pub async fn open_collection(
        &self,
        namespace: &Namespace,
        master_key: &MasterKeyRef,
    ) -> Result<CollectionHandle, Error> {
        let schema = self
            .stored_schema(namespace)
            .await?
            .ok_or_else(|| Error::provisioning(namespace, "collection is not provisioned"))?;
        Ok(CollectionHandle::new(namespace.clone(), schema, master_key.clone()))
    }

    async fn stored_schema(
        &self,
        namespace: &Namespace,
    ) -> Result<Option<EncryptedCollectionSchema>, Error> {
        let limit = self.provider.timeouts().database;
        with_timeout("database.collection_schema", limit, self.store.collection_schema(namespace))
            .await?
            .map_err(|e| Error::provisioning(namespace, e))
    }

    fn adopt(
        namespace: &Namespace,
        requested: &EncryptedCollectionSchema,
        existing: EncryptedCollectionSchema,
        master_key: &MasterKeyRef,
    ) -> Result<Provisioned<CollectionHandle>, Error> {
        if !existing.same_declaration(requested) {
            return Err(Error::provisioning(
                namespace,
                "collection exists with a different encrypted field declaration",
            ));
        }
        info!(namespace = %namespace, "encrypted collection already exists");
        Ok(Provisioned::AlreadyExists(CollectionHandle::new(namespace.clone(), existing, master_key.clone())))
    }

    async fn ensure_stored(&self, key: &DataEncryptionKey) -> Result<(), Error> {
        let limit = self.provider.timeouts().key_vault;
        let stored = with_timeout("key_vault.find_by_id", limit, self.provider.key_vault().find_by_id(key.id()))
            .await?
            .map_err(|e| Error::key_resolution(key.context(), e))?;
        if stored.is_none() {
            self.provider.evict(key.context());
            return Err(Error::key_resolution(
                key.context(),
                format!("data key {} was removed from the key vault", key.id()),
            ));
        }
        Ok(())
    }

    async fn rollback(&self, created: &[Arc<DataEncryptionKey>]) {
        let limit = self.provider.timeouts().key_vault;
        for key in created {
            self.provider.evict(key.context());
            match with_timeout("key_vault.delete", limit, self.provider.key_vault().delete(key.id())).await {
                Ok(Ok(_)) => info!(context = %key.context(), key_id = %key.id(), "rolled back data key"),
                Ok(Err(err)) => {
                    warn!(context = %key.context(), key_id = %key.id(), error = %err, "failed to roll back data key");
                }
                Err(err) => {
                    warn!(context = %key.context(), key_id = %key.id(), error = %err, "failed to roll back data key");
                }
            }
        }
    }
}

fn provisioning_failure(namespace: &Namespace, err: Error) -> Error {
    match err {
        Error::Timeout { .. } => err,
        other => Error::provisioning(namespace, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FieldPath;
    use crate::error::StoreError;
    use crate::key_vault::KeyVaultStore;
    use crate::memory::{MemoryDocumentStore, MemoryKeyVault};
    use crate::schema::{EncryptedFieldSpec, FieldType, QueryType};
    use crate::store::{Document, Filter, InsertResult};
    use crate::testing::MockKms;
    use crate::timeout::Timeouts;

    fn ns() -> Namespace {
        "mongodb-qe-genai.user_accounts".parse().unwrap()
    }

    fn schema() -> EncryptedCollectionSchema {
        EncryptedCollectionSchema::new(vec![
            EncryptedFieldSpec::new(FieldPath::new("credit_card.number").unwrap(), FieldType::String)
                .with_query(QueryType::Equality),
            EncryptedFieldSpec::new(FieldPath::new("ssn").unwrap(), FieldType::String),
        ])
        .unwrap()
    }

    struct Fixture {
        registrar: SchemaRegistrar,
        vault: Arc<MemoryKeyVault>,
        kms: Arc<MockKms>,
    }

    fn fixture_with(store: Arc<dyn DocumentStore>) -> Fixture {
        let kms = Arc::new(MockKms::new());
        let vault = Arc::new(MemoryKeyVault::default());
        let provider = Arc::new(EncryptionProvider::new(kms.clone(), vault.clone(), Timeouts::default()));
        Fixture { registrar: SchemaRegistrar::new(provider, store), vault, kms }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryDocumentStore::new()))
    }

    #[tokio::test]
    async fn test_provision_creates_keys_and_binds_them() {
        let f = fixture();
        let outcome = f.registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await.unwrap();
        assert!(outcome.is_created());

        let handle = outcome.into_inner();
        assert_eq!(f.vault.len(), 2);
        assert!(handle.schema().fields().iter().all(|field| field.key_id().is_some()));
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let f = fixture();
        let first = f.registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await.unwrap();
        let second = f.registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await.unwrap();

        assert!(!second.is_created());
        assert_eq!(first.get(), second.get());
        assert_eq!(f.vault.len(), 2);
        assert_eq!(f.kms.wrap_calls(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_declaration_is_rejected() {
        let f = fixture();
        f.registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await.unwrap();

        let other = EncryptedCollectionSchema::new(vec![EncryptedFieldSpec::new(
            FieldPath::new("credit_card.number").unwrap(),
            FieldType::String,
        )])
        .unwrap();
        let err = f.registrar.provision_collection(&ns(), &other, &MasterKeyRef::local()).await.unwrap_err();
        assert!(matches!(err, Error::Provisioning { .. }));
    }

    #[tokio::test]
    async fn test_key_failure_rolls_back_created_keys() {
        let f = fixture();
        f.kms.fail_wrap_number(2);

        let err = f.registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await.unwrap_err();
        assert!(matches!(err, Error::Provisioning { .. }));
        assert!(f.vault.is_empty());
        assert!(f.registrar.open_collection(&ns(), &MasterKeyRef::local()).await.is_err());
    }

    /// Store whose collection creation always fails.
    struct FailingCreate(MemoryDocumentStore);

    #[async_trait::async_trait]
    impl DocumentStore for FailingCreate {
        async fn create_collection(
            &self,
            _: &Namespace,
            _: &EncryptedCollectionSchema,
        ) -> Result<CreateOutcome<EncryptedCollectionSchema>, StoreError> {
            Err(StoreError::Rejected("not authorized".into()))
        }

        async fn collection_schema(
            &self,
            namespace: &Namespace,
        ) -> Result<Option<EncryptedCollectionSchema>, StoreError> {
            self.0.collection_schema(namespace).await
        }

        async fn create_unique_index(
            &self,
            namespace: &Namespace,
            path: &FieldPath,
        ) -> Result<CreateOutcome<()>, StoreError> {
            self.0.create_unique_index(namespace, path).await
        }

        async fn find_one(&self, namespace: &Namespace, filter: &Filter) -> Result<Option<Document>, StoreError> {
            self.0.find_one(namespace, filter).await
        }

        async fn count(&self, namespace: &Namespace, filter: &Filter) -> Result<u64, StoreError> {
            self.0.count(namespace, filter).await
        }

        async fn insert_one(&self, namespace: &Namespace, document: Document) -> Result<InsertResult, StoreError> {
            self.0.insert_one(namespace, document).await
        }
    }

    #[tokio::test]
    async fn test_collection_failure_rolls_back_keys() {
        let f = fixture_with(Arc::new(FailingCreate(MemoryDocumentStore::new())));
        let err = f.registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await.unwrap_err();

        assert!(matches!(err, Error::Provisioning { .. }));
        assert!(f.vault.is_empty());

        // the cache no longer serves the deleted key
        let ctx = FieldContext::new(ns(), FieldPath::new("ssn").unwrap());
        let again = f.registrar.provider.resolve_key_tracked(&ctx, &MasterKeyRef::local()).await.unwrap();
        assert!(again.is_created());
    }

    /// KMS whose second wrap waits for `release`, then fails.
    #[derive(Default)]
    struct GatedKms {
        inner: MockKms,
        wraps: std::sync::atomic::AtomicUsize,
        reached: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl crate::kms::KmsClient for GatedKms {
        fn provider(&self) -> crate::kms::KmsProviderKind {
            crate::kms::KmsProviderKind::Local
        }

        async fn wrap(
            &self,
            master_key: &MasterKeyRef,
            dek: &secrecy::SecretVec<u8>,
        ) -> Result<Vec<u8>, crate::error::KmsError> {
            let call = self.wraps.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if call == 2 {
                self.reached.notify_one();
                self.release.notified().await;
                return Err(crate::error::KmsError::WrapFailed("transient".into()));
            }
            self.inner.wrap(master_key, dek).await
        }

        async fn unwrap(
            &self,
            master_key: &MasterKeyRef,
            wrapped: &[u8],
        ) -> Result<secrecy::SecretVec<u8>, crate::error::KmsError> {
            self.inner.unwrap(master_key, wrapped).await
        }
    }

    #[tokio::test]
    async fn test_failed_provisioner_never_strands_a_concurrent_one() {
        let kms = Arc::new(GatedKms::default());
        let vault = Arc::new(MemoryKeyVault::default());
        let provider = Arc::new(EncryptionProvider::new(kms.clone(), vault.clone(), Timeouts::default()));
        let registrar = SchemaRegistrar::new(provider, Arc::new(MemoryDocumentStore::new()));

        // first provisioner holds its first key and stalls on the second
        let first = tokio::spawn({
            let registrar = registrar.clone();
            async move { registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await }
        });
        kms.reached.notified().await;

        let second = tokio::spawn({
            let registrar = registrar.clone();
            async move { registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        kms.release.notify_one();

        assert!(matches!(first.await.unwrap(), Err(Error::Provisioning { .. })));
        let handle = second.await.unwrap().unwrap().into_inner();

        for field in handle.schema().fields() {
            let key_id = field.key_id().unwrap();
            assert!(vault.find_by_id(key_id).await.unwrap().is_some(), "{} bound to a deleted key", field.path());
        }
        assert_eq!(vault.len(), 2);
    }

    #[tokio::test]
    async fn test_cached_key_removed_from_vault_is_not_bound() {
        let f = fixture();
        let ctx = FieldContext::new(ns(), FieldPath::new("credit_card.number").unwrap());
        let stale = f.registrar.provider.resolve_key(&ctx, &MasterKeyRef::local()).await.unwrap();

        // removed behind the cache's back, as a rollback elsewhere would
        f.vault.delete(stale.id()).await.unwrap();

        let err = f.registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await.unwrap_err();
        assert!(matches!(err, Error::Provisioning { .. }));

        let handle =
            f.registrar.provision_collection(&ns(), &schema(), &MasterKeyRef::local()).await.unwrap().into_inner();
        let bound = handle.schema().field(ctx.path()).unwrap().key_id().unwrap();
        assert_ne!(bound, stale.id());
        assert!(f.vault.find_by_id(bound).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_missing_collection_fails() {
        let f = fixture();
        let err = f.registrar.open_collection(&ns(), &MasterKeyRef::local()).await.unwrap_err();
        assert!(matches!(err, Error::Provisioning { .. }));
    }
}
