//! In-process document store and key vault.
//!
//! Both keep everything behind a single `parking_lot::Mutex`, which makes
//! every operation, including insert-with-unique-check, atomic. Useful for
//! tests, demos and single-process deployments that do not need durability.

use crate::context::{FieldPath, KeyVaultNamespace, Namespace};
use crate::error::StoreError;
use crate::key_vault::{DekRecord, KeyVaultStore};
use crate::schema::EncryptedCollectionSchema;
use crate::store::{
    get_path, CreateOutcome, Document, DocumentId, DocumentStore, Filter, InsertResult, ID_FIELD,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug)]
struct CollectionState {
    schema: EncryptedCollectionSchema,
    unique_paths: Vec<FieldPath>,
    documents: Vec<Document>,
}

impl CollectionState {
    fn conflicting(&self, document: &Document) -> Option<Option<DocumentId>> {
        self.unique_paths.iter().find_map(|path| {
            let value = get_path(document, path)?;
            self.documents
                .iter()
                .find(|existing| get_path(existing, path) == Some(value))
                .map(crate::store::document_id)
        })
    }
}

/// Document store held in memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<Namespace, CollectionState>>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of documents in a collection (0 if absent).
    #[must_use]
    pub fn len(&self, namespace: &Namespace) -> usize {
        self.collections.lock().get(namespace).map_or(0, |c| c.documents.len())
    }

    /// Returns a snapshot of every document in a collection.
    #[must_use]
    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.collections.lock().get(namespace).map(|c| c.documents.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_collection(
        &self,
        namespace: &Namespace,
        schema: &EncryptedCollectionSchema,
    ) -> Result<CreateOutcome<EncryptedCollectionSchema>, StoreError> {
        let mut collections = self.collections.lock();
        if let Some(existing) = collections.get(namespace) {
            return Ok(CreateOutcome::AlreadyExists(existing.schema.clone()));
        }
        collections.insert(
            namespace.clone(),
            CollectionState {
                schema: schema.clone(),
                unique_paths: Vec::new(),
                documents: Vec::new(),
            },
        );
        drop(collections);
        Ok(CreateOutcome::Created(schema.clone()))
    }

    async fn collection_schema(
        &self,
        namespace: &Namespace,
    ) -> Result<Option<EncryptedCollectionSchema>, StoreError> {
        Ok(self.collections.lock().get(namespace).map(|c| c.schema.clone()))
    }

    async fn create_unique_index(
        &self,
        namespace: &Namespace,
        path: &FieldPath,
    ) -> Result<CreateOutcome<()>, StoreError> {
        let mut collections = self.collections.lock();
        let state = collections
            .get_mut(namespace)
            .ok_or_else(|| StoreError::Rejected(format!("collection {namespace} does not exist")))?;

        if state.unique_paths.contains(path) {
            return Ok(CreateOutcome::AlreadyExists(()));
        }

        let mut seen: Vec<&Value> = Vec::new();
        for value in state.documents.iter().filter_map(|d| get_path(d, path)) {
            if seen.contains(&value) {
                return Err(StoreError::Rejected(format!(
                    "cannot create unique index on {path}: duplicate values present"
                )));
            }
            seen.push(value);
        }

        state.unique_paths.push(path.clone());
        Ok(CreateOutcome::Created(()))
    }

    async fn find_one(
        &self,
        namespace: &Namespace,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.lock();
        Ok(collections
            .get(namespace)
            .and_then(|c| c.documents.iter().find(|d| filter.matches(d)).cloned()))
    }

    async fn count(&self, namespace: &Namespace, filter: &Filter) -> Result<u64, StoreError> {
        let collections = self.collections.lock();
        let count = collections
            .get(namespace)
            .map_or(0, |c| c.documents.iter().filter(|d| filter.matches(d)).count());
        Ok(count as u64)
    }

    async fn insert_one(
        &self,
        namespace: &Namespace,
        mut document: Document,
    ) -> Result<InsertResult, StoreError> {
        let mut collections = self.collections.lock();
        let state = collections
            .get_mut(namespace)
            .ok_or_else(|| StoreError::Rejected(format!("collection {namespace} does not exist")))?;

        if let Some(existing) = state.conflicting(&document) {
            return Ok(InsertResult::DuplicateKey { existing });
        }

        let id = DocumentId::generate();
        document.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        state.documents.push(document);
        Ok(InsertResult::Inserted(id))
    }
}

/// Key vault held in memory.
#[derive(Debug, Default)]
pub struct MemoryKeyVault {
    namespace: KeyVaultNamespace,
    records: Mutex<HashMap<Uuid, DekRecord>>,
}

impl MemoryKeyVault {
    /// Creates an empty vault in the given namespace.
    #[must_use]
    pub fn new(namespace: KeyVaultNamespace) -> Self {
        Self { namespace, records: Mutex::new(HashMap::new()) }
    }

    /// Returns the number of stored DEKs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` if no DEK is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl KeyVaultStore for MemoryKeyVault {
    fn namespace(&self) -> &KeyVaultNamespace {
        &self.namespace
    }

    async fn find_by_alt_name(&self, key_alt_name: &str) -> Result<Option<DekRecord>, StoreError> {
        Ok(self.records.lock().values().find(|r| r.key_alt_name() == key_alt_name).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<DekRecord>, StoreError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn insert_if_absent(
        &self,
        record: DekRecord,
    ) -> Result<CreateOutcome<DekRecord>, StoreError> {
        let mut records = self.records.lock();
        if let Some(existing) = records.values().find(|r| r.key_alt_name() == record.key_alt_name())
        {
            return Ok(CreateOutcome::AlreadyExists(existing.clone()));
        }
        records.insert(record.id(), record.clone());
        drop(records);
        Ok(CreateOutcome::Created(record))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.records.lock().remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FieldContext;
    use crate::kms::MasterKeyRef;
    use crate::schema::{EncryptedFieldSpec, FieldType, QueryType};
    use serde_json::json;

    fn ns() -> Namespace {
        "qe.users".parse().unwrap()
    }

    fn schema() -> EncryptedCollectionSchema {
        EncryptedCollectionSchema::new(vec![EncryptedFieldSpec::new(
            FieldPath::new("ssn").unwrap(),
            FieldType::String,
        )
        .with_query(QueryType::Equality)])
        .unwrap()
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_collection_is_idempotent() {
        let store = MemoryDocumentStore::new();
        assert!(store.create_collection(&ns(), &schema()).await.unwrap().is_created());
        let second = store.create_collection(&ns(), &schema()).await.unwrap();
        assert_eq!(second, CreateOutcome::AlreadyExists(schema()));
    }

    #[tokio::test]
    async fn test_insert_requires_collection() {
        let store = MemoryDocumentStore::new();
        let result = store.insert_one(&ns(), doc(json!({"a": 1}))).await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let store = MemoryDocumentStore::new();
        store.create_collection(&ns(), &schema()).await.unwrap();
        let path = FieldPath::new("ssn").unwrap();
        store.create_unique_index(&ns(), &path).await.unwrap();

        let first = store.insert_one(&ns(), doc(json!({"ssn": "a"}))).await.unwrap();
        let InsertResult::Inserted(id) = first else { panic!("expected insert") };

        let second = store.insert_one(&ns(), doc(json!({"ssn": "a"}))).await.unwrap();
        assert_eq!(second, InsertResult::DuplicateKey { existing: Some(id) });
        assert_eq!(store.len(&ns()), 1);

        let filter = Filter::eq(path, json!("a"));
        assert_eq!(store.count(&ns(), &filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unique_index_refused_over_duplicates() {
        let store = MemoryDocumentStore::new();
        store.create_collection(&ns(), &schema()).await.unwrap();
        store.insert_one(&ns(), doc(json!({"ssn": "a"}))).await.unwrap();
        store.insert_one(&ns(), doc(json!({"ssn": "a"}))).await.unwrap();

        let result = store.create_unique_index(&ns(), &FieldPath::new("ssn").unwrap()).await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_key_vault_unique_alt_name() {
        let vault = MemoryKeyVault::new(KeyVaultNamespace::default());
        let ctx = FieldContext::new(ns(), FieldPath::new("ssn").unwrap());

        let first = DekRecord::new(&ctx, vec![1; 8], MasterKeyRef::local());
        let second = DekRecord::new(&ctx, vec![2; 8], MasterKeyRef::local());

        let created = vault.insert_if_absent(first.clone()).await.unwrap();
        assert!(created.is_created());
        let again = vault.insert_if_absent(second).await.unwrap();
        assert_eq!(again, CreateOutcome::AlreadyExists(first.clone()));
        assert_eq!(vault.len(), 1);

        assert!(vault.delete(first.id()).await.unwrap());
        assert!(vault.is_empty());
    }
}
