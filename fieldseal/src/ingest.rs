//! Idempotent ingestion into a provisioned encrypted collection.
//!
//! A document is identified by the equality ciphertext of its dedup field.
//! The coordinator looks that ciphertext up before inserting, and a unique
//! index on the dedup path closes the window between lookup and insert: a
//! concurrent duplicate is rejected by the store and reported as
//! `AlreadyExists`.

use crate::context::{FieldContext, FieldPath};
use crate::error::Error;
use crate::extract::ValidatedSensitiveValue;
use crate::provider::{Ciphertext, DataEncryptionKey, EncryptionProvider};
use crate::schema::{CollectionHandle, EncryptedFieldSpec, QueryType};
use crate::store::{
    document_id, get_path, set_path, Document, DocumentId, DocumentStore, Filter, InsertResult, ID_FIELD,
};
use crate::timeout::with_timeout;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of [`IngestionCoordinator::insert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The document was stored
    Inserted(DocumentId),
    /// A document with the same dedup value exists; nothing was stored
    AlreadyExists {
        /// The existing document, when known
        existing: Option<DocumentId>,
    },
}

impl InsertOutcome {
    /// Returns `true` if this call stored the document.
    #[must_use]
    pub const fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// A value bound for an encrypted field.
#[derive(Clone)]
enum SensitiveValue {
    Validated(ValidatedSensitiveValue),
    Typed(Value),
}

impl SensitiveValue {
    fn to_value(&self) -> Value {
        match self {
            Self::Validated(value) => Value::String(value.expose().to_owned()),
            Self::Typed(value) => value.clone(),
        }
    }
}

impl fmt::Debug for SensitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// A document to ingest: plaintext metadata plus sensitive values.
#[derive(Debug, Clone, Default)]
pub struct IngestDocument {
    metadata: Vec<(FieldPath, Value)>,
    sensitive: Vec<(FieldPath, SensitiveValue)>,
}

impl IngestDocument {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plaintext field.
    #[must_use]
    pub fn with_metadata(mut self, path: FieldPath, value: impl Into<Value>) -> Self {
        self.metadata.push((path, value.into()));
        self
    }

    /// Adds a field that will be stored encrypted.
    #[must_use]
    pub fn with_sensitive(mut self, path: FieldPath, value: ValidatedSensitiveValue) -> Self {
        self.sensitive.push((path, SensitiveValue::Validated(value)));
        self
    }

    /// Adds a typed value that will be stored encrypted, for fields declared
    /// as numbers or booleans. The dedup field only takes
    /// [`IngestDocument::with_sensitive`].
    #[must_use]
    pub fn with_sensitive_value(mut self, path: FieldPath, value: impl Into<Value>) -> Self {
        self.sensitive.push((path, SensitiveValue::Typed(value.into())));
        self
    }

    fn sensitive_value(&self, path: &FieldPath) -> Option<&SensitiveValue> {
        self.sensitive.iter().find(|(p, _)| p == path).map(|(_, v)| v)
    }
}

/// Inserts documents into one encrypted collection without duplicates.
pub struct IngestionCoordinator {
    provider: Arc<EncryptionProvider>,
    store: Arc<dyn DocumentStore>,
    collection: CollectionHandle,
    dedup: EncryptedFieldSpec,
}

impl fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("namespace", self.collection.namespace())
            .field("dedup", self.dedup.path())
            .finish_non_exhaustive()
    }
}

impl IngestionCoordinator {
    /// Creates a coordinator deduplicating on `dedup_path` and makes sure the
    /// store enforces uniqueness on that path.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if `dedup_path` is not an
    /// equality-queryable encrypted field, `Error::Database` if the unique
    /// index cannot be created, or `Error::Timeout`.
    pub async fn new(
        provider: Arc<EncryptionProvider>,
        store: Arc<dyn DocumentStore>,
        collection: CollectionHandle,
        dedup_path: FieldPath,
    ) -> Result<Self, Error> {
        let coordinator = Self::open(provider, store, collection, dedup_path)?;
        let (provider, store, collection) = (&coordinator.provider, &coordinator.store, &coordinator.collection);
        let dedup_path = coordinator.dedup.path();

        let index = with_timeout(
            "database.create_unique_index",
            provider.timeouts().database,
            store.create_unique_index(collection.namespace(), dedup_path),
        )
        .await??;
        if index.is_created() {
            info!(namespace = %collection.namespace(), path = %dedup_path, "created unique index on dedup field");
        }

        Ok(coordinator)
    }

    /// Creates a coordinator for lookups only. Nothing is written to the
    /// store; inserts through it rely on a unique index created earlier.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if `dedup_path` is not an
    /// equality-queryable encrypted field.
    pub fn open(
        provider: Arc<EncryptionProvider>,
        store: Arc<dyn DocumentStore>,
        collection: CollectionHandle,
        dedup_path: FieldPath,
    ) -> Result<Self, Error> {
        let dedup = collection
            .schema()
            .field(&dedup_path)
            .filter(|f| f.query_type() == Some(QueryType::Equality))
            .cloned()
            .ok_or_else(|| {
                Error::InvalidSchema(format!(
                    "dedup field {dedup_path} must be an equality-queryable encrypted field of {}",
                    collection.namespace()
                ))
            })?;
        Ok(Self { provider, store, collection, dedup })
    }

    /// Returns the target collection.
    #[must_use]
    pub const fn collection(&self) -> &CollectionHandle {
        &self.collection
    }

    /// Inserts `document` unless one with the same dedup value exists.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidDocument` if the dedup value is missing or a value
    ///   does not match its declared type
    /// - `Error::UndeclaredField` for a sensitive value at an undeclared path
    /// - `Error::PlaintextForEncryptedField` for metadata at a declared path
    /// - `Error::KeyResolution`, `Error::Database` or `Error::Timeout` from
    ///   the collaborators
    pub async fn insert_if_absent(&self, document: IngestDocument) -> Result<InsertOutcome, Error> {
        self.check_shape(&document)?;
        let namespace = self.collection.namespace();

        let dedup_value = match document.sensitive_value(self.dedup.path()) {
            Some(SensitiveValue::Validated(value)) => value,
            Some(SensitiveValue::Typed(_)) => {
                return Err(Error::InvalidDocument(format!(
                    "dedup field {} needs a validated value",
                    self.dedup.path()
                )));
            }
            None => {
                return Err(Error::InvalidDocument(format!("missing value for dedup field {}", self.dedup.path())));
            }
        };
        let filter = self.dedup_filter(dedup_value).await?;

        if let Some(existing) = self.find_one(&filter).await? {
            let existing = document_id(&existing);
            info!(namespace = %namespace, existing = ?existing, "document with the same dedup value already exists");
            return Ok(InsertOutcome::AlreadyExists { existing });
        }

        let mut body = Document::new();
        for (path, value) in &document.metadata {
            if !set_path(&mut body, path, value.clone()) {
                return Err(Error::InvalidDocument(format!("conflicting paths at {path}")));
            }
        }
        for (path, value) in &document.sensitive {
            let spec = self.declared(path)?;
            let key = self.key_for(spec).await?;
            let ciphertext = self.provider.encrypt_field(
                &value.to_value(),
                &key,
                spec.query_type(),
                spec.field_type(),
            )?;
            if !set_path(&mut body, path, ciphertext.to_value()) {
                return Err(Error::InvalidDocument(format!("conflicting paths at {path}")));
            }
        }

        let result = with_timeout(
            "database.insert_one",
            self.provider.timeouts().database,
            self.store.insert_one(namespace, body),
        )
        .await??;

        match result {
            InsertResult::Inserted(id) => {
                info!(namespace = %namespace, id = %id, "inserted encrypted document");
                Ok(InsertOutcome::Inserted(id))
            }
            InsertResult::DuplicateKey { existing } => {
                info!(namespace = %namespace, existing = ?existing, "concurrent insert won; document already exists");
                Ok(InsertOutcome::AlreadyExists { existing })
            }
        }
    }

    /// Finds the document holding `value` in the dedup field, with its
    /// encrypted fields decrypted.
    ///
    /// # Errors
    ///
    /// Returns key resolution, database, timeout or decryption errors.
    pub async fn find_by_dedup(&self, value: &ValidatedSensitiveValue) -> Result<Option<Document>, Error> {
        let filter = self.dedup_filter(value).await?;
        match self.find_one(&filter).await? {
            Some(document) => self.decrypt_document(document).await.map(Some),
            None => Ok(None),
        }
    }

    /// Counts documents holding `value` in the dedup field.
    ///
    /// # Errors
    ///
    /// Returns key resolution, database or timeout errors.
    pub async fn count_by_dedup(&self, value: &ValidatedSensitiveValue) -> Result<u64, Error> {
        let filter = self.dedup_filter(value).await?;
        let count = with_timeout(
            "database.count",
            self.provider.timeouts().database,
            self.store.count(self.collection.namespace(), &filter),
        )
        .await??;
        Ok(count)
    }

    fn check_shape(&self, document: &IngestDocument) -> Result<(), Error> {
        let schema = self.collection.schema();
        let namespace = self.collection.namespace();
        for (path, _) in &document.metadata {
            if path.segments().next() == Some(ID_FIELD) {
                return Err(Error::InvalidDocument(format!("{path} is assigned by the store")));
            }
            if schema.covers(path) {
                return Err(Error::PlaintextForEncryptedField {
                    namespace: namespace.to_string(),
                    path: path.to_string(),
                });
            }
        }
        for (i, (path, _)) in document.sensitive.iter().enumerate() {
            self.declared(path)?;
            if document.sensitive[..i].iter().any(|(p, _)| p == path) {
                return Err(Error::InvalidDocument(format!("duplicate value for {path}")));
            }
        }
        Ok(())
    }

    fn declared(&self, path: &FieldPath) -> Result<&EncryptedFieldSpec, Error> {
        self.collection.schema().field(path).ok_or_else(|| Error::UndeclaredField {
            namespace: self.collection.namespace().to_string(),
            path: path.to_string(),
        })
    }

    fn context(&self, path: &FieldPath) -> FieldContext {
        FieldContext::new(self.collection.namespace().clone(), path.clone())
    }

    /// Resolves the DEK of a declared field, checking it is the one bound at
    /// provisioning time.
    async fn key_for(&self, spec: &EncryptedFieldSpec) -> Result<Arc<DataEncryptionKey>, Error> {
        let context = self.context(spec.path());
        let key = self.provider.resolve_key(&context, self.collection.master_key()).await?;
        match spec.key_id() {
            Some(bound) if bound != key.id() => Err(Error::key_resolution(
                &context,
                format!("resolved data key {} but schema binds {bound}", key.id()),
            )),
            _ => Ok(key),
        }
    }

    async fn dedup_filter(&self, value: &ValidatedSensitiveValue) -> Result<Filter, Error> {
        let key = self.key_for(&self.dedup).await?;
        let ciphertext = self.provider.encrypt_field(
            &Value::String(value.expose().to_owned()),
            &key,
            Some(QueryType::Equality),
            self.dedup.field_type(),
        )?;
        Ok(Filter::eq(self.dedup.path().clone(), ciphertext.to_value()))
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Document>, Error> {
        let found = with_timeout(
            "database.find_one",
            self.provider.timeouts().database,
            self.store.find_one(self.collection.namespace(), filter),
        )
        .await??;
        Ok(found)
    }

    async fn decrypt_document(&self, mut document: Document) -> Result<Document, Error> {
        for spec in self.collection.schema().fields() {
            let Some(ciphertext) = get_path(&document, spec.path()).and_then(Ciphertext::from_value) else {
                continue;
            };
            let context = self.context(spec.path());
            let key_id = ciphertext.header()?.key_id();
            let current = self.key_for(spec).await?;
            let key = if current.id() == key_id {
                current
            } else {
                self.provider.key_for_id(key_id, &context).await?
            };
            let plaintext = self.provider.decrypt_field(&ciphertext, &key)?;
            set_path(&mut document, spec.path(), plaintext);
            debug!(context = %context, "decrypted field");
        }
        Ok(document)
    }
}
