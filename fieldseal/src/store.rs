//! Document database boundary.
//!
//! The core only needs collection creation with an encrypted schema, unique
//! indexes, equality lookups and single inserts. Backends report
//! "already exists" and "duplicate key" as result variants, never as errors.

use crate::context::{FieldPath, Namespace};
use crate::error::StoreError;
use crate::schema::EncryptedCollectionSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// A JSON document.
pub type Document = Map<String, Value>;

/// Name of the identifier field every stored document carries.
pub const ID_FIELD: &str = "_id";

/// Outcome of an idempotent create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome<T> {
    /// This call created the resource.
    Created(T),
    /// The resource was already there; the existing one is returned.
    AlreadyExists(T),
}

impl<T> CreateOutcome<T> {
    /// Returns the resource regardless of who created it.
    pub fn into_inner(self) -> T {
        match self {
            Self::Created(inner) | Self::AlreadyExists(inner) => inner,
        }
    }

    /// Returns a reference to the resource.
    pub const fn get(&self) -> &T {
        match self {
            Self::Created(inner) | Self::AlreadyExists(inner) => inner,
        }
    }

    /// Returns `true` if this call created the resource.
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// Maps the contained resource.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CreateOutcome<U> {
        match self {
            Self::Created(inner) => CreateOutcome::Created(f(inner)),
            Self::AlreadyExists(inner) => CreateOutcome::AlreadyExists(f(inner)),
        }
    }
}

/// Identifier assigned to an inserted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for DocumentId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The document was stored under this id.
    Inserted(DocumentId),
    /// A unique index already holds the same value; nothing was stored.
    DuplicateKey {
        /// Document already holding the value, if the backend knows it
        existing: Option<DocumentId>,
    },
}

/// Equality filter on a dotted path.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    path: FieldPath,
    value: Value,
}

impl Filter {
    /// Matches documents whose value at `path` equals `value`.
    #[must_use]
    pub const fn eq(path: FieldPath, value: Value) -> Self {
        Self { path, value }
    }

    /// Returns the filtered path.
    #[must_use]
    pub const fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Returns the expected value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Evaluates the filter against a document.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        get_path(document, &self.path) == Some(&self.value)
    }
}

/// Reads the value at a dotted path.
#[must_use]
pub fn get_path<'a>(document: &'a Document, path: &FieldPath) -> Option<&'a Value> {
    let mut segments = path.segments();
    let first = segments.next()?;
    segments.try_fold(document.get(first)?, |value, segment| value.as_object()?.get(segment))
}

/// Writes `value` at a dotted path, creating intermediate objects.
///
/// Returns `false` if an intermediate segment already holds a non-object
/// value; that value is never overwritten.
pub fn set_path(document: &mut Document, path: &FieldPath, value: Value) -> bool {
    let segments: Vec<&str> = path.segments().collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = document;
    for segment in parents {
        let entry = current.entry((*segment).to_string()).or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(map) => current = map,
            _ => return false,
        }
    }
    current.insert((*last).to_string(), value);
    true
}

/// Stored documents are addressed by the `_id` field as a UUID string.
#[must_use]
pub fn document_id(document: &Document) -> Option<DocumentId> {
    document.get(ID_FIELD)?.as_str()?.parse::<Uuid>().ok().map(DocumentId)
}

/// Document database operations used by the pipeline.
///
/// Implementations must be thread-safe; the ingestion path calls them from
/// concurrent tasks.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates a collection bound to an encrypted schema.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` for any failure other than "already exists",
    /// which is reported as `CreateOutcome::AlreadyExists` carrying the
    /// stored schema.
    async fn create_collection(
        &self,
        namespace: &Namespace,
        schema: &EncryptedCollectionSchema,
    ) -> Result<CreateOutcome<EncryptedCollectionSchema>, StoreError>;

    /// Returns the encrypted schema of an existing collection.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    async fn collection_schema(
        &self,
        namespace: &Namespace,
    ) -> Result<Option<EncryptedCollectionSchema>, StoreError>;

    /// Declares a unique index on `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Rejected` if the collection does not exist or
    /// already holds duplicate values at `path`.
    async fn create_unique_index(
        &self,
        namespace: &Namespace,
        path: &FieldPath,
    ) -> Result<CreateOutcome<()>, StoreError>;

    /// Returns the first document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    async fn find_one(
        &self,
        namespace: &Namespace,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError>;

    /// Counts documents matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    async fn count(&self, namespace: &Namespace, filter: &Filter) -> Result<u64, StoreError>;

    /// Inserts one document, assigning its `_id`.
    ///
    /// The store owns `_id`; any value already present is replaced. The
    /// insert and the unique index checks are atomic: a violation stores
    /// nothing and yields `InsertResult::DuplicateKey`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` for failures other than unique index violations.
    async fn insert_one(
        &self,
        namespace: &Namespace,
        document: Document,
    ) -> Result<InsertResult, StoreError>;
}
