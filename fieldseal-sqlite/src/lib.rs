//! `SQLite` persistence for `FieldSeal`.
//!
//! One database file holds both the encrypted collections and the key vault:
//!
//! ```text
//! collections    (namespace PK, schema JSON)
//! documents      (id PK, namespace, body JSON)
//! unique_indexes (namespace, path) PK
//! unique_values  (namespace, path, value) PK -> document_id
//! key_vault      (id PK, namespace, key_alt_name, record JSON), UNIQUE (namespace, key_alt_name)
//! ```
//!
//! Uniqueness is enforced by primary keys, so concurrent writers, including
//! other processes sharing the file, can never store two documents with the
//! same indexed value or two DEKs with the same alternate name.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod documents;
mod key_vault;

pub use documents::SqliteDocumentStore;
pub use key_vault::SqliteKeyVault;

use fieldseal::context::KeyVaultNamespace;
use fieldseal::error::StoreError;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    namespace   TEXT PRIMARY KEY,
    schema      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    id          TEXT PRIMARY KEY,
    namespace   TEXT NOT NULL,
    body        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_namespace ON documents (namespace);
CREATE TABLE IF NOT EXISTS unique_indexes (
    namespace   TEXT NOT NULL,
    path        TEXT NOT NULL,
    PRIMARY KEY (namespace, path)
);
CREATE TABLE IF NOT EXISTS unique_values (
    namespace   TEXT NOT NULL,
    path        TEXT NOT NULL,
    value       TEXT NOT NULL,
    document_id TEXT NOT NULL,
    PRIMARY KEY (namespace, path, value)
);
CREATE TABLE IF NOT EXISTS key_vault (
    id           TEXT PRIMARY KEY,
    namespace    TEXT NOT NULL,
    key_alt_name TEXT NOT NULL,
    record       TEXT NOT NULL,
    UNIQUE (namespace, key_alt_name)
);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised inside the `SQLite` backend.
#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    /// `SQLite` call failed
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored JSON could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Target collection has not been created
    #[error("collection {0} does not exist")]
    MissingCollection(String),

    /// A unique index cannot be declared over existing duplicates
    #[error("cannot create unique index on {0}: duplicate values present")]
    DuplicateValues(String),

    /// A stored row does not decode
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The blocking worker panicked or was cancelled
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Sqlite(e)
                if matches!(
                    e.sqlite_error_code(),
                    Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                ) =>
            {
                Self::Unavailable(e.to_string())
            }
            SqliteError::Serialization(e) => Self::Serialization(e),
            SqliteError::MissingCollection(_) | SqliteError::DuplicateValues(_) => {
                Self::Rejected(err.to_string())
            }
            SqliteError::Sqlite(_) | SqliteError::Corrupt(_) | SqliteError::Join(_) => {
                Self::Backend(err.to_string())
            }
        }
    }
}

/// Shared handle to one `SQLite` database.
///
/// Cheap to clone. Every call runs on the blocking thread pool while holding
/// the connection lock.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDatabase").finish_non_exhaustive()
    }
}

impl SqliteDatabase {
    /// Opens (or creates) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the file cannot be opened or the tables
    /// cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(SqliteError::from)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(SqliteError::from)?;
        let db = Self::init(conn)?;
        info!(path = %path.display(), "opened sqlite database");
        Ok(db)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the tables cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(SqliteError::from)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(SqliteError::from)?;
        conn.execute_batch(SCHEMA).map_err(SqliteError::from)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Returns a document store backed by this database.
    #[must_use]
    pub fn document_store(&self) -> SqliteDocumentStore {
        SqliteDocumentStore::new(self.clone())
    }

    /// Returns a key vault in `namespace` backed by this database.
    #[must_use]
    pub fn key_vault(&self, namespace: KeyVaultNamespace) -> SqliteKeyVault {
        SqliteKeyVault::new(self.clone(), namespace)
    }

    /// Runs `f` against the connection on the blocking thread pool.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, SqliteError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| SqliteError::Join(e.to_string()))?;
        Ok(result?)
    }
}
