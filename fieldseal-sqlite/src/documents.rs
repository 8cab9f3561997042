use crate::{SqliteDatabase, SqliteError};
use chrono::Utc;
use fieldseal::context::{FieldPath, Namespace};
use fieldseal::error::StoreError;
use fieldseal::schema::EncryptedCollectionSchema;
use fieldseal::store::{
    get_path, CreateOutcome, Document, DocumentId, DocumentStore, Filter, InsertResult, ID_FIELD,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Document store persisted in `SQLite`.
///
/// Inserts run in an immediate transaction that also claims one
/// `unique_values` row per indexed path; a claimed row makes the insert
/// report `DuplicateKey` and store nothing.
#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    db: SqliteDatabase,
}

impl SqliteDocumentStore {
    pub(crate) const fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }
}

fn collection_exists(conn: &Connection, namespace: &str) -> Result<bool, SqliteError> {
    Ok(conn
        .query_row("SELECT 1 FROM collections WHERE namespace = ?1", params![namespace], |_| Ok(()))
        .optional()?
        .is_some())
}

fn unique_paths(conn: &Connection, namespace: &str) -> Result<Vec<FieldPath>, SqliteError> {
    let mut stmt = conn.prepare("SELECT path FROM unique_indexes WHERE namespace = ?1")?;
    let rows = stmt.query_map(params![namespace], |row| row.get::<_, String>(0))?;
    let mut paths = Vec::new();
    for path in rows {
        paths.push(FieldPath::new(path?).map_err(|e| SqliteError::Corrupt(e.to_string()))?);
    }
    Ok(paths)
}

/// Canonical text of an indexed value.
fn index_key(value: &Value) -> Result<String, SqliteError> {
    Ok(serde_json::to_string(value)?)
}

fn parse_id(id: &str) -> Option<DocumentId> {
    id.parse::<Uuid>().ok().map(DocumentId::from)
}

/// Returns the bodies matching `filter`, using the unique index when the
/// path has one.
fn matching(
    conn: &Connection,
    namespace: &str,
    filter: &Filter,
    limit: Option<usize>,
) -> Result<Vec<Document>, SqliteError> {
    let indexed = unique_paths(conn, namespace)?.contains(filter.path());
    let bodies: Vec<String> = if indexed {
        let mut stmt = conn.prepare(
            "SELECT d.body FROM unique_values u JOIN documents d ON d.id = u.document_id \
             WHERE u.namespace = ?1 AND u.path = ?2 AND u.value = ?3",
        )?;
        let key = index_key(filter.value())?;
        let rows = stmt.query_map(params![namespace, filter.path().as_str(), key], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>()?
    } else {
        let mut stmt = conn.prepare("SELECT body FROM documents WHERE namespace = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![namespace], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>()?
    };

    let mut found = Vec::new();
    for body in bodies {
        let document: Document = serde_json::from_str(&body)?;
        if filter.matches(&document) {
            found.push(document);
            if limit.is_some_and(|l| found.len() >= l) {
                break;
            }
        }
    }
    Ok(found)
}

fn insert(conn: &mut Connection, namespace: &str, mut document: Document) -> Result<InsertResult, SqliteError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !collection_exists(&tx, namespace)? {
        return Err(SqliteError::MissingCollection(namespace.to_string()));
    }

    let id = DocumentId::generate();
    document.insert(ID_FIELD.to_string(), Value::String(id.to_string()));

    for path in unique_paths(&tx, namespace)? {
        let Some(value) = get_path(&document, &path) else {
            continue;
        };
        let key = index_key(value)?;
        let holder: Option<String> = tx
            .query_row(
                "SELECT document_id FROM unique_values WHERE namespace = ?1 AND path = ?2 AND value = ?3",
                params![namespace, path.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(holder) = holder {
            debug!(namespace, path = %path, "unique index rejected insert");
            return Ok(InsertResult::DuplicateKey { existing: parse_id(&holder) });
        }
        tx.execute(
            "INSERT INTO unique_values (namespace, path, value, document_id) VALUES (?1, ?2, ?3, ?4)",
            params![namespace, path.as_str(), key, id.to_string()],
        )?;
    }

    tx.execute(
        "INSERT INTO documents (id, namespace, body) VALUES (?1, ?2, ?3)",
        params![id.to_string(), namespace, serde_json::to_string(&document)?],
    )?;
    tx.commit()?;
    Ok(InsertResult::Inserted(id))
}

fn create_index(conn: &mut Connection, namespace: &str, path: &FieldPath) -> Result<CreateOutcome<()>, SqliteError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !collection_exists(&tx, namespace)? {
        return Err(SqliteError::MissingCollection(namespace.to_string()));
    }
    if unique_paths(&tx, namespace)?.contains(path) {
        return Ok(CreateOutcome::AlreadyExists(()));
    }

    let documents: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT id, body FROM documents WHERE namespace = ?1")?;
        let rows = stmt.query_map(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<(String, String)>, _>>()?
    };
    for (id, body) in documents {
        let document: Document = serde_json::from_str(&body)?;
        let Some(value) = get_path(&document, path) else {
            continue;
        };
        let claimed = tx.execute(
            "INSERT OR IGNORE INTO unique_values (namespace, path, value, document_id) VALUES (?1, ?2, ?3, ?4)",
            params![namespace, path.as_str(), index_key(value)?, id],
        )?;
        if claimed == 0 {
            return Err(SqliteError::DuplicateValues(path.to_string()));
        }
    }

    tx.execute(
        "INSERT INTO unique_indexes (namespace, path) VALUES (?1, ?2)",
        params![namespace, path.as_str()],
    )?;
    tx.commit()?;
    Ok(CreateOutcome::Created(()))
}

#[async_trait::async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn create_collection(
        &self,
        namespace: &Namespace,
        schema: &EncryptedCollectionSchema,
    ) -> Result<CreateOutcome<EncryptedCollectionSchema>, StoreError> {
        let ns = namespace.to_string();
        let schema = schema.clone();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let stored: Option<String> = tx
                    .query_row("SELECT schema FROM collections WHERE namespace = ?1", params![ns], |row| {
                        row.get(0)
                    })
                    .optional()?;
                if let Some(stored) = stored {
                    return Ok(CreateOutcome::AlreadyExists(serde_json::from_str(&stored)?));
                }
                tx.execute(
                    "INSERT INTO collections (namespace, schema, created_at) VALUES (?1, ?2, ?3)",
                    params![ns, serde_json::to_string(&schema)?, Utc::now().to_rfc3339()],
                )?;
                tx.commit()?;
                Ok(CreateOutcome::Created(schema))
            })
            .await
    }

    async fn collection_schema(
        &self,
        namespace: &Namespace,
    ) -> Result<Option<EncryptedCollectionSchema>, StoreError> {
        let ns = namespace.to_string();
        self.db
            .run(move |conn| {
                let stored: Option<String> = conn
                    .query_row("SELECT schema FROM collections WHERE namespace = ?1", params![ns], |row| {
                        row.get(0)
                    })
                    .optional()?;
                stored.map(|s| serde_json::from_str(&s)).transpose().map_err(SqliteError::from)
            })
            .await
    }

    async fn create_unique_index(
        &self,
        namespace: &Namespace,
        path: &FieldPath,
    ) -> Result<CreateOutcome<()>, StoreError> {
        let ns = namespace.to_string();
        let path = path.clone();
        self.db.run(move |conn| create_index(conn, &ns, &path)).await
    }

    async fn find_one(
        &self,
        namespace: &Namespace,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let ns = namespace.to_string();
        let filter = filter.clone();
        self.db
            .run(move |conn| Ok(matching(conn, &ns, &filter, Some(1))?.into_iter().next()))
            .await
    }

    async fn count(&self, namespace: &Namespace, filter: &Filter) -> Result<u64, StoreError> {
        let ns = namespace.to_string();
        let filter = filter.clone();
        self.db
            .run(move |conn| Ok(matching(conn, &ns, &filter, None)?.len() as u64))
            .await
    }

    async fn insert_one(
        &self,
        namespace: &Namespace,
        document: Document,
    ) -> Result<InsertResult, StoreError> {
        let ns = namespace.to_string();
        self.db.run(move |conn| insert(conn, &ns, document)).await
    }
}
