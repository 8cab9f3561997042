use crate::{SqliteDatabase, SqliteError};
use fieldseal::context::KeyVaultNamespace;
use fieldseal::error::StoreError;
use fieldseal::key_vault::{DekRecord, KeyVaultStore};
use fieldseal::store::CreateOutcome;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

/// Key vault persisted in `SQLite`, unique on `(namespace, key_alt_name)`.
#[derive(Debug, Clone)]
pub struct SqliteKeyVault {
    db: SqliteDatabase,
    namespace: KeyVaultNamespace,
}

impl SqliteKeyVault {
    pub(crate) const fn new(db: SqliteDatabase, namespace: KeyVaultNamespace) -> Self {
        Self { db, namespace }
    }
}

fn by_alt_name(conn: &Connection, namespace: &str, alt_name: &str) -> Result<Option<DekRecord>, SqliteError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT record FROM key_vault WHERE namespace = ?1 AND key_alt_name = ?2",
            params![namespace, alt_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.map(|s| serde_json::from_str(&s)).transpose()?)
}

#[async_trait::async_trait]
impl KeyVaultStore for SqliteKeyVault {
    fn namespace(&self) -> &KeyVaultNamespace {
        &self.namespace
    }

    async fn find_by_alt_name(&self, key_alt_name: &str) -> Result<Option<DekRecord>, StoreError> {
        let ns = self.namespace.to_string();
        let alt_name = key_alt_name.to_string();
        self.db.run(move |conn| by_alt_name(conn, &ns, &alt_name)).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<DekRecord>, StoreError> {
        let ns = self.namespace.to_string();
        self.db
            .run(move |conn| {
                let stored: Option<String> = conn
                    .query_row(
                        "SELECT record FROM key_vault WHERE namespace = ?1 AND id = ?2",
                        params![ns, id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(stored.map(|s| serde_json::from_str(&s)).transpose()?)
            })
            .await
    }

    async fn insert_if_absent(
        &self,
        record: DekRecord,
    ) -> Result<CreateOutcome<DekRecord>, StoreError> {
        let ns = self.namespace.to_string();
        self.db
            .run(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO key_vault (id, namespace, key_alt_name, record) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT (namespace, key_alt_name) DO NOTHING",
                    params![
                        record.id().to_string(),
                        ns,
                        record.key_alt_name(),
                        serde_json::to_string(&record)?
                    ],
                )?;
                if inserted == 1 {
                    return Ok(CreateOutcome::Created(record));
                }
                debug!(key_alt_name = record.key_alt_name(), "DEK already stored");
                by_alt_name(conn, &ns, record.key_alt_name())?
                    .map(CreateOutcome::AlreadyExists)
                    .ok_or_else(|| SqliteError::Corrupt(format!("{} vanished after conflict", record.key_alt_name())))
            })
            .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let ns = self.namespace.to_string();
        self.db
            .run(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM key_vault WHERE namespace = ?1 AND id = ?2",
                    params![ns, id.to_string()],
                )?;
                Ok(deleted > 0)
            })
            .await
    }
}
