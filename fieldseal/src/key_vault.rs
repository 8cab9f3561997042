//! Key vault boundary: persistent storage of wrapped data encryption keys.

use crate::context::{FieldContext, KeyVaultNamespace};
use crate::error::StoreError;
use crate::kms::MasterKeyRef;
use crate::store::CreateOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A wrapped DEK as persisted in the key vault.
///
/// The raw key never appears here; `wrapped_key` is only usable together
/// with the KMS master key named by `master_key`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DekRecord {
    id: Uuid,
    key_alt_name: String,
    #[serde(with = "base64_bytes")]
    wrapped_key: Vec<u8>,
    master_key: MasterKeyRef,
    created_at: DateTime<Utc>,
}

impl DekRecord {
    /// Creates a record for a freshly wrapped DEK.
    #[must_use]
    pub fn new(context: &FieldContext, wrapped_key: Vec<u8>, master_key: MasterKeyRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            key_alt_name: context.key_alt_name(),
            wrapped_key,
            master_key,
            created_at: Utc::now(),
        }
    }

    /// Returns the DEK id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the `(collection, field)` association, `namespace|path`.
    #[must_use]
    pub fn key_alt_name(&self) -> &str {
        &self.key_alt_name
    }

    /// Returns the wrapped key bytes.
    #[must_use]
    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    /// Returns the master key that wrapped this DEK.
    #[must_use]
    pub const fn master_key(&self) -> &MasterKeyRef {
        &self.master_key
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Debug for DekRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DekRecord")
            .field("id", &self.id)
            .field("key_alt_name", &self.key_alt_name)
            .field("wrapped_key", &format_args!("<{} bytes>", self.wrapped_key.len()))
            .field("master_key", &self.master_key)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Storage for wrapped DEKs, addressed by id and by alternate name.
///
/// The store enforces uniqueness of `key_alt_name`, so at most one DEK ever
/// exists per (collection, field) pair even across processes.
#[async_trait::async_trait]
pub trait KeyVaultStore: Send + Sync {
    /// Returns the namespace this vault lives in.
    fn namespace(&self) -> &KeyVaultNamespace;

    /// Looks up a record by alternate name.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    async fn find_by_alt_name(&self, key_alt_name: &str) -> Result<Option<DekRecord>, StoreError>;

    /// Looks up a record by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<DekRecord>, StoreError>;

    /// Stores `record` unless a record with the same alternate name exists,
    /// in which case the stored record is returned as `AlreadyExists`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    async fn insert_if_absent(
        &self,
        record: DekRecord,
    ) -> Result<CreateOutcome<DekRecord>, StoreError>;

    /// Deletes a record. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FieldPath;
    use crate::kms::KmsProviderKind;

    fn record() -> DekRecord {
        let ctx = FieldContext::new("qe.users".parse().unwrap(), FieldPath::new("ssn").unwrap());
        DekRecord::new(&ctx, vec![9; 40], MasterKeyRef::new(KmsProviderKind::Aws, "arn:key"))
    }

    #[test]
    fn test_record_alt_name_is_field_context() {
        assert_eq!(record().key_alt_name(), "qe.users|ssn");
    }

    #[test]
    fn test_record_json_round_trip() {
        let rec = record();
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json["wrapped_key"].is_string());
        let back: DekRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_record_debug_hides_key_bytes() {
        let rendered = format!("{:?}", record());
        assert!(rendered.contains("<40 bytes>"));
        assert!(!rendered.contains("[9, 9"));
    }
}
