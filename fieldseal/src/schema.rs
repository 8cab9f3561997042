//! Encrypted field declarations.
//!
//! A collection's [`EncryptedCollectionSchema`] lists every field that is
//! stored as ciphertext, its declared type and the queries it must support.
//! The schema is fixed at provisioning time.

use crate::context::{FieldPath, Namespace};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::kms::MasterKeyRef;

/// Declared plaintext type of an encrypted field.
///
/// Names follow the BSON type aliases used in encrypted field maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// 64-bit float (randomized encryption only)
    Double,
    /// Boolean
    Bool,
}

impl FieldType {
    /// Wire code stored in the ciphertext envelope (BSON element type).
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Double => 0x01,
            Self::String => 0x02,
            Self::Bool => 0x08,
            Self::Int => 0x10,
            Self::Long => 0x12,
        }
    }

    /// Parses a wire code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Double),
            0x02 => Some(Self::String),
            0x08 => Some(Self::Bool),
            0x10 => Some(Self::Int),
            0x12 => Some(Self::Long),
            _ => None,
        }
    }

    /// Whether fields of this type may be declared equality-queryable.
    #[must_use]
    pub const fn supports_equality(self) -> bool {
        !matches!(self, Self::Double | Self::Bool)
    }

    /// Returns `true` if `value` is a valid instance of this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => value.as_i64().is_some_and(|n| i32::try_from(n).is_ok()),
            Self::Long => value.is_i64(),
            Self::Double => value.is_number(),
            Self::Bool => value.is_boolean(),
        }
    }

    /// Encodes a value into the canonical plaintext bytes that get encrypted.
    ///
    /// Canonical encoding keeps deterministic ciphertext stable regardless of
    /// how the JSON number was written.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDocument` if the value does not match the type.
    pub fn encode(self, value: &Value) -> Result<Zeroizing<Vec<u8>>, Error> {
        if !self.accepts(value) {
            return Err(Error::InvalidDocument(format!("value is not a valid {self}")));
        }
        let bytes = match (self, value) {
            (Self::String, Value::String(s)) => s.as_bytes().to_vec(),
            (Self::Int | Self::Long, _) => {
                value.as_i64().map(i64::to_be_bytes).unwrap_or_default().to_vec()
            }
            (Self::Double, _) => {
                value.as_f64().map(f64::to_be_bytes).unwrap_or_default().to_vec()
            }
            (Self::Bool, Value::Bool(b)) => vec![u8::from(*b)],
            _ => return Err(Error::InvalidDocument(format!("value is not a valid {self}"))),
        };
        Ok(Zeroizing::new(bytes))
    }

    /// Decodes canonical plaintext bytes back into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` if the bytes are not a valid encoding.
    pub fn decode(self, bytes: &[u8]) -> Result<Value, Error> {
        let malformed = || Error::Decryption(format!("malformed {self} plaintext"));
        match self {
            Self::String => std::str::from_utf8(bytes)
                .map(|s| Value::String(s.to_owned()))
                .map_err(|_| malformed()),
            Self::Int | Self::Long => {
                let raw: [u8; 8] = bytes.try_into().map_err(|_| malformed())?;
                Ok(Value::from(i64::from_be_bytes(raw)))
            }
            Self::Double => {
                let raw: [u8; 8] = bytes.try_into().map_err(|_| malformed())?;
                Ok(Value::from(f64::from_be_bytes(raw)))
            }
            Self::Bool => match bytes {
                [0] => Ok(Value::Bool(false)),
                [1] => Ok(Value::Bool(true)),
                _ => Err(malformed()),
            },
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Query operations an encrypted field can support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "queryType", rename_all = "lowercase")]
pub enum QueryType {
    /// Exact-match lookups on deterministic ciphertext
    Equality,
}

/// Declaration of one encrypted field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFieldSpec {
    path: FieldPath,
    #[serde(rename = "bsonType")]
    field_type: FieldType,
    #[serde(default)]
    queries: Vec<QueryType>,
    #[serde(rename = "keyId", default, skip_serializing_if = "Option::is_none")]
    key_id: Option<Uuid>,
}

impl EncryptedFieldSpec {
    /// Declares a field encrypted with randomized encryption (not queryable).
    #[must_use]
    pub const fn new(path: FieldPath, field_type: FieldType) -> Self {
        Self { path, field_type, queries: Vec::new(), key_id: None }
    }

    /// Adds a supported query operation.
    #[must_use]
    pub fn with_query(mut self, query: QueryType) -> Self {
        if !self.queries.contains(&query) {
            self.queries.push(query);
        }
        self
    }

    /// Returns the field path.
    #[must_use]
    pub const fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Returns the declared type.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Returns the declared query operations.
    #[must_use]
    pub fn queries(&self) -> &[QueryType] {
        &self.queries
    }

    /// Returns the query mode driving encryption: `Some(Equality)` means
    /// deterministic ciphertext, `None` randomized.
    #[must_use]
    pub fn query_type(&self) -> Option<QueryType> {
        self.queries.first().copied()
    }

    /// Returns the bound DEK id once the collection is provisioned.
    #[must_use]
    pub const fn key_id(&self) -> Option<Uuid> {
        self.key_id
    }

    fn declaration_matches(&self, other: &Self) -> bool {
        self.path == other.path && self.field_type == other.field_type && self.queries == other.queries
    }
}

/// Ordered set of encrypted field declarations for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCollectionSchema {
    fields: Vec<EncryptedFieldSpec>,
}

impl EncryptedCollectionSchema {
    /// Builds and validates a schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if the schema is empty, declares a path
    /// twice, nests one declared path inside another, or asks for equality
    /// queries on a type that cannot support them.
    pub fn new(fields: Vec<EncryptedFieldSpec>) -> Result<Self, Error> {
        let schema = Self { fields };
        schema.validate()?;
        Ok(schema)
    }

    /// Builds a schema the caller has already checked.
    pub(crate) fn from_validated(fields: Vec<EncryptedFieldSpec>) -> Self {
        Self { fields }
    }

    /// Re-checks the invariants of a schema obtained through deserialization.
    ///
    /// # Errors
    ///
    /// See [`EncryptedCollectionSchema::new`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.fields.is_empty() {
            return Err(Error::InvalidSchema("schema declares no encrypted fields".into()));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.query_type() == Some(QueryType::Equality) && !field.field_type.supports_equality()
            {
                return Err(Error::InvalidSchema(format!(
                    "{} fields cannot be equality-queryable: {}",
                    field.field_type, field.path
                )));
            }
            for other in &self.fields[i + 1..] {
                if field.path == other.path {
                    return Err(Error::InvalidSchema(format!("duplicate path: {}", field.path)));
                }
                if field.path.is_prefix_of(&other.path) || other.path.is_prefix_of(&field.path) {
                    return Err(Error::InvalidSchema(format!(
                        "overlapping paths: {} and {}",
                        field.path, other.path
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the declared fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[EncryptedFieldSpec] {
        &self.fields
    }

    /// Looks up the declaration for `path`.
    #[must_use]
    pub fn field(&self, path: &FieldPath) -> Option<&EncryptedFieldSpec> {
        self.fields.iter().find(|f| &f.path == path)
    }

    /// Returns `true` if `path` is declared, or lies inside or above a
    /// declared path.
    #[must_use]
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|f| &f.path == path || f.path.is_prefix_of(path) || path.is_prefix_of(&f.path))
    }

    /// Compares declarations, ignoring bound key ids.
    #[must_use]
    pub fn same_declaration(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self.fields.iter().zip(&other.fields).all(|(a, b)| a.declaration_matches(b))
    }

    /// Returns a copy with each field bound to the key id in `key_ids`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if a field has no key id.
    pub fn bind_key_ids(&self, key_ids: &HashMap<FieldPath, Uuid>) -> Result<Self, Error> {
        let fields = self
            .fields
            .iter()
            .map(|f| {
                let key_id = key_ids
                    .get(&f.path)
                    .copied()
                    .ok_or_else(|| Error::InvalidSchema(format!("no key bound for {}", f.path)))?;
                Ok(EncryptedFieldSpec { key_id: Some(key_id), ..f.clone() })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self { fields })
    }
}

/// Handle to a provisioned encrypted collection.
///
/// Cheap to clone; the schema is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionHandle {
    namespace: Namespace,
    schema: Arc<EncryptedCollectionSchema>,
    master_key: MasterKeyRef,
}

impl CollectionHandle {
    pub(crate) fn new(
        namespace: Namespace,
        schema: EncryptedCollectionSchema,
        master_key: MasterKeyRef,
    ) -> Self {
        Self { namespace, schema: Arc::new(schema), master_key }
    }

    /// Returns the collection namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the provisioned schema, with key ids bound.
    #[must_use]
    pub fn schema(&self) -> &EncryptedCollectionSchema {
        &self.schema
    }

    /// Returns the master key protecting this collection's DEKs.
    #[must_use]
    pub const fn master_key(&self) -> &MasterKeyRef {
        &self.master_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> FieldPath {
        FieldPath::new(p).unwrap()
    }

    fn card_schema() -> EncryptedCollectionSchema {
        EncryptedCollectionSchema::new(vec![EncryptedFieldSpec::new(
            path("credit_card.number"),
            FieldType::String,
        )
        .with_query(QueryType::Equality)])
        .unwrap()
    }

    #[test]
    fn test_schema_serde_shape() {
        let json = json!({
            "fields": [
                {"path": "credit_card.number", "bsonType": "string", "queries": [{"queryType": "equality"}]}
            ]
        });
        let schema: EncryptedCollectionSchema = serde_json::from_value(json).unwrap();
        assert_eq!(schema, card_schema());
        assert_eq!(schema.fields()[0].query_type(), Some(QueryType::Equality));
    }

    #[test]
    fn test_schema_rejects_duplicates_and_overlaps() {
        let dup = EncryptedCollectionSchema::new(vec![
            EncryptedFieldSpec::new(path("ssn"), FieldType::String),
            EncryptedFieldSpec::new(path("ssn"), FieldType::String),
        ]);
        assert!(matches!(dup, Err(Error::InvalidSchema(_))));

        let overlap = EncryptedCollectionSchema::new(vec![
            EncryptedFieldSpec::new(path("credit_card"), FieldType::String),
            EncryptedFieldSpec::new(path("credit_card.number"), FieldType::String),
        ]);
        assert!(matches!(overlap, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_schema_rejects_empty() {
        assert!(EncryptedCollectionSchema::new(Vec::new()).is_err());
    }

    #[test]
    fn test_equality_not_allowed_on_double() {
        let result = EncryptedCollectionSchema::new(vec![EncryptedFieldSpec::new(
            path("balance"),
            FieldType::Double,
        )
        .with_query(QueryType::Equality)]);
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_covers() {
        let schema = card_schema();
        assert!(schema.covers(&path("credit_card.number")));
        assert!(schema.covers(&path("credit_card")));
        assert!(!schema.covers(&path("user_name")));
    }

    #[test]
    fn test_same_declaration_ignores_key_ids() {
        let schema = card_schema();
        let mut ids = HashMap::new();
        ids.insert(path("credit_card.number"), Uuid::new_v4());
        let bound = schema.bind_key_ids(&ids).unwrap();

        assert_ne!(bound, schema);
        assert!(bound.same_declaration(&schema));
        assert!(bound.fields()[0].key_id().is_some());
    }

    #[test]
    fn test_bind_key_ids_requires_every_field() {
        let schema = card_schema();
        assert!(schema.bind_key_ids(&HashMap::new()).is_err());
    }

    #[test]
    fn test_field_type_codec() {
        let cases = [
            (FieldType::String, json!("1111-1111-1111-1111")),
            (FieldType::Int, json!(42)),
            (FieldType::Long, json!(12_345_678_901_i64)),
            (FieldType::Double, json!(1.5)),
            (FieldType::Bool, json!(true)),
        ];
        for (ty, value) in cases {
            let bytes = ty.encode(&value).unwrap();
            assert_eq!(ty.decode(&bytes).unwrap(), value);
            assert_eq!(FieldType::from_u8(ty.as_u8()), Some(ty));
        }
    }

    #[test]
    fn test_field_type_rejects_mismatch() {
        assert!(FieldType::String.encode(&json!(5)).is_err());
        assert!(FieldType::Int.encode(&json!(i64::MAX)).is_err());
        assert!(FieldType::Bool.decode(&[7]).is_err());
    }
}
