//! Naming types shared by every component: collection namespaces, field paths
//! and the (collection, field) context a data encryption key is bound to.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `database.collection` pair.
///
/// # Example
///
/// ```
/// use fieldseal::context::Namespace;
///
/// let ns: Namespace = "qe-genai.user_accounts".parse().unwrap();
/// assert_eq!(ns.database(), "qe-genai");
/// assert_eq!(ns.collection(), "user_accounts");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    /// Creates a namespace from its two parts.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if either part is empty or the database name
    /// contains a `.`.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Result<Self, Error> {
        let database = database.into();
        let collection = collection.into();
        if database.is_empty() || collection.is_empty() {
            return Err(Error::Config(format!(
                "namespace parts must be non-empty: {database:?}.{collection:?}"
            )));
        }
        if database.contains('.') {
            return Err(Error::Config(format!("database name may not contain '.': {database}")));
        }
        Ok(Self { database, collection })
    }

    /// Built-in namespaces known to be well formed.
    pub(crate) fn builtin(database: &'static str, collection: &'static str) -> Self {
        Self { database: database.to_string(), collection: collection.to_string() }
    }

    /// Returns the database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (database, collection) = s
            .split_once('.')
            .ok_or_else(|| Error::Config(format!("namespace must be database.collection: {s}")))?;
        Self::new(database, collection)
    }
}

impl TryFrom<String> for Namespace {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

/// The namespace holding wrapped data encryption keys.
///
/// There is exactly one per deployment; every DEK resolves through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVaultNamespace(Namespace);

impl KeyVaultNamespace {
    /// Wraps a namespace as the key vault location.
    #[must_use]
    pub const fn new(namespace: Namespace) -> Self {
        Self(namespace)
    }

    /// Returns the underlying namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.0
    }
}

impl Default for KeyVaultNamespace {
    fn default() -> Self {
        Self(Namespace::builtin("encryption", "__keyVault"))
    }
}

impl fmt::Display for KeyVaultNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for KeyVaultNamespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A dotted path into a document, e.g. `credit_card.number`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(String);

impl FieldPath {
    /// Parses and validates a dotted path.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` for empty segments or segments starting
    /// with `$`.
    pub fn new(path: impl Into<String>) -> Result<Self, Error> {
        let path = path.into();
        if path.split('.').any(|segment| segment.is_empty() || segment.starts_with('$')) {
            return Err(Error::InvalidSchema(format!("invalid field path: {path:?}")));
        }
        Ok(Self(path))
    }

    /// Built-in paths known to be well formed.
    pub(crate) fn builtin(path: &'static str) -> Self {
        Self(path.to_string())
    }

    /// Returns the path as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Returns `true` if `self` is a strict ancestor of `other`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'.'
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.0
    }
}

/// The (collection, field) pair a data encryption key belongs to.
///
/// Its display form `namespace|path` is the key's alternate name in the key
/// vault and the cache key in the encryption provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldContext {
    namespace: Namespace,
    path: FieldPath,
}

impl FieldContext {
    /// Creates a new field context.
    #[must_use]
    pub const fn new(namespace: Namespace, path: FieldPath) -> Self {
        Self { namespace, path }
    }

    /// Returns the collection namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the field path.
    #[must_use]
    pub const fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Returns the key vault alternate name for this field's DEK.
    #[must_use]
    pub fn key_alt_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FieldContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.namespace, self.path)
    }
}
