//! # `FieldSeal`
//!
//! Client-side field-level encryption for document collections, with
//! envelope-protected data keys, equality-queryable deterministic fields and
//! a bounded retry loop for extracting sensitive values from free text.
//!
//! ## Features
//!
//! - Envelope encryption: DEKs wrapped by a KMS master key, stored in a key vault
//! - Deterministic encryption (AES-SIV) for equality queries
//! - Randomized encryption (ChaCha20-Poly1305) for everything else
//! - Idempotent collection provisioning with key rollback on failure
//! - Deduplicating inserts keyed on an encrypted field
//! - Validated extraction with a finite attempt budget
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldseal::prelude::*;
//!
//! let client = FieldSealClient::builder(config)
//!     .kms(kms)
//!     .key_vault(key_vault)
//!     .document_store(store)
//!     .extractor(extractor)
//!     .build()?;
//!
//! let coordinator = client.coordinator().await?;
//! let outcome = client.extract(text, &CancellationFlag::new()).await?;
//! if let Some(card) = outcome.validated() {
//!     let doc = IngestDocument::new().with_sensitive(client.config().dedup_path.clone(), card);
//!     coordinator.insert_if_absent(doc).await?;
//! }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod context;
pub mod deterministic;
pub mod error;
pub mod extract;
pub mod header;
pub mod ingest;
pub mod kdf;
pub mod key_vault;
pub mod kms;
pub mod memory;
pub mod provider;
pub mod randomized;
pub mod registrar;
pub mod schema;
pub mod store;
pub mod timeout;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::client::{FieldSealClient, FieldSealClientBuilder};
    pub use crate::config::FieldSealConfig;
    pub use crate::context::{FieldContext, FieldPath, KeyVaultNamespace, Namespace};
    pub use crate::error::{Error, KmsError, StoreError};
    pub use crate::extract::{
        CancellationFlag, ExtractionController, ExtractionOutcome, ExtractionPolicy, Extractor, ExtractorError,
        PatternValidator, ValidatedSensitiveValue, Validator,
    };
    pub use crate::ingest::{IngestDocument, IngestionCoordinator, InsertOutcome};
    pub use crate::key_vault::{DekRecord, KeyVaultStore};
    pub use crate::kms::{KmsClient, KmsCredentials, KmsProviderKind, MasterKeyRef};
    pub use crate::provider::{Ciphertext, DataEncryptionKey, EncryptionProvider};
    pub use crate::registrar::{Provisioned, SchemaRegistrar};
    pub use crate::schema::{CollectionHandle, EncryptedCollectionSchema, EncryptedFieldSpec, FieldType, QueryType};
    pub use crate::store::{CreateOutcome, Document, DocumentId, DocumentStore};
    pub use crate::timeout::Timeouts;
}
