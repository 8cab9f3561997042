//! Encryption provider: DEK resolution through the KMS and key vault, and
//! field-level encryption with a resolved DEK.
//!
//! Resolved DEKs are cached per (collection, field) for a bounded time. The
//! cache is populated at most once per key within the process: concurrent
//! callers wait on the same cell instead of racing to unwrap or create. A
//! failed population leaves the cell empty, so the next caller retries.

use crate::context::FieldContext;
use crate::deterministic::DeterministicCipher;
use crate::error::Error;
use crate::header::{EncryptionHeader, HeaderFlags};
use crate::kdf::{derive_randomized_key, generate_dek, DEK_SIZE};
use crate::key_vault::{DekRecord, KeyVaultStore};
use crate::kms::{KmsClient, MasterKeyRef};
use crate::randomized::RandomizedCipher;
use crate::schema::{FieldType, QueryType};
use crate::store::CreateOutcome;
use crate::timeout::{with_timeout, Timeouts};
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretVec};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Key under which a ciphertext is stored inside a document.
pub const ENCRYPTED_TAG: &str = "$encrypted";

/// Default lifetime of a cached DEK.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// An unwrapped data encryption key, bound to one (collection, field) pair.
///
/// The key material is zeroized when the last reference is dropped.
pub struct DataEncryptionKey {
    id: Uuid,
    context: FieldContext,
    material: SecretVec<u8>,
}

impl DataEncryptionKey {
    /// Returns the DEK id stored in every ciphertext it produces.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the field this key belongs to.
    #[must_use]
    pub const fn context(&self) -> &FieldContext {
        &self.context
    }

    fn duplicate_material(&self) -> SecretVec<u8> {
        SecretVec::new(self.material.expose_secret().to_vec())
    }
}

impl fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataEncryptionKey")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// An encrypted field value: envelope header followed by the payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Ciphertext(Vec<u8>);

impl Ciphertext {
    /// Wraps raw envelope bytes.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw envelope bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses the envelope header.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHeader` or `Error::UnsupportedVersion`.
    pub fn header(&self) -> Result<EncryptionHeader, Error> {
        EncryptionHeader::from_bytes(&self.0).map(|(header, _)| header)
    }

    /// Document representation: `{"$encrypted": "<base64>"}`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(ENCRYPTED_TAG.to_string(), Value::String(STANDARD.encode(&self.0)));
        Value::Object(map)
    }

    /// Reads the document representation back.
    ///
    /// Returns `None` if `value` is not an encrypted value.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        let encoded = object.get(ENCRYPTED_TAG)?.as_str()?;
        STANDARD.decode(encoded).ok().map(Self)
    }
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ciphertext(<{} bytes>)", self.0.len())
    }
}

struct CachedKey {
    key: Arc<DataEncryptionKey>,
    loaded_at: Instant,
}

impl CachedKey {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() >= ttl
    }
}

type Slot = Arc<OnceCell<CachedKey>>;

/// Resolves DEKs and encrypts or decrypts single field values.
pub struct EncryptionProvider {
    kms: Arc<dyn KmsClient>,
    key_vault: Arc<dyn KeyVaultStore>,
    timeouts: Timeouts,
    cache_ttl: Duration,
    cache: RwLock<HashMap<FieldContext, Slot>>,
}

impl EncryptionProvider {
    /// Creates a provider with the default cache TTL.
    #[must_use]
    pub fn new(kms: Arc<dyn KmsClient>, key_vault: Arc<dyn KeyVaultStore>, timeouts: Timeouts) -> Self {
        Self { kms, key_vault, timeouts, cache_ttl: DEFAULT_CACHE_TTL, cache: RwLock::new(HashMap::new()) }
    }

    /// Sets how long a resolved DEK stays cached.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Returns the configured collaborator timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Returns the key vault DEKs are resolved through.
    #[must_use]
    pub fn key_vault(&self) -> &Arc<dyn KeyVaultStore> {
        &self.key_vault
    }

    /// Returns the DEK of a field, creating and wrapping one on first use.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyResolution` if the KMS rejects the master key or
    /// the key vault fails, and `Error::Timeout` if either exceeds its
    /// timeout.
    pub async fn resolve_key(
        &self,
        context: &FieldContext,
        master_key: &MasterKeyRef,
    ) -> Result<Arc<DataEncryptionKey>, Error> {
        self.resolve_key_tracked(context, master_key).await.map(CreateOutcome::into_inner)
    }

    /// Like [`EncryptionProvider::resolve_key`], also reporting whether this
    /// call stored a new DEK in the key vault.
    ///
    /// # Errors
    ///
    /// See [`EncryptionProvider::resolve_key`].
    pub async fn resolve_key_tracked(
        &self,
        context: &FieldContext,
        master_key: &MasterKeyRef,
    ) -> Result<CreateOutcome<Arc<DataEncryptionKey>>, Error> {
        let slot = self.slot(context);
        let created = AtomicBool::new(false);

        let cached = slot
            .get_or_try_init(|| async {
                let (key, was_created) = self.load_or_create(context, master_key).await?;
                created.store(was_created, Ordering::Release);
                Ok::<_, Error>(CachedKey { key: Arc::new(key), loaded_at: Instant::now() })
            })
            .await?;

        let key = Arc::clone(&cached.key);
        if created.load(Ordering::Acquire) {
            Ok(CreateOutcome::Created(key))
        } else {
            Ok(CreateOutcome::AlreadyExists(key))
        }
    }

    /// Resolves a DEK by id, checking that it belongs to `context`.
    ///
    /// Used to decrypt values whose envelope names the key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyResolution` if no such key exists, it belongs to
    /// another field, or unwrapping fails; `Error::Timeout` on timeouts.
    pub async fn key_for_id(
        &self,
        id: Uuid,
        context: &FieldContext,
    ) -> Result<Arc<DataEncryptionKey>, Error> {
        let cached = self.cache.read().get(context).and_then(|slot| {
            slot.get()
                .filter(|c| c.key.id == id && !c.is_expired(self.cache_ttl))
                .map(|c| Arc::clone(&c.key))
        });
        if let Some(key) = cached {
            return Ok(key);
        }

        let record = with_timeout("key_vault.find_by_id", self.timeouts.key_vault, self.key_vault.find_by_id(id))
            .await?
            .map_err(|e| Error::key_resolution(context, e))?
            .ok_or_else(|| Error::key_resolution(context, format!("no data key with id {id}")))?;

        if record.key_alt_name() != context.key_alt_name() {
            return Err(Error::key_resolution(
                context,
                format!("data key {id} belongs to {}", record.key_alt_name()),
            ));
        }

        let material = self.unwrap_record(context, &record).await?;
        Ok(Arc::new(DataEncryptionKey { id, context: context.clone(), material }))
    }

    /// Drops the cached DEK of one field.
    pub fn evict(&self, context: &FieldContext) {
        if self.cache.write().remove(context).is_some() {
            debug!(context = %context, "evicted cached data key");
        }
    }

    /// Drops every cached DEK. Key material is zeroized once no caller
    /// still holds it.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.write();
        let evicted = cache.len();
        cache.clear();
        drop(cache);
        debug!(evicted, "cleared data key cache");
    }

    /// Encrypts one field value.
    ///
    /// `Some(QueryType::Equality)` produces deterministic ciphertext usable
    /// for equality lookups; `None` produces randomized ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDocument` if `value` does not match
    /// `field_type`, or `Error::Encryption` if the cipher fails.
    #[allow(clippy::unused_self)]
    pub fn encrypt_field(
        &self,
        value: &Value,
        key: &DataEncryptionKey,
        query_type: Option<QueryType>,
        field_type: FieldType,
    ) -> Result<Ciphertext, Error> {
        let plaintext = field_type.encode(value)?;
        let aad = associated_data(&key.context, field_type);

        let (header, payload) = match query_type {
            Some(QueryType::Equality) => {
                let cipher = DeterministicCipher::new(key.duplicate_material())?;
                let payload = cipher.encrypt(&plaintext, aad.as_bytes())?;
                let flags = HeaderFlags::empty().with_deterministic();
                (EncryptionHeader::new(flags, key.id, field_type, Vec::new()), payload)
            }
            None => {
                let cipher = RandomizedCipher::new(derive_randomized_key(&key.material, &key.context)?)?;
                let (nonce, payload) = cipher.encrypt(&plaintext, aad.as_bytes())?;
                (EncryptionHeader::new(HeaderFlags::empty(), key.id, field_type, nonce.to_vec()), payload)
            }
        };

        let mut bytes = header.to_bytes()?;
        bytes.extend_from_slice(&payload);
        Ok(Ciphertext(bytes))
    }

    /// Decrypts one field value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` if the ciphertext was made with a different
    /// key, `Error::AuthenticationFailed` if it is corrupted or bound to
    /// another field, or a header error if the envelope is malformed.
    #[allow(clippy::unused_self)]
    pub fn decrypt_field(&self, ciphertext: &Ciphertext, key: &DataEncryptionKey) -> Result<Value, Error> {
        let (header, consumed) = EncryptionHeader::from_bytes(&ciphertext.0)?;
        if header.key_id() != key.id {
            return Err(Error::Decryption(format!(
                "ciphertext was encrypted with data key {}, not {}",
                header.key_id(),
                key.id
            )));
        }

        let payload = &ciphertext.0[consumed..];
        let aad = associated_data(&key.context, header.value_type());

        let plaintext = zeroize::Zeroizing::new(if header.flags().is_deterministic() {
            DeterministicCipher::new(key.duplicate_material())?.decrypt(payload, aad.as_bytes())?
        } else {
            RandomizedCipher::new(derive_randomized_key(&key.material, &key.context)?)?.decrypt(
                header.nonce(),
                payload,
                aad.as_bytes(),
            )?
        });

        header.value_type().decode(&plaintext)
    }

    fn slot(&self, context: &FieldContext) -> Slot {
        if let Some(slot) = self.cache.read().get(context) {
            if !slot.get().is_some_and(|c| c.is_expired(self.cache_ttl)) {
                return Arc::clone(slot);
            }
        }

        let mut cache = self.cache.write();
        let slot = cache.entry(context.clone()).or_default();
        if slot.get().is_some_and(|c| c.is_expired(self.cache_ttl)) {
            debug!(context = %context, "cached data key expired");
            *slot = Slot::default();
        }
        Arc::clone(slot)
    }

    async fn load_or_create(
        &self,
        context: &FieldContext,
        master_key: &MasterKeyRef,
    ) -> Result<(DataEncryptionKey, bool), Error> {
        let alt_name = context.key_alt_name();
        let existing = with_timeout(
            "key_vault.find_by_alt_name",
            self.timeouts.key_vault,
            self.key_vault.find_by_alt_name(&alt_name),
        )
        .await?
        .map_err(|e| Error::key_resolution(context, e))?;

        let record = if let Some(record) = existing {
            record
        } else {
            self.kms.ensure_provider(master_key).map_err(|e| Error::key_resolution(context, e))?;
            let material = generate_dek();
            let wrapped = with_timeout("kms.wrap", self.timeouts.kms, self.kms.wrap(master_key, &material))
                .await?
                .map_err(|e| Error::key_resolution(context, e))?;

            let record = DekRecord::new(context, wrapped, master_key.clone());
            let stored = with_timeout(
                "key_vault.insert",
                self.timeouts.key_vault,
                self.key_vault.insert_if_absent(record),
            )
            .await?
            .map_err(|e| Error::key_resolution(context, e))?;

            match stored {
                CreateOutcome::Created(record) => {
                    info!(context = %context, key_id = %record.id(), master_key = %master_key, "created data key");
                    let key = DataEncryptionKey { id: record.id(), context: context.clone(), material };
                    return Ok((key, true));
                }
                CreateOutcome::AlreadyExists(winner) => {
                    debug!(context = %context, key_id = %winner.id(), "adopted concurrently created data key");
                    winner
                }
            }
        };

        let material = self.unwrap_record(context, &record).await?;
        debug!(context = %context, key_id = %record.id(), "resolved data key");
        Ok((DataEncryptionKey { id: record.id(), context: context.clone(), material }, false))
    }

    async fn unwrap_record(&self, context: &FieldContext, record: &DekRecord) -> Result<SecretVec<u8>, Error> {
        self.kms.ensure_provider(record.master_key()).map_err(|e| Error::key_resolution(context, e))?;
        let material = with_timeout(
            "kms.unwrap",
            self.timeouts.kms,
            self.kms.unwrap(record.master_key(), record.wrapped_key()),
        )
        .await?
        .map_err(|e| Error::key_resolution(context, e))?;

        let actual = material.expose_secret().len();
        if actual != DEK_SIZE {
            return Err(Error::key_resolution(
                context,
                Error::InvalidKeyLength { expected: DEK_SIZE, actual },
            ));
        }
        Ok(material)
    }
}

impl fmt::Debug for EncryptionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionProvider")
            .field("kms", &self.kms.provider())
            .field("key_vault", self.key_vault.namespace())
            .field("timeouts", &self.timeouts)
            .field("cache_ttl", &self.cache_ttl)
            .field("cached_keys", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

/// Associated data binding a ciphertext to its field and declared type.
fn associated_data(context: &FieldContext, field_type: FieldType) -> String {
    format!("{}|{}|{}", context.namespace(), context.path(), field_type.as_u8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FieldPath;
    use crate::memory::MemoryKeyVault;
    use crate::testing::MockKms;
    use proptest::prelude::*;
    use serde_json::json;

    fn ctx(path: &str) -> FieldContext {
        FieldContext::new("qe.users".parse().unwrap(), FieldPath::new(path).unwrap())
    }

    fn provider(kms: Arc<MockKms>, vault: Arc<MemoryKeyVault>) -> EncryptionProvider {
        EncryptionProvider::new(kms, vault, Timeouts::default())
    }

    fn fixture() -> (EncryptionProvider, Arc<MockKms>, Arc<MemoryKeyVault>) {
        let kms = Arc::new(MockKms::new());
        let vault = Arc::new(MemoryKeyVault::default());
        (provider(Arc::clone(&kms), Arc::clone(&vault)), kms, vault)
    }

    #[tokio::test]
    async fn test_resolve_creates_once_and_caches() {
        let (provider, kms, vault) = fixture();
        let first = provider.resolve_key_tracked(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();
        assert!(first.is_created());

        let second = provider.resolve_key_tracked(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(first.get().id(), second.get().id());

        assert_eq!(vault.len(), 1);
        assert_eq!(kms.wrap_calls(), 1);
        assert_eq!(kms.unwrap_calls(), 0);
    }

    #[tokio::test]
    async fn test_existing_key_is_unwrapped_from_vault() {
        let (provider, kms, vault) = fixture();
        let id = provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap().id();

        let fresh = self::provider(Arc::clone(&kms), Arc::clone(&vault));
        let outcome = fresh.resolve_key_tracked(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();
        assert!(!outcome.is_created());
        assert_eq!(outcome.get().id(), id);
        assert_eq!(kms.unwrap_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolution_populates_once() {
        let (provider, kms, vault) = fixture();
        let provider = Arc::new(provider);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let provider = Arc::clone(&provider);
                tokio::spawn(async move {
                    provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap().id()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(kms.wrap_calls(), 1);
        assert_eq!(vault.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_population_is_retried() {
        let (provider, kms, vault) = fixture();
        kms.fail_next_wrap();
        let err = provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap_err();
        assert!(matches!(err, Error::KeyResolution { .. }));
        assert!(vault.is_empty());

        provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();
        assert_eq!(vault.len(), 1);
    }

    #[tokio::test]
    async fn test_provider_mismatch_is_key_resolution_error() {
        let (provider, _, _) = fixture();
        let aws = MasterKeyRef::new(crate::kms::KmsProviderKind::Aws, "arn:aws:kms:key");
        let err = provider.resolve_key(&ctx("ssn"), &aws).await.unwrap_err();
        assert!(matches!(err, Error::KeyResolution { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_kms_times_out() {
        let kms = Arc::new(MockKms::new().with_delay(Duration::from_secs(30)));
        let vault = Arc::new(MemoryKeyVault::default());
        let provider = EncryptionProvider::new(kms, vault, Timeouts::uniform(Duration::from_millis(100)));

        let err = provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "kms.wrap", .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_reloaded() {
        let (provider, kms, _) = fixture();
        let provider = provider.with_cache_ttl(Duration::from_secs(1));
        provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();
        assert_eq!(kms.unwrap_calls(), 1);
    }

    #[tokio::test]
    async fn test_evict_forces_reload() {
        let (provider, kms, _) = fixture();
        provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();
        provider.evict(&ctx("ssn"));
        provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();
        assert_eq!(kms.unwrap_calls(), 1);

        provider.clear_cache();
        provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();
        assert_eq!(kms.unwrap_calls(), 2);
    }

    #[tokio::test]
    async fn test_key_for_id_checks_field_binding() {
        let (provider, _, _) = fixture();
        let key = provider.resolve_key(&ctx("ssn"), &MasterKeyRef::local()).await.unwrap();

        let same = provider.key_for_id(key.id(), &ctx("ssn")).await.unwrap();
        assert_eq!(same.id(), key.id());

        let err = provider.key_for_id(key.id(), &ctx("email")).await.unwrap_err();
        assert!(matches!(err, Error::KeyResolution { .. }));

        let err = provider.key_for_id(Uuid::new_v4(), &ctx("ssn")).await.unwrap_err();
        assert!(matches!(err, Error::KeyResolution { .. }));
    }

    #[tokio::test]
    async fn test_equality_encryption_is_deterministic() {
        let (provider, _, _) = fixture();
        let key = provider.resolve_key(&ctx("card"), &MasterKeyRef::local()).await.unwrap();
        let eq = Some(QueryType::Equality);

        let a = provider.encrypt_field(&json!("1111-1111-1111-1111"), &key, eq, FieldType::String).unwrap();
        let b = provider.encrypt_field(&json!("1111-1111-1111-1111"), &key, eq, FieldType::String).unwrap();
        let c = provider.encrypt_field(&json!("2222-2222-2222-2222"), &key, eq, FieldType::String).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.header().unwrap().flags().is_deterministic());
    }

    #[tokio::test]
    async fn test_randomized_encryption_differs_each_time() {
        let (provider, _, _) = fixture();
        let key = provider.resolve_key(&ctx("name"), &MasterKeyRef::local()).await.unwrap();

        let a = provider.encrypt_field(&json!("John G"), &key, None, FieldType::String).unwrap();
        let b = provider.encrypt_field(&json!("John G"), &key, None, FieldType::String).unwrap();
        assert_ne!(a, b);
        assert_eq!(provider.decrypt_field(&a, &key).unwrap(), json!("John G"));
        assert_eq!(provider.decrypt_field(&b, &key).unwrap(), json!("John G"));
    }

    #[tokio::test]
    async fn test_decrypt_with_other_key_fails() {
        let (provider, _, _) = fixture();
        let card = provider.resolve_key(&ctx("card"), &MasterKeyRef::local()).await.unwrap();
        let name = provider.resolve_key(&ctx("name"), &MasterKeyRef::local()).await.unwrap();

        let ct = provider
            .encrypt_field(&json!("1111-1111-1111-1111"), &card, Some(QueryType::Equality), FieldType::String)
            .unwrap();
        let err = provider.decrypt_field(&ct, &name).unwrap_err();
        assert!(err.is_decryption_failure());
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let (provider, _, _) = fixture();
        let key = provider.resolve_key(&ctx("card"), &MasterKeyRef::local()).await.unwrap();
        let ct = provider.encrypt_field(&json!(42), &key, None, FieldType::Int).unwrap();

        let mut bytes = ct.as_bytes().to_vec();
        if let Some(last) = bytes.last_mut() {
            *last ^= 0x01;
        }
        let err = provider.decrypt_field(&Ciphertext::from_bytes(bytes), &key).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed));
    }

    #[test]
    fn test_ciphertext_document_form() {
        let ct = Ciphertext::from_bytes(vec![1, 2, 3]);
        let value = ct.to_value();
        assert_eq!(value, json!({"$encrypted": "AQID"}));
        assert_eq!(Ciphertext::from_value(&value), Some(ct));
        assert_eq!(Ciphertext::from_value(&json!("AQID")), None);
        assert_eq!(Ciphertext::from_value(&json!({"$encrypted": "AQID", "x": 1})), None);
    }

    #[tokio::test]
    async fn test_key_debug_is_redacted() {
        let (provider, _, _) = fixture();
        let key = provider.resolve_key(&ctx("card"), &MasterKeyRef::local()).await.unwrap();
        assert!(format!("{key:?}").contains("[REDACTED]"));
    }

    proptest! {
        #[test]
        fn prop_round_trip(value in ".{0,128}", equality in any::<bool>()) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (provider, _, _) = fixture();
            let key = runtime
                .block_on(provider.resolve_key(&ctx("card"), &MasterKeyRef::local()))
                .unwrap();
            let query = equality.then_some(QueryType::Equality);

            let ct = provider.encrypt_field(&json!(value), &key, query, FieldType::String).unwrap();
            prop_assert_eq!(provider.decrypt_field(&ct, &key).unwrap(), json!(value));
        }

        #[test]
        fn prop_equality_ciphertext_stable(value in any::<i64>()) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (provider, _, _) = fixture();
            let key = runtime
                .block_on(provider.resolve_key(&ctx("id"), &MasterKeyRef::local()))
                .unwrap();
            let eq = Some(QueryType::Equality);

            let a = provider.encrypt_field(&json!(value), &key, eq, FieldType::Long).unwrap();
            let b = provider.encrypt_field(&json!(value), &key, eq, FieldType::Long).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
