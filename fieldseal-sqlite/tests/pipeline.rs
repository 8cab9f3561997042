//! End-to-end runs of the pipeline on a `SQLite` file.

use fieldseal::config::card_number_schema;
use fieldseal::context::{FieldPath, KeyVaultNamespace, Namespace};
use fieldseal::extract::{PatternValidator, ValidatedSensitiveValue};
use fieldseal::ingest::{IngestDocument, IngestionCoordinator, InsertOutcome};
use fieldseal::kms::MasterKeyRef;
use fieldseal::provider::EncryptionProvider;
use fieldseal::registrar::SchemaRegistrar;
use fieldseal::store::DocumentStore;
use fieldseal::timeout::Timeouts;
use fieldseal_key_file::LocalKms;
use fieldseal_sqlite::SqliteDatabase;
use secrecy::SecretVec;
use std::path::Path;
use std::sync::Arc;

const CARD: &str = "1111-1111-1111-1111";

fn namespace() -> Namespace {
    "mongodb-qe-genai.user_accounts".parse().unwrap()
}

fn dedup_path() -> FieldPath {
    FieldPath::new("credit_card.number").unwrap()
}

fn card(value: &str) -> ValidatedSensitiveValue {
    PatternValidator::card_number().validate(value).unwrap()
}

async fn pipeline(path: &Path, master: &[u8; 32]) -> IngestionCoordinator {
    let db = SqliteDatabase::open(path).unwrap();
    let kms = Arc::new(LocalKms::new(SecretVec::new(master.to_vec())).unwrap());
    let store: Arc<dyn DocumentStore> = Arc::new(db.document_store());
    let provider = Arc::new(EncryptionProvider::new(
        kms,
        Arc::new(db.key_vault(KeyVaultNamespace::default())),
        Timeouts::default(),
    ));

    let registrar = SchemaRegistrar::new(Arc::clone(&provider), Arc::clone(&store));
    let handle = registrar
        .provision_collection(&namespace(), &card_number_schema(dedup_path()), &MasterKeyRef::local())
        .await
        .unwrap()
        .into_inner();
    IngestionCoordinator::new(provider, store, handle, dedup_path()).await.unwrap()
}

#[tokio::test]
async fn test_documents_and_keys_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldseal.db");
    let master = [42u8; 32];

    {
        let coordinator = pipeline(&path, &master).await;
        let doc = IngestDocument::new()
            .with_metadata(FieldPath::new("user.name").unwrap(), "Ada")
            .with_sensitive(dedup_path(), card(CARD));
        assert!(coordinator.insert_if_absent(doc).await.unwrap().is_inserted());
    }

    let coordinator = pipeline(&path, &master).await;
    let found = coordinator.find_by_dedup(&card(CARD)).await.unwrap().unwrap();
    assert_eq!(found["credit_card"]["number"], CARD);
    assert_eq!(found["user"]["name"], "Ada");

    let again = IngestDocument::new().with_sensitive(dedup_path(), card(CARD));
    let outcome = coordinator.insert_if_absent(again).await.unwrap();
    assert!(matches!(outcome, InsertOutcome::AlreadyExists { existing: Some(_) }));
    assert_eq!(coordinator.count_by_dedup(&card(CARD)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_wrong_master_key_cannot_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldseal.db");

    let coordinator = pipeline(&path, &[1u8; 32]).await;
    let doc = IngestDocument::new().with_sensitive(dedup_path(), card(CARD));
    coordinator.insert_if_absent(doc).await.unwrap();
    drop(coordinator);

    let db = SqliteDatabase::open(&path).unwrap();
    let kms = Arc::new(LocalKms::new(SecretVec::new(vec![2u8; 32])).unwrap());
    let store: Arc<dyn DocumentStore> = Arc::new(db.document_store());
    let provider = Arc::new(EncryptionProvider::new(
        kms,
        Arc::new(db.key_vault(KeyVaultNamespace::default())),
        Timeouts::default(),
    ));
    let registrar = SchemaRegistrar::new(Arc::clone(&provider), Arc::clone(&store));

    let result = registrar.open_collection(&namespace(), &MasterKeyRef::local()).await;
    let handle = result.unwrap();
    let coordinator = IngestionCoordinator::new(provider, store, handle, dedup_path()).await.unwrap();
    let err = coordinator.find_by_dedup(&card(CARD)).await.unwrap_err();
    assert!(matches!(err, fieldseal::error::Error::KeyResolution { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_store_one_document() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(pipeline(&dir.path().join("fieldseal.db"), &[7u8; 32]).await);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let doc = IngestDocument::new().with_sensitive(dedup_path(), card(CARD));
                coordinator.insert_if_absent(doc).await.unwrap()
            })
        })
        .collect();

    let mut inserted = 0;
    for task in tasks {
        if task.await.unwrap().is_inserted() {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(coordinator.count_by_dedup(&card(CARD)).await.unwrap(), 1);
}
