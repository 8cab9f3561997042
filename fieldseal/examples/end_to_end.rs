//! Extract a card number from free text, store it encrypted and read it back.

use async_trait::async_trait;
use fieldseal::kms::LocalCredentials;
use fieldseal::memory::{MemoryDocumentStore, MemoryKeyVault};
use fieldseal::prelude::*;
use fieldseal_key_file::LocalKms;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;

/// Stands in for a language model: returns the last whitespace-separated word.
struct LastWord;

#[async_trait]
impl Extractor for LastWord {
    async fn extract(&self, input: &str) -> Result<String, ExtractorError> {
        input
            .split_whitespace()
            .last()
            .map(str::to_string)
            .ok_or_else(|| ExtractorError::InvalidResponse("empty input".into()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("FieldSeal End-to-End Example");
    println!("============================\n");

    let key_dir = PathBuf::from("./example_keys");
    if !key_dir.join(fieldseal_key_file::MASTER_KEY_FILE).exists() {
        let path = LocalKms::init(&key_dir)?;
        println!("✓ Master key written to {}\n", path.display());
    }
    let kms = LocalKms::from_file(&key_dir)?;

    let config = FieldSealConfig {
        kms: Some(KmsCredentials::Local(LocalCredentials { key: SecretString::new(String::new()) })),
        ..FieldSealConfig::default()
    };
    let store = Arc::new(MemoryDocumentStore::new());
    let client = FieldSealClient::builder(config)
        .kms(Arc::new(kms))
        .key_vault(Arc::new(MemoryKeyVault::default()))
        .document_store(store.clone())
        .extractor(Arc::new(LastWord))
        .build()?;

    let text = "My credit card number is 1111-1111-1111-1111";
    println!("Input: {text}");
    let Some(card) = client.extract(text, &CancellationFlag::new()).await?.validated() else {
        println!("✗ No card number found");
        return Ok(());
    };
    println!("✓ Extracted a valid card number\n");

    let coordinator = client.coordinator().await?;
    let document = IngestDocument::new()
        .with_metadata("user_name".parse()?, "John G")
        .with_metadata("user_id".parse()?, 12_345_678)
        .with_sensitive(client.config().dedup_path.clone(), card.clone());

    for round in 1..=2 {
        match coordinator.insert_if_absent(document.clone()).await? {
            InsertOutcome::Inserted(id) => println!("✓ Round {round}: inserted {id}"),
            InsertOutcome::AlreadyExists { .. } => println!("✓ Round {round}: already stored, skipped"),
        }
    }

    println!("\nStored (encrypted):");
    for doc in store.documents(&client.config().namespace) {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    }

    if let Some(found) = coordinator.find_by_dedup(&card).await? {
        println!("\nRead back (decrypted):");
        println!("{}", serde_json::to_string_pretty(&found)?);
    }

    client.shutdown();
    Ok(())
}
