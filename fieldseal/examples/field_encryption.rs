//! Deterministic and randomized encryption of a single field.

use fieldseal::memory::MemoryKeyVault;
use fieldseal::prelude::*;
use fieldseal_key_file::LocalKms;
use secrecy::SecretVec;
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("FieldSeal Field Encryption Example");
    println!("==================================\n");

    let kms = LocalKms::new(SecretVec::new(vec![7u8; 32]))?;
    let provider = EncryptionProvider::new(Arc::new(kms), Arc::new(MemoryKeyVault::default()), Timeouts::default());

    let context = FieldContext::new("shop.customers".parse()?, "credit_card.number".parse()?);
    let key = provider.resolve_key(&context, &MasterKeyRef::local()).await?;
    println!("Data key {} for {context}\n", key.id());

    let value = json!("1111-1111-1111-1111");

    // Equality fields: same input, same ciphertext
    let a = provider.encrypt_field(&value, &key, Some(QueryType::Equality), FieldType::String)?;
    let b = provider.encrypt_field(&value, &key, Some(QueryType::Equality), FieldType::String)?;
    println!("Deterministic:");
    println!("  {}", a.to_value());
    println!("  {}", b.to_value());
    println!("  equal: {}\n", a == b);

    // Other fields: a fresh nonce every time
    let c = provider.encrypt_field(&value, &key, None, FieldType::String)?;
    let d = provider.encrypt_field(&value, &key, None, FieldType::String)?;
    println!("Randomized:");
    println!("  {}", c.to_value());
    println!("  {}", d.to_value());
    println!("  equal: {}\n", c == d);

    println!("Decrypted: {}", provider.decrypt_field(&c, &key)?);
    Ok(())
}
