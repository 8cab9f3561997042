//! `FieldSeal` CLI: key generation, collection provisioning and
//! extract-then-ingest of card numbers.

#![warn(clippy::pedantic, clippy::nursery)]

mod ollama;
mod settings;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fieldseal::client::FieldSealClient;
use fieldseal::extract::{CancellationFlag, ExtractionOutcome};
use fieldseal::ingest::{IngestDocument, InsertOutcome};
use fieldseal::store::Document;
use fieldseal_key_file::LocalKms;
use ollama::{OllamaExtractor, PromptStyle};
use settings::Settings;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fieldseal")]
#[command(about = "Client-side field-level encryption pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a local master key
    Keygen {
        /// Output directory for the key file
        #[arg(short, long, default_value = "./keys")]
        output: PathBuf,
    },
    /// Create the encrypted collection and its data keys
    Provision {
        #[command(flatten)]
        settings: Settings,
    },
    /// Extract a card number from text and store it encrypted
    Ingest {
        #[command(flatten)]
        settings: Settings,
        /// Free text containing the card number
        #[arg(long)]
        text: String,
        /// Plaintext user name stored alongside
        #[arg(long, default_value = "John G")]
        user_name: String,
        /// Plaintext user id stored alongside
        #[arg(long, default_value_t = 12_345_678)]
        user_id: u64,
        /// System prompt variant
        #[arg(long, value_enum, default_value_t = PromptStyle::Primary)]
        prompt: PromptStyle,
        /// Ollama server
        #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
        ollama_url: String,
        /// Ollama model
        #[arg(long, env = "OLLAMA_MODEL", default_value = "llama3.1")]
        ollama_model: String,
    },
    /// Look up a stored record by card number
    Find {
        #[command(flatten)]
        settings: Settings,
        /// Card number to look up
        #[arg(long)]
        value: String,
    },
}

/// Expected, non-error endings of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    ExtractionFailed,
    Duplicate,
    NotFound,
}

impl Outcome {
    const fn code(self) -> u8 {
        match self {
            Self::Done => 0,
            Self::ExtractionFailed => 2,
            Self::Duplicate | Self::NotFound => 3,
        }
    }
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        Self::from(outcome.code())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(outcome) => outcome.into(),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    match cli.command {
        Commands::Keygen { output } => {
            let path = LocalKms::init(&output).context("failed to generate local master key")?;
            println!("Local master key written to {}", path.display());
            println!("Export it with: export FIELDSEAL_LOCAL_MASTER_KEY=$(cat {})", path.display());
            Ok(Outcome::Done)
        }
        Commands::Provision { settings } => {
            let client = settings.connect(None).await?;
            let provisioned = client.provision().await.context("failed to provision collection")?;
            if provisioned.is_created() {
                println!("Encrypted collection {} created", client.config().namespace);
            } else {
                println!("Encrypted collection {} already exists", client.config().namespace);
            }
            client.shutdown();
            Ok(Outcome::Done)
        }
        Commands::Ingest { settings, text, user_name, user_id, prompt, ollama_url, ollama_model } => {
            let timeout = settings.attempt_timeout();
            let extractor = OllamaExtractor::new(&ollama_url, ollama_model, prompt, timeout)
                .context("failed to build Ollama client")?;
            let client = settings.connect(Some(Arc::new(extractor))).await?;
            let outcome = ingest(&client, &text, &user_name, user_id).await;
            client.shutdown();
            outcome
        }
        Commands::Find { settings, value } => {
            let client = settings.connect(None).await?;
            let outcome = find(&client, &value).await;
            client.shutdown();
            outcome
        }
    }
}

async fn ingest(client: &FieldSealClient, text: &str, user_name: &str, user_id: u64) -> Result<Outcome> {
    let coordinator = client.coordinator().await.context("failed to open encrypted collection")?;

    let card = match client.extract(text, &CancellationFlag::new()).await? {
        ExtractionOutcome::Validated { value, attempts } => {
            info!(attempts, "extracted a valid card number");
            value
        }
        ExtractionOutcome::Failed(failure) => {
            warn!(
                attempts = failure.attempts,
                "{failure}; try the backup prompt (--prompt backup) or a different model"
            );
            return Ok(Outcome::ExtractionFailed);
        }
    };

    let dedup_path = client.config().dedup_path.clone();
    let document = IngestDocument::new()
        .with_metadata("user_name".parse()?, user_name)
        .with_metadata("user_id".parse()?, user_id)
        .with_sensitive(dedup_path, card.clone());

    match coordinator.insert_if_absent(document).await.context("failed to store document")? {
        InsertOutcome::Inserted(id) => info!(id = %id, "document stored"),
        InsertOutcome::AlreadyExists { existing } => {
            info!(existing = ?existing, "document with the same card number already exists");
            return Ok(Outcome::Duplicate);
        }
    }

    let stored = coordinator
        .find_by_dedup(&card)
        .await
        .context("failed to read back stored document")?
        .context("stored document not found")?;
    print_document(&stored)?;
    Ok(Outcome::Done)
}

async fn find(client: &FieldSealClient, value: &str) -> Result<Outcome> {
    let Some(card) = client.config().validator()?.validate(value) else {
        bail!("{value:?} does not look like a card number");
    };
    let coordinator = client.open_coordinator().await.context("failed to open encrypted collection")?;
    match coordinator.find_by_dedup(&card).await? {
        Some(document) => {
            print_document(&document)?;
            Ok(Outcome::Done)
        }
        None => {
            info!("no document holds this card number");
            Ok(Outcome::NotFound)
        }
    }
}

fn print_document(document: &Document) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(document)?);
    Ok(())
}
