//! # doc-rag CLI (`docrag`)
//!
//! ## Usage
//!
//! ```bash
//! docrag --config ./config/docrag.toml <command>
//! ```
//!
//! The config path may also be given through `APP_CONFIG`.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag init` | Create the vector store and the configured collection |
//! | `docrag serve` | Start the HTTP API |
//! | `docrag ask "<question>"` | Retrieve and answer with citations |
//! | `docrag retrieve "<question>"` | Show the chunks retrieval would use |
//! | `docrag ingest <rel_path>` | Ingest a file from the data repository |
//! | `docrag files` | List raw files |
//! | `docrag delete <rel_path>` | Delete a file and its embeddings |
//! | `docrag prompt` | Print the resolved system prompt |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use doc_rag::admin::{AdminService, DataRepo};
use doc_rag::config::{self, Config};
use doc_rag::embedding::create_embedder;
use doc_rag::index::sqlite::SqliteCollectionProvider;
use doc_rag::llm::{ChatClient, OpenAIChatClient};
use doc_rag::models::RetrievalQuery;
use doc_rag::orchestrator::{Orchestrator, OrchestratorInput};
use doc_rag::prompt::{load_system_prompt, resolve_prompt_name, FsPromptStore};
use doc_rag::retriever::RetrievalEngine;
use doc_rag::{logging, server};

/// doc-rag: retrieval-augmented answers over a local document collection.
#[derive(Parser)]
#[command(name = "docrag", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(
        long,
        global = true,
        env = "APP_CONFIG",
        default_value = "./config/docrag.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vector store and collection. Safe to run repeatedly.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Answer a question from the indexed documents.
    Ask {
        question: String,

        #[arg(long, default_value = "cli")]
        user: String,

        /// Chat model; defaults to `[chat].default_model`.
        #[arg(long)]
        model: Option<String>,
    },

    /// Run retrieval only and print the selected chunks.
    Retrieve { question: String },

    /// Ingest a file already present under `[ingest].data_path`.
    Ingest { rel_path: String },

    /// List raw files, newest first.
    Files {
        #[arg(long)]
        recursive: bool,

        /// Only files with this extension (e.g. `.txt`).
        #[arg(long)]
        ext: Option<String>,
    },

    /// Delete a raw file and all of its chunks.
    Delete { rel_path: String },

    /// Print the system prompt the orchestrator would use.
    Prompt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            let store = store(&cfg)?;
            let collection = store.open_collection().await?;
            println!(
                "Vector store ready at {} (collection '{}', {} chunks).",
                cfg.store.path.display(),
                collection.name(),
                collection.count().await?
            );
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ask {
            question,
            user,
            model,
        } => {
            let store = store(&cfg)?;
            let retriever = Arc::new(RetrievalEngine::from_config(store, &cfg.retrieval)?);
            let chat: Arc<dyn ChatClient> = Arc::new(OpenAIChatClient::new(&cfg.chat)?);
            let prompts = FsPromptStore::new(&cfg.prompts.dir);
            let orchestrator = Orchestrator::from_config(&cfg, retriever, chat, &prompts, None);

            let input = OrchestratorInput {
                user,
                question,
                model: model.unwrap_or_else(|| cfg.chat.default_model.clone()),
                ..OrchestratorInput::default()
            };
            let result = orchestrator.run(&input).await?;

            println!("{}", result.answer);
            if !result.sources.is_empty() {
                println!();
                println!("Sources:");
                for source in &result.sources {
                    let score = source
                        .score
                        .map(|s| format!("{:.3}", s))
                        .unwrap_or_else(|| "-".to_string());
                    println!("  [{}] {} (score {})", source.reference, source.source_file, score);
                }
            }
            println!();
            println!(
                "tokens: prompt={} completion={} total={}",
                result.usage.prompt_tokens, result.usage.completion_tokens, result.usage.total_tokens
            );
        }
        Commands::Retrieve { question } => {
            let store = store(&cfg)?;
            let retriever = RetrievalEngine::from_config(store, &cfg.retrieval)?;
            let chunks = retriever
                .retrieve(&RetrievalQuery::new("cli", question))
                .await?;

            if chunks.is_empty() {
                println!("No chunks retrieved.");
            }
            for (i, chunk) in chunks.iter().enumerate() {
                let source = chunk
                    .metadata
                    .get("source_file")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                let preview: String = chunk.text.chars().take(160).collect();
                println!(
                    "{}. [{}] {}: {}",
                    i + 1,
                    chunk
                        .score
                        .map(|s| format!("{:.3}", s))
                        .unwrap_or_else(|| "-".to_string()),
                    source,
                    preview.replace('\n', " ")
                );
            }
        }
        Commands::Ingest { rel_path } => {
            let outcome = admin(&cfg)?.ingest(&rel_path).await?;
            println!(
                "Ingested {} into '{}': {} chunks (doc_id {}).",
                outcome.ingested, outcome.collection, outcome.chunks, outcome.doc_id
            );
        }
        Commands::Files { recursive, ext } => {
            let repo = DataRepo::open(&cfg.ingest)?;
            let files = repo.list(recursive, ext.as_deref())?;
            println!("{} ({} files)", repo.root().display(), files.len());
            for file in files {
                let modified = chrono::DateTime::from_timestamp(file.modified_ts, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("  {:<40} {:>10}  {}", file.rel_path, file.size_bytes, modified);
            }
        }
        Commands::Delete { rel_path } => {
            let outcome = admin(&cfg)?.delete_document(&rel_path).await?;
            println!(
                "Deleted {} and {} chunks from '{}'.",
                outcome.deleted_file, outcome.deleted_embeddings, outcome.collection
            );
            if !outcome.rebuilt {
                eprintln!("Warning: retriever rebuild failed; see logs.");
            }
        }
        Commands::Prompt => {
            let prompts = FsPromptStore::new(&cfg.prompts.dir);
            let name = resolve_prompt_name(cfg.prompts.system.as_deref());
            println!("{}", load_system_prompt(&prompts, name));
        }
    }

    Ok(())
}

fn store(cfg: &Config) -> Result<Arc<SqliteCollectionProvider>> {
    let embedder = create_embedder(&cfg.embedding)?;
    Ok(Arc::new(SqliteCollectionProvider::new(&cfg.store, embedder)?))
}

fn admin(cfg: &Config) -> Result<AdminService> {
    let store = store(cfg)?;
    let retriever = Arc::new(RetrievalEngine::from_config(
        store.clone(),
        &cfg.retrieval,
    )?);
    let repo = DataRepo::open(&cfg.ingest)?;
    Ok(AdminService::new(
        repo,
        store,
        retriever,
        cfg.embedding.batch_size,
    ))
}
