//! LightRAG CLI - main entry point
//!
//! Indexes documents into the knowledge graph and answers questions over it.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lightrag::{metrics, Config, CustomKnowledgeGraph, QueryMode, StreamOptions};

#[derive(Parser)]
#[command(name = "lightrag")]
#[command(about = "Graph-augmented retrieval over LLM-extracted knowledge graphs", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to config.yml (defaults to ./config.yml or ../config.yml)
    #[arg(short, long, env = "LIGHTRAG_CONFIG")]
    config: Option<PathBuf>,

    /// Override the storage working directory
    #[arg(long, env = "LIGHTRAG_WORKING_DIR")]
    working_dir: Option<PathBuf>,

    /// Address to expose Prometheus metrics (e.g., 0.0.0.0:9898)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert text files (or inline text) as documents
    Insert {
        /// Files to read; each file is one document
        files: Vec<PathBuf>,

        /// Inline document text
        #[arg(short, long)]
        text: Vec<String>,
    },

    /// Stream a large file (or stdin) into the index piece by piece
    InsertStream {
        /// File to read; stdin when omitted
        file: Option<PathBuf>,

        /// Window in bytes searched for a sentence break
        #[arg(long, default_value_t = 64 * 1024)]
        chunk_size: usize,

        /// Inserts in flight at once
        #[arg(long, default_value_t = 5)]
        max_concurrency: usize,
    },

    /// Insert a ready-made knowledge graph from a JSON file
    InsertKg {
        /// JSON with `chunks`, `entities` and `relationships`
        file: PathBuf,
    },

    /// Ask a question
    Query {
        query: String,

        /// Retrieval mode: naive | local | global | hybrid
        #[arg(short, long)]
        mode: Option<String>,

        /// Number of vector hits per lookup
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the retrieved context instead of an answer
        #[arg(long, default_value_t = false)]
        only_context: bool,

        /// Print the rendered system prompt instead of an answer
        #[arg(long, default_value_t = false)]
        only_prompt: bool,

        /// Answer format hint, e.g. "Single Paragraph" or "Bullet Points"
        #[arg(long)]
        response_type: Option<String>,
    },

    /// Delete an entity and its relationships
    Delete {
        entity: String,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Insert { .. } => "insert",
            Commands::InsertStream { .. } => "insert_stream",
            Commands::InsertKg { .. } => "insert_kg",
            Commands::Query { .. } => "query",
            Commands::Delete { .. } => "delete",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env for local development
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lightrag=info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::new(),
    };
    if let Some(dir) = cli.working_dir.clone() {
        config.storage.working_dir = dir;
    }

    let metrics_addr = match cli.metrics_addr.as_deref() {
        Some(addr) => match addr.parse::<SocketAddr>() {
            Ok(socket) => Some(socket),
            Err(err) => {
                warn!(%addr, "Invalid metrics address: {}", err);
                None
            }
        },
        None => config.metrics_addr,
    };
    if let Some(socket) = metrics_addr {
        metrics::spawn_metrics_server(socket);
    }

    let command_name = cli.command.name();
    metrics::record_command_start(command_name);
    let start = Instant::now();

    let result = execute_command(&config, cli.command).await;

    metrics::record_command_result(command_name, start.elapsed(), result.is_ok());

    result
}

async fn execute_command(config: &Config, command: Commands) -> anyhow::Result<()> {
    let rag = config.build().await.context("building LightRAG engine")?;

    match command {
        Commands::Insert { files, text } => {
            let mut docs = text;
            for file in &files {
                docs.push(read_file(file).await?);
            }
            if docs.is_empty() {
                println!("Nothing to insert: pass files or --text");
                return Ok(());
            }
            let summary = rag.insert(&docs).await?;
            println!(
                "Inserted {} documents, {} chunks, {} entities, {} relationships",
                summary.documents, summary.chunks, summary.entities, summary.relationships
            );
        }
        Commands::InsertStream {
            file,
            chunk_size,
            max_concurrency,
        } => {
            let options = StreamOptions {
                chunk_size,
                max_concurrency,
            };
            let rag = Arc::new(rag);
            let pieces = match file {
                Some(path) => {
                    let reader = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?;
                    rag.process_stream(reader, options).await?
                }
                None => rag.process_stream(tokio::io::stdin(), options).await?,
            };
            println!("Processed {} pieces", pieces);
        }
        Commands::InsertKg { file } => {
            let content = read_file(&file).await?;
            let kg: CustomKnowledgeGraph = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", file.display()))?;
            let summary = rag.insert_custom_kg(kg).await?;
            println!(
                "Inserted {} chunks, {} entities, {} relationships",
                summary.chunks, summary.entities, summary.relationships
            );
        }
        Commands::Query {
            query,
            mode,
            top_k,
            only_context,
            only_prompt,
            response_type,
        } => {
            let mut param = config.query.clone();
            if let Some(mode) = mode {
                param.mode = mode.parse::<QueryMode>()?;
            }
            if let Some(top_k) = top_k {
                param.top_k = top_k;
            }
            if let Some(response_type) = response_type {
                param.response_type = response_type;
            }
            param.only_need_context = only_context;
            param.only_need_prompt = only_prompt;

            info!(mode = %param.mode, top_k = param.top_k, "Running query");
            let answer = rag.query(&query, &param).await?;
            println!("{}", answer);
        }
        Commands::Delete { entity } => {
            rag.delete_by_entity(&entity).await?;
            println!("Deleted entity '{}'", entity);
        }
    }

    Ok(())
}

async fn read_file(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

