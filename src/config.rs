//! Configuration for the LightRAG engine
//!
//! Loads configuration from config.yml file. String values written as
//! `${VAR}` are taken from the environment, and a `.env` file is loaded first.

use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::integrations::embeddings::{default_dimension, DEFAULT_EMBEDDING_MODEL};
use crate::integrations::openai::DEFAULT_CHAT_MODEL;
use crate::integrations::{Embedder, GenerationConfig, HashEmbedder, OpenAIClient, OpenAiEmbedder};
use crate::integrations::RetryPolicy;
use crate::rag::entity_extractor::ExtractionConfig;
use crate::rag::graph::MergeConfig;
use crate::rag::{LightRag, LightRagConfig, QueryParam, Storages};
use crate::storage::qdrant::DEFAULT_COLLECTION_PREFIX;
use crate::storage::{namespace, Neo4jGraphStorage, QdrantVectorStorage};
use crate::{Error, Result};

/// Default constants (fallback if config.yml not found)
pub const DEFAULT_WORKING_DIR: &str = "./lightrag_cache";
pub const DEFAULT_HASH_DIMENSION: usize = 256;
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
pub const DEFAULT_NEO4J_URI: &str = "bolt://localhost:7687";
pub const DEFAULT_NEO4J_USER: &str = "neo4j";

/// YAML config structures
#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    llm: Option<LlmYaml>,
    embedding: Option<EmbeddingYaml>,
    chunking: Option<ChunkingYaml>,
    extraction: Option<ExtractionConfig>,
    merge: Option<MergeConfig>,
    query: Option<QueryParam>,
    storage: Option<StorageYaml>,
    retry: Option<RetryPolicy>,
    metrics: Option<MetricsYaml>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmYaml {
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    enable_cache: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingYaml {
    provider: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    dimension: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkingYaml {
    token_size: Option<usize>,
    overlap_token_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageYaml {
    working_dir: Option<String>,
    vector: Option<String>,
    graph: Option<String>,
    qdrant_url: Option<String>,
    collection_prefix: Option<String>,
    neo4j_uri: Option<String>,
    neo4j_user: Option<String>,
    neo4j_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsYaml {
    addr: Option<String>,
}

/// Chat model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    OpenAi,
    /// Deterministic hashing embedder, no network.
    Hash,
}

#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub dimension: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Memory,
    Qdrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphBackend {
    Memory,
    Neo4j,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Snapshot directory of the in-process stores.
    pub working_dir: PathBuf,
    pub vector: VectorBackend,
    pub graph: GraphBackend,
    pub qdrant_url: String,
    pub collection_prefix: String,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmSettings,
    pub embedding: EmbeddingSettings,
    pub rag: LightRagConfig,
    pub query: QueryParam,
    pub storage: StorageSettings,
    pub retry: RetryPolicy,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Load configuration from config.yml or use defaults
    pub fn new() -> Self {
        Self::load_from_file("config.yml")
            .or_else(|_| Self::load_from_file("../config.yml"))
            .unwrap_or_else(|_| {
                Self::load_dotenv();
                Self::from_yaml(YamlConfig::default())
            })
    }

    /// Resolve a value: prefer env var if config value looks like ${VAR}
    fn resolve_env_string(value: Option<String>, env_key: &str) -> String {
        Self::resolve_env_opt(value, env_key).unwrap_or_default()
    }

    fn resolve_env_opt(value: Option<String>, env_key: &str) -> Option<String> {
        if let Some(ref v) = value {
            if let Some(var_name) = v.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
                if let Ok(env_val) = std::env::var(var_name) {
                    return Some(env_val);
                }
                return std::env::var(env_key).ok();
            }
            return value;
        }
        std::env::var(env_key).ok()
    }

    /// Load .env file into environment variables using dotenvy
    fn load_dotenv() {
        if dotenvy::dotenv().is_err() {
            let _ = dotenvy::from_filename("../.env");
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_dotenv();

        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let yaml: YamlConfig = if content.trim().is_empty() {
            YamlConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        };
        let config = Self::from_yaml(yaml);
        config.validate()?;
        Ok(config)
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        let llm = yaml.llm.unwrap_or_default();
        let embedding = yaml.embedding.unwrap_or_default();
        let chunking = yaml.chunking.unwrap_or_default();
        let storage = yaml.storage.unwrap_or_default();

        let api_key = Self::resolve_env_string(llm.api_key, "OPENAI_API_KEY");
        let generation = GenerationConfig {
            max_tokens: llm.max_tokens,
            temperature: llm.temperature.or(Some(0.0)),
            ..GenerationConfig::default()
        };

        let provider = match embedding.provider.as_deref().map(str::to_lowercase).as_deref() {
            Some("hash") | Some("local") => EmbeddingProvider::Hash,
            Some(_) => EmbeddingProvider::OpenAi,
            None if api_key.is_empty() => EmbeddingProvider::Hash,
            None => EmbeddingProvider::OpenAi,
        };
        let embedding_model = embedding
            .model
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());
        let dimension = embedding.dimension.unwrap_or(match provider {
            EmbeddingProvider::Hash => DEFAULT_HASH_DIMENSION,
            EmbeddingProvider::OpenAi => default_dimension(&embedding_model),
        });
        let embedding_key = Self::resolve_env_opt(embedding.api_key, "OPENAI_API_KEY")
            .unwrap_or_else(|| api_key.clone());

        let mut rag = LightRagConfig {
            extraction: yaml.extraction.unwrap_or_default(),
            merge: yaml.merge.unwrap_or_default(),
            enable_llm_cache: llm.enable_cache.unwrap_or(true),
            ..LightRagConfig::default()
        };
        if let Some(size) = chunking.token_size {
            rag.chunk_token_size = size;
        }
        if let Some(overlap) = chunking.overlap_token_size {
            rag.chunk_overlap_token_size = overlap;
        }
        rag.merge.language = rag.extraction.language.clone();

        let vector = match storage.vector.as_deref() {
            Some("qdrant") => VectorBackend::Qdrant,
            _ => VectorBackend::Memory,
        };
        let graph = match storage.graph.as_deref() {
            Some("neo4j") => GraphBackend::Neo4j,
            _ => GraphBackend::Memory,
        };

        Self {
            llm: LlmSettings {
                api_key,
                model: llm.model.unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
                base_url: Self::resolve_env_opt(llm.base_url, "OPENAI_BASE_URL"),
                generation,
            },
            embedding: EmbeddingSettings {
                provider,
                api_key: embedding_key,
                model: embedding_model,
                base_url: embedding.base_url,
                dimension,
            },
            rag,
            query: yaml.query.unwrap_or_default(),
            storage: StorageSettings {
                working_dir: PathBuf::from(
                    Self::resolve_env_opt(storage.working_dir, "LIGHTRAG_WORKING_DIR")
                        .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
                ),
                vector,
                graph,
                qdrant_url: Self::resolve_env_opt(storage.qdrant_url, "QDRANT_URL")
                    .unwrap_or_else(|| DEFAULT_QDRANT_URL.to_string()),
                collection_prefix: storage
                    .collection_prefix
                    .unwrap_or_else(|| DEFAULT_COLLECTION_PREFIX.to_string()),
                neo4j_uri: Self::resolve_env_opt(storage.neo4j_uri, "NEO4J_URI")
                    .unwrap_or_else(|| DEFAULT_NEO4J_URI.to_string()),
                neo4j_user: Self::resolve_env_opt(storage.neo4j_user, "NEO4J_USER")
                    .unwrap_or_else(|| DEFAULT_NEO4J_USER.to_string()),
                neo4j_password: Self::resolve_env_string(storage.neo4j_password, "NEO4J_PASSWORD"),
            },
            retry: yaml.retry.unwrap_or_default(),
            metrics_addr: yaml
                .metrics
                .and_then(|m| m.addr)
                .and_then(|addr| addr.parse().ok()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.rag.chunk_token_size == 0 {
            return Err(Error::Config("chunking.token_size must be positive".to_string()));
        }
        if self.rag.chunk_overlap_token_size >= self.rag.chunk_token_size {
            return Err(Error::Config(
                "chunking.overlap_token_size must be smaller than token_size".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be positive".to_string()));
        }
        Ok(())
    }

    /// Chat client for extraction, summaries and answers.
    pub fn llm_client(&self) -> Result<OpenAIClient> {
        let mut client = OpenAIClient::new(self.llm.api_key.clone())?
            .with_model(self.llm.model.clone())
            .with_generation(self.llm.generation.clone())
            .with_retry(self.retry.clone());
        if let Some(base_url) = &self.llm.base_url {
            client = client.with_base_url(base_url.clone());
        }
        Ok(client)
    }

    pub fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        let embedding = &self.embedding;
        Ok(match embedding.provider {
            EmbeddingProvider::Hash => Arc::new(HashEmbedder::new(embedding.dimension)),
            EmbeddingProvider::OpenAi => {
                let embedder = match &embedding.base_url {
                    Some(url) => OpenAiEmbedder::with_base_url(
                        &embedding.api_key,
                        embedding.model.clone(),
                        url,
                    )?,
                    None => OpenAiEmbedder::new(&embedding.api_key, embedding.model.clone())?,
                };
                Arc::new(
                    embedder
                        .with_dimension(embedding.dimension)
                        .with_retry(self.retry.clone()),
                )
            }
        })
    }

    /// Open the configured backends.
    pub async fn storages(&self, embedder: Arc<dyn Embedder>) -> Result<Storages> {
        let storage = &self.storage;
        let mut storages = Storages::with_working_dir(&storage.working_dir, embedder.clone())?;

        if storage.vector == VectorBackend::Qdrant {
            let connect = |ns: &'static str| {
                QdrantVectorStorage::connect(
                    &storage.qdrant_url,
                    &storage.collection_prefix,
                    ns,
                    embedder.clone(),
                )
            };
            storages.entities_vdb = Arc::new(connect(namespace::ENTITIES).await?);
            storages.relationships_vdb = Arc::new(connect(namespace::RELATIONSHIPS).await?);
            storages.chunks_vdb = Arc::new(connect(namespace::CHUNKS).await?);
            info!(url = %storage.qdrant_url, "Using Qdrant vector storage");
        }

        if storage.graph == GraphBackend::Neo4j {
            if storage.neo4j_password.is_empty() {
                return Err(Error::Config("NEO4J_PASSWORD not set".to_string()));
            }
            storages.graph = Arc::new(
                Neo4jGraphStorage::connect(
                    &storage.neo4j_uri,
                    &storage.neo4j_user,
                    &storage.neo4j_password,
                )
                .await?
                .with_retry(self.retry.clone()),
            );
            info!(uri = %storage.neo4j_uri, "Using Neo4j graph storage");
        }

        Ok(storages)
    }

    /// Assemble an engine from this configuration.
    pub async fn build(&self) -> Result<LightRag> {
        let llm = Arc::new(self.llm_client()?);
        let embedder = self.embedder()?;
        let storages = self.storages(embedder).await?;
        Ok(LightRag::new(self.rag.clone(), llm, storages))
    }
}
