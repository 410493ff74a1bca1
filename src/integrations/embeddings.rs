//! Text embedding backends.

use async_openai::{
    config::OpenAIConfig,
    types::{CreateEmbeddingRequestArgs, CreateEmbeddingResponse, EmbeddingInput},
    Client as OpenAIClient,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use super::RetryPolicy;
use crate::{Error, Result};

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("word regex is valid"));

/// Turns batches of text into fixed-size vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

/// Vector size of the known OpenAI embedding models.
pub fn default_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

/// OpenAI embeddings via `async-openai`.
pub struct OpenAiEmbedder {
    client: OpenAIClient<OpenAIConfig>,
    model: String,
    dimension: usize,
    retry: RetryPolicy,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, model: impl Into<String>) -> Result<Self> {
        Self::from_config(api_key, model.into(), OpenAIConfig::new().with_api_key(api_key))
    }

    /// Point the client at an OpenAI-compatible endpoint.
    pub fn with_base_url(api_key: &str, model: impl Into<String>, base_url: &str) -> Result<Self> {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self::from_config(api_key, model.into(), config)
    }

    fn from_config(api_key: &str, model: String, config: OpenAIConfig) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::Config("embedding API key is empty".to_string()));
        }
        Ok(Self {
            client: OpenAIClient::with_config(config),
            dimension: default_dimension(&model),
            model,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the vector size, for models the defaults don't know.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn request_embeddings(&self, inputs: &[String]) -> Result<CreateEmbeddingResponse> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(inputs.to_vec()))
            .build()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;

        self.client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| Error::Embedding(e.to_string()))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let processed: Vec<String> = texts
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if processed.is_empty() {
            return Ok(vec![vec![0.0; self.dimension()]; texts.len()]);
        }

        let processed = &processed;
        let response = self
            .retry
            .run(move || self.request_embeddings(processed))
            .await?;

        info!(
            "Generated {} embeddings, tokens used: {}",
            response.data.len(),
            response.usage.total_tokens
        );

        // Blank inputs were not sent; give them zero vectors in place.
        let mut result = Vec::with_capacity(texts.len());
        let mut embed_iter = response.data.into_iter();
        for text in texts {
            if text.trim().is_empty() {
                result.push(vec![0.0; self.dimension()]);
            } else if let Some(embed) = embed_iter.next() {
                result.push(embed.embedding);
            } else {
                return Err(Error::Embedding(
                    "embedding response shorter than request".to_string(),
                ));
            }
        }

        Ok(result)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic bag-of-words embedding for offline use and tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dim];
        for word in WORD_RE.find_iter(text) {
            let digest = md5::compute(word.as_str().to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest.0[0],
                digest.0[1],
                digest.0[2],
                digest.0[3],
                digest.0[4],
                digest.0[5],
                digest.0[6],
                digest.0[7],
            ]);
            vec[(bucket % self.dim as u64) as usize] += 1.0;
        }

        normalize(&mut vec);
        vec
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}
