//! Language model and embedding clients.
//!
//! - [`LlmClient`]: completion interface consumed by extraction, merge and query
//! - [`OpenAIClient`]: chat completions over `reqwest`, with retry and response cache
//! - [`embeddings`]: OpenAI and hashing embedders

pub mod embeddings;
pub mod openai;
pub mod retry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::rag::types::compute_mdhash_id;
use crate::storage::KvStorage;
use crate::{Error, Result};

pub use embeddings::{Embedder, HashEmbedder, OpenAiEmbedder};
pub use openai::OpenAIClient;
pub use retry::RetryPolicy;

/// Chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Memoized completion stored in the response cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    #[serde(rename = "return")]
    pub response: String,
    pub model: String,
}

/// Sampling parameters of a model deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: Some(0.0),
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: Vec::new(),
        }
    }
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct CompletionOptions {
    pub system_prompt: Option<String>,
    /// Prior turns, sent before the prompt.
    pub history: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask for JSON-only output.
    pub json_mode: bool,
    /// Response memoization, keyed by [`cache_key`].
    pub cache: Option<Arc<dyn KvStorage<CachedResponse>>>,
}

impl fmt::Debug for CompletionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionOptions")
            .field("system_prompt", &self.system_prompt)
            .field("history", &self.history.len())
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("json_mode", &self.json_mode)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl CompletionOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Ask for a bare JSON object.
    pub fn with_json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn KvStorage<CachedResponse>>>) -> Self {
        self.cache = cache;
        self
    }
}

/// Cache key: md5 over model, messages and the options that shape the reply.
pub fn cache_key(model: &str, messages: &[ChatMessage], options: &CompletionOptions) -> String {
    let payload = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": options.max_tokens,
        "temperature": options.temperature,
        "json_mode": options.json_mode,
    });
    compute_mdhash_id(&payload.to_string(), "")
}

/// Completion oracle used across the pipeline.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_name(&self) -> &str;

    /// Complete `prompt` with the client's own generation settings.
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        self.complete_with_config(prompt, &GenerationConfig::default(), options)
            .await
    }

    async fn complete_with_config(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        options: &CompletionOptions,
    ) -> Result<String>;

    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::Embedding(format!(
            "{} does not provide embeddings",
            self.model_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_depends_on_messages_and_options() {
        let messages = vec![ChatMessage::user("hi")];
        let base = CompletionOptions::default();
        let a = cache_key("gpt-4o-mini", &messages, &base);
        let b = cache_key("gpt-4o-mini", &messages, &base);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        assert_ne!(a, cache_key("gpt-4o", &messages, &base));
        assert_ne!(
            a,
            cache_key("gpt-4o-mini", &[ChatMessage::user("hello")], &base)
        );
        assert_ne!(
            a,
            cache_key(
                "gpt-4o-mini",
                &messages,
                &CompletionOptions::default().with_max_tokens(10)
            )
        );
    }

    #[test]
    fn cached_response_serializes_return_field() {
        let cached = CachedResponse {
            response: "ok".to_string(),
            model: "m".to_string(),
        };
        let json = serde_json::to_value(&cached).unwrap();
        assert_eq!(json["return"], "ok");
    }

    #[test]
    fn completion_options_debug_hides_cache_handle() {
        let opts = CompletionOptions::default().with_system_prompt("sys");
        let debug = format!("{:?}", opts);
        assert!(debug.contains("sys"));
        assert!(debug.contains("cache: false"));
    }

    struct Echo;

    #[async_trait]
    impl LlmClient for Echo {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn complete_with_config(
            &self,
            prompt: &str,
            _config: &GenerationConfig,
            _options: &CompletionOptions,
        ) -> Result<String> {
            Ok(prompt.to_string())
        }
    }

    #[tokio::test]
    async fn default_complete_and_embed() {
        let llm = Echo;
        let out = llm
            .complete("ping", &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "ping");
        assert!(matches!(
            llm.embed_text("x").await.unwrap_err(),
            Error::Embedding(_)
        ));
    }
}
