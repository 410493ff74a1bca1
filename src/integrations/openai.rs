//! OpenAI-compatible chat completion client.

use std::collections::HashMap;
use std::env;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    cache_key, CachedResponse, ChatMessage, CompletionOptions, GenerationConfig, LlmClient,
    RetryPolicy,
};
use crate::metrics;
use crate::{Error, Result};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// System message appended when JSON output is requested.
pub const JSON_ONLY_SYSTEM_PROMPT: &str = "You are an assistant that only outputs JSON responses. Do not include any explanatory text, comments, or anything outside valid JSON syntax.";

/// OpenAI client.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    generation: GenerationConfig,
    retry: RetryPolicy,
}

impl OpenAIClient {
    /// Create client from environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY is not set".to_string()))?;
        Self::new(api_key)
    }

    /// Create client with API key.
    pub fn new<S: Into<String>>(api_key: S) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::Config("OPENAI_API_KEY is empty".to_string()));
        }

        let http = Client::builder()
            .user_agent(concat!("lightrag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            base_url: OPENAI_API_URL.to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            generation: GenerationConfig::default(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Message order: system prompt, JSON instruction, history, then the prompt.
    fn build_messages(prompt: &str, options: &CompletionOptions) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(options.history.len() + 3);
        if let Some(system) = &options.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        if options.json_mode {
            messages.push(ChatMessage::system(JSON_ONLY_SYSTEM_PROMPT));
        }
        messages.extend(options.history.iter().cloned());
        messages.push(ChatMessage::user(prompt));
        messages
    }

    /// Chat completion.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
        options: &CompletionOptions,
    ) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens.or(config.max_tokens),
            temperature: options.temperature.or(config.temperature),
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
            stop: &config.stop,
            response_format: options
                .json_mode
                .then(|| HashMap::from([("type", "json_object")])),
        };

        debug!(
            model = %self.model,
            messages = messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Llm {
                status: status.as_u16(),
                message: text,
            });
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| Error::SerializationError(format!("Invalid response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::SerializationError("Empty response from OpenAI".to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        self.complete_with_config(prompt, &self.generation, options)
            .await
    }

    async fn complete_with_config(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        options: &CompletionOptions,
    ) -> Result<String> {
        let messages = Self::build_messages(prompt, options);

        let key = options
            .cache
            .as_ref()
            .map(|_| cache_key(&self.model, &messages, options));
        if let (Some(cache), Some(key)) = (&options.cache, &key) {
            match cache.get_by_id(key).await {
                Ok(Some(hit)) => {
                    debug!(key = %key, "LLM response cache hit");
                    metrics::record_llm_cache_hit();
                    return Ok(hit.response);
                }
                Ok(None) => {}
                Err(err) => warn!("LLM cache lookup failed: {}", err),
            }
        }

        let started = Instant::now();
        let result = self
            .retry
            .run(|| self.chat_completion(&messages, config, options))
            .await;
        metrics::record_llm_call(started.elapsed(), result.is_ok());
        let response = result?;

        if let (Some(cache), Some(key)) = (&options.cache, key) {
            cache
                .upsert(HashMap::from([(
                    key,
                    CachedResponse {
                        response: response.clone(),
                        model: self.model.clone(),
                    },
                )]))
                .await?;
        }

        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<HashMap<&'static str, &'static str>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}
