//! Query orchestration: keyword extraction, mode dispatch and final answer.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::retriever::ContextBuilder;
use crate::integrations::{CachedResponse, CompletionOptions, LlmClient};
use crate::metrics;
use crate::prompts::{self, Prompt, FAIL_RESPONSE};
use crate::storage::KvStorage;
use crate::{Error, Result};

static JSON_BODY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("json regex is valid"));

const ROLE_MARKERS: [&str; 5] = ["<system>", "</system>", "user:", "model:", "assistant:"];

/// Retrieval strategy of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Naive,
    #[default]
    Local,
    Global,
    Hybrid,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Naive => "naive",
            QueryMode::Local => "local",
            QueryMode::Global => "global",
            QueryMode::Hybrid => "hybrid",
        }
    }

    fn needs_low_level(&self) -> bool {
        matches!(self, QueryMode::Local | QueryMode::Hybrid)
    }

    fn needs_high_level(&self) -> bool {
        matches!(self, QueryMode::Global | QueryMode::Hybrid)
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "naive" => Ok(QueryMode::Naive),
            "local" => Ok(QueryMode::Local),
            "global" => Ok(QueryMode::Global),
            "hybrid" => Ok(QueryMode::Hybrid),
            "" => Err(Error::InvalidArgument("Query mode is empty".to_string())),
            other => Err(Error::InvalidArgument(format!("Unknown mode {}", other))),
        }
    }
}

/// Per-query settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParam {
    pub mode: QueryMode,
    /// Return the context block instead of an answer.
    pub only_need_context: bool,
    /// Return the rendered system prompt instead of an answer.
    pub only_need_prompt: bool,
    pub response_type: String,
    pub top_k: usize,
    pub max_token_for_text_unit: usize,
    pub max_token_for_local_context: usize,
    pub max_token_for_global_context: usize,
}

impl Default for QueryParam {
    fn default() -> Self {
        Self {
            mode: QueryMode::default(),
            only_need_context: false,
            only_need_prompt: false,
            response_type: "Multiple Paragraphs".to_string(),
            top_k: 5,
            max_token_for_text_unit: 1024,
            max_token_for_local_context: 512,
            max_token_for_global_context: 512,
        }
    }
}

impl QueryParam {
    pub fn with_mode(mut self, mode: QueryMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Keywords the model pulled out of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueryKeywords {
    #[serde(
        default,
        alias = "highLevelKeywords",
        alias = "highLevelKeyWords",
        alias = "high_level_keyWords"
    )]
    pub high_level_keywords: Vec<String>,
    #[serde(
        default,
        alias = "lowLevelKeywords",
        alias = "lowLevelKeyWords",
        alias = "low_level_keyWords"
    )]
    pub low_level_keywords: Vec<String>,
}

/// Locate the JSON object in a model reply and read both keyword lists.
pub fn parse_keywords(response: &str) -> Option<QueryKeywords> {
    let body = JSON_BODY_RE.find(response)?.as_str();
    match serde_json::from_str::<QueryKeywords>(body) {
        Ok(keywords) => Some(keywords),
        Err(err) => {
            warn!("Keyword JSON parsing failed: {}", err);
            None
        }
    }
}

/// Remove an echoed system prompt, query and role markers from a reply.
pub fn strip_echo(response: &str, system_prompt: &str, query: &str) -> String {
    let echoed = response.contains(system_prompt) || response.trim_start().starts_with(query);
    if !echoed {
        return response.trim().to_string();
    }

    let mut cleaned = response.replacen(system_prompt, "", 1);
    if !query.is_empty() {
        cleaned = cleaned.replacen(query, "", 1);
    }
    for marker in ROLE_MARKERS {
        cleaned = cleaned.replacen(marker, "", 1);
    }
    cleaned.trim().to_string()
}

/// Drives one query from keywords to final answer.
pub struct QueryEngine {
    llm: Arc<dyn LlmClient>,
    context: ContextBuilder,
    language: String,
    example_number: Option<usize>,
    cache: Option<Arc<dyn KvStorage<CachedResponse>>>,
}

impl QueryEngine {
    pub fn new(llm: Arc<dyn LlmClient>, context: ContextBuilder) -> Self {
        Self {
            llm,
            context,
            language: prompts::DEFAULT_LANGUAGE.to_string(),
            example_number: None,
            cache: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_example_number(mut self, example_number: Option<usize>) -> Self {
        self.example_number = example_number;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn KvStorage<CachedResponse>>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn context_builder(&self) -> &ContextBuilder {
        &self.context
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions::default().with_cache(self.cache.clone())
    }

    pub async fn query(&self, query: &str, param: &QueryParam) -> Result<String> {
        let started = Instant::now();
        let result = match param.mode {
            QueryMode::Naive => self.naive_query(query, param).await,
            QueryMode::Local | QueryMode::Global | QueryMode::Hybrid => {
                self.kg_query(query, param).await
            }
        };
        metrics::record_query(param.mode.as_str(), started.elapsed(), result.is_ok());
        result
    }

    /// Ask the model for high-level and low-level keywords.
    pub async fn extract_keywords(&self, query: &str) -> Result<Option<QueryKeywords>> {
        let examples = prompts::keywords_extraction_examples(self.example_number);
        let prompt = prompts::render(
            &Prompt::KeywordsExtraction.load(),
            &[
                ("examples", examples.as_str()),
                ("language", self.language.as_str()),
                ("query", query),
            ],
        );
        let response = self
            .llm
            .complete(&prompt, &self.options().with_json_mode())
            .await?;
        info!("Keyword extraction result: {}", response);
        Ok(parse_keywords(&response))
    }

    async fn kg_query(&self, query: &str, param: &QueryParam) -> Result<String> {
        let Some(keywords) = self.extract_keywords(query).await? else {
            return Ok(FAIL_RESPONSE.to_string());
        };

        let high = &keywords.high_level_keywords;
        let low = &keywords.low_level_keywords;
        if high.is_empty() && low.is_empty() {
            warn!("low_level_keywords and high_level_keywords are empty");
            return Ok(FAIL_RESPONSE.to_string());
        }
        if low.is_empty() && param.mode.needs_low_level() {
            warn!("low_level_keywords is empty");
            return Ok(FAIL_RESPONSE.to_string());
        }
        if high.is_empty() && param.mode.needs_high_level() {
            warn!("high_level_keywords is empty");
            return Ok(FAIL_RESPONSE.to_string());
        }

        let low = low.join(", ");
        let high = high.join(", ");
        let tables = match param.mode {
            QueryMode::Local => self.context.local_context(&low, param).await?,
            QueryMode::Global => self.context.global_context(&high, param).await?,
            QueryMode::Hybrid => self.context.hybrid_context(&low, &high, param).await?,
            QueryMode::Naive => return self.naive_query(query, param).await,
        };

        let Some(context) = tables.render() else {
            return Ok(FAIL_RESPONSE.to_string());
        };
        if param.only_need_context {
            return Ok(context);
        }

        let system_prompt = prompts::render(
            &Prompt::RagResponse.load(),
            &[
                ("context_data", context.as_str()),
                ("response_type", param.response_type.as_str()),
            ],
        );
        self.answer(query, system_prompt, param).await
    }

    async fn naive_query(&self, query: &str, param: &QueryParam) -> Result<String> {
        let Some(section) = self.context.naive_context(query, param).await? else {
            return Ok(FAIL_RESPONSE.to_string());
        };
        if param.only_need_context {
            return Ok(section);
        }

        let system_prompt = prompts::render(
            &Prompt::NaiveRagResponse.load(),
            &[
                ("content_data", section.as_str()),
                ("response_type", param.response_type.as_str()),
            ],
        );
        self.answer(query, system_prompt, param).await
    }

    async fn answer(&self, query: &str, system_prompt: String, param: &QueryParam) -> Result<String> {
        if param.only_need_prompt {
            return Ok(system_prompt);
        }
        let options = self.options().with_system_prompt(system_prompt.clone());
        let response = self.llm.complete(query, &options).await?;
        Ok(strip_echo(&response, &system_prompt, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{GenerationConfig, HashEmbedder};
    use crate::rag::tokenizer::RegexTokenizer;
    use crate::rag::types::TextChunk;
    use crate::storage::{MemoryGraphStorage, MemoryKvStorage, MemoryVectorStorage};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Answers keyword prompts with JSON and records the json flag of each call.
    struct RecordingLlm {
        json_flags: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl LlmClient for RecordingLlm {
        fn model_name(&self) -> &str {
            "recording"
        }

        async fn complete_with_config(
            &self,
            prompt: &str,
            _config: &GenerationConfig,
            options: &CompletionOptions,
        ) -> Result<String> {
            self.json_flags.lock().await.push(options.json_mode);
            if prompt.contains("high_level_keywords") {
                Ok(r#"{"high_level_keywords": ["Tech"], "low_level_keywords": ["Apple"]}"#.to_string())
            } else {
                Ok("answer".to_string())
            }
        }
    }

    fn engine(llm: Arc<RecordingLlm>) -> QueryEngine {
        let embedder = Arc::new(HashEmbedder::new(32));
        let context = ContextBuilder::new(
            Arc::new(MemoryGraphStorage::new()),
            Arc::new(MemoryVectorStorage::new("entities", embedder.clone())),
            Arc::new(MemoryVectorStorage::new("relationships", embedder.clone())),
            Arc::new(MemoryVectorStorage::new("chunks", embedder)),
            Arc::new(MemoryKvStorage::<TextChunk>::new("text_chunks")),
            Arc::new(RegexTokenizer::new()),
        );
        QueryEngine::new(llm, context)
    }

    #[tokio::test]
    async fn keyword_extraction_requests_json() {
        let llm = Arc::new(RecordingLlm {
            json_flags: Mutex::new(Vec::new()),
        });
        let keywords = engine(llm.clone())
            .extract_keywords("What does Apple make?")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(keywords.low_level_keywords, vec!["Apple"]);
        assert_eq!(*llm.json_flags.lock().await, vec![true]);
    }

    #[test]
    fn parses_modes_and_rejects_unknown() {
        assert_eq!("naive".parse::<QueryMode>().unwrap(), QueryMode::Naive);
        assert_eq!(" Hybrid ".parse::<QueryMode>().unwrap(), QueryMode::Hybrid);
        assert!(matches!(
            "invalid".parse::<QueryMode>(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!("".parse::<QueryMode>(), Err(Error::InvalidArgument(_))));
        assert_eq!(QueryMode::Global.to_string(), "global");
    }

    #[test]
    fn query_param_defaults() {
        let param = QueryParam::default();
        assert_eq!(param.mode, QueryMode::Local);
        assert_eq!(param.top_k, 5);
        assert_eq!(param.max_token_for_text_unit, 1024);
        assert_eq!(param.max_token_for_local_context, 512);
        assert_eq!(param.max_token_for_global_context, 512);
    }

    #[test]
    fn query_param_deserializes_partial_yaml() {
        let param: QueryParam = serde_yaml::from_str("mode: hybrid\ntop_k: 10\n").unwrap();
        assert_eq!(param.mode, QueryMode::Hybrid);
        assert_eq!(param.top_k, 10);
        assert_eq!(param.max_token_for_local_context, 512);
    }

    #[test]
    fn parse_keywords_accepts_aliases_and_surrounding_text() {
        let reply = r#"Sure! Output:
{
  "highLevelKeyWords": ["Partnership"],
  "lowLevelKeywords": ["Tim Cook", "Satya Nadella"]
}
Hope that helps."#;
        let keywords = parse_keywords(reply).unwrap();
        assert_eq!(keywords.high_level_keywords, vec!["Partnership"]);
        assert_eq!(keywords.low_level_keywords.len(), 2);

        let snake = parse_keywords(r#"{"high_level_keywords": ["a"], "low_level_keywords": []}"#)
            .unwrap();
        assert_eq!(snake.high_level_keywords, vec!["a"]);
        assert!(snake.low_level_keywords.is_empty());
    }

    #[test]
    fn parse_keywords_fails_without_json() {
        assert!(parse_keywords("no json here").is_none());
        assert!(parse_keywords("{not valid}").is_none());
    }

    #[test]
    fn strip_echo_removes_prompt_query_and_markers() {
        let system = "SYSTEM PROMPT";
        let reply = "<system>SYSTEM PROMPT</system>user: What is Apple? The answer.";
        assert_eq!(strip_echo(reply, system, "What is Apple?"), "The answer.");
    }

    #[test]
    fn strip_echo_leaves_clean_replies_alone() {
        assert_eq!(
            strip_echo("  Apple makes phones. user: ignored ", "SYSTEM", "What is Apple?"),
            "Apple makes phones. user: ignored"
        );
    }
}
