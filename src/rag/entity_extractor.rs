//! LLM-driven entity and relationship extraction.
//!
//! Each chunk gets one extraction call followed by up to
//! `max_gleaning` continuation turns. The concatenated output is a list of
//! delimited records:
//!
//! ```text
//! ("entity"<|>"APPLE"<|>"organization"<|>"Apple makes phones")##
//! ("relationship"<|>"TIM COOK"<|>"APPLE"<|>"leads"<|>"leadership"<|>9)<|COMPLETE|>
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::{canonical_name, clean_str, TextChunk};
use crate::integrations::{CachedResponse, ChatMessage, CompletionOptions, LlmClient};
use crate::prompts::{self, Prompt};
use crate::storage::KvStorage;
use crate::Result;

static RECORD_BODY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\((.*)\)").expect("record regex is valid"));
static FLOAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d*\.?\d+$").expect("float regex is valid"));

/// Extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub entity_types: Vec<String>,
    pub language: String,
    /// Continuation turns after the first call.
    pub max_gleaning: usize,
    /// Few-shot examples embedded in the prompt; `None` keeps all.
    pub example_number: Option<usize>,
    pub tuple_delimiter: String,
    pub record_delimiter: String,
    pub completion_delimiter: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            entity_types: prompts::DEFAULT_ENTITY_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            language: prompts::DEFAULT_LANGUAGE.to_string(),
            max_gleaning: 3,
            example_number: None,
            tuple_delimiter: prompts::DEFAULT_TUPLE_DELIMITER.to_string(),
            record_delimiter: prompts::DEFAULT_RECORD_DELIMITER.to_string(),
            completion_delimiter: prompts::DEFAULT_COMPLETION_DELIMITER.to_string(),
        }
    }
}

/// One mention of an entity in one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCandidate {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
}

/// One mention of a relationship in one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipCandidate {
    pub src: String,
    pub tgt: String,
    pub weight: f64,
    pub description: String,
    pub keywords: String,
    pub source_id: String,
}

/// Candidates found in one chunk, grouped by canonical key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkExtraction {
    pub entities: BTreeMap<String, Vec<EntityCandidate>>,
    pub relationships: BTreeMap<(String, String), Vec<RelationshipCandidate>>,
}

impl ChunkExtraction {
    pub fn entity_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.values().map(Vec::len).sum()
    }
}

/// Parse raw extraction output for `chunk_id`.
///
/// Records that are neither a well-formed entity nor relationship are
/// dropped without error.
pub fn parse_extraction(output: &str, chunk_id: &str, config: &ExtractionConfig) -> ChunkExtraction {
    let mut result = ChunkExtraction::default();

    let records = output
        .split(config.record_delimiter.as_str())
        .flat_map(|part| part.split(config.completion_delimiter.as_str()));

    for record in records {
        let Some(body) = RECORD_BODY_RE
            .captures(record)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
        else {
            continue;
        };

        let fields: Vec<&str> = body.split(config.tuple_delimiter.as_str()).collect();
        if let Some(entity) = parse_entity(&fields, chunk_id) {
            result
                .entities
                .entry(entity.name.clone())
                .or_default()
                .push(entity);
        } else if let Some(relationship) = parse_relationship(&fields, chunk_id) {
            result
                .relationships
                .entry((relationship.src.clone(), relationship.tgt.clone()))
                .or_default()
                .push(relationship);
        }
    }

    result
}

fn parse_entity(fields: &[&str], chunk_id: &str) -> Option<EntityCandidate> {
    if fields.len() < 4 || clean_str(fields[0]) != "entity" {
        return None;
    }
    if clean_str(fields[1]).is_empty() {
        return None;
    }
    Some(EntityCandidate {
        name: canonical_name(fields[1]),
        entity_type: clean_str(fields[2]).to_uppercase(),
        description: clean_str(fields[3]),
        source_id: chunk_id.to_string(),
    })
}

fn parse_relationship(fields: &[&str], chunk_id: &str) -> Option<RelationshipCandidate> {
    if fields.len() < 5 || clean_str(fields[0]) != "relationship" {
        return None;
    }
    if clean_str(fields[1]).is_empty() || clean_str(fields[2]).is_empty() {
        return None;
    }

    let weight = if fields.len() >= 6 {
        let last = clean_str(fields[fields.len() - 1]);
        if FLOAT_RE.is_match(&last) {
            last.parse::<f64>().unwrap_or(1.0)
        } else {
            1.0
        }
    } else {
        1.0
    };

    Some(RelationshipCandidate {
        src: canonical_name(fields[1]),
        tgt: canonical_name(fields[2]),
        weight,
        description: clean_str(fields[3]),
        keywords: clean_str(fields[4]),
        source_id: chunk_id.to_string(),
    })
}

/// Runs the extraction prompt (with gleaning) over chunks.
pub struct EntityExtractor {
    llm: Arc<dyn LlmClient>,
    config: ExtractionConfig,
    cache: Option<Arc<dyn KvStorage<CachedResponse>>>,
}

impl EntityExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, config: ExtractionConfig) -> Self {
        Self {
            llm,
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn KvStorage<CachedResponse>>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extraction prompt for `input_text`.
    pub fn build_prompt(&self, input_text: &str) -> String {
        let entity_types = self.config.entity_types.join(",");
        let examples = prompts::entity_extraction_examples(
            self.config.example_number,
            &self.config.tuple_delimiter,
            &self.config.record_delimiter,
            &self.config.completion_delimiter,
        );
        prompts::render(
            &Prompt::EntityExtraction.load(),
            &[
                ("examples", examples.as_str()),
                ("entity_types", entity_types.as_str()),
                ("language", self.config.language.as_str()),
                ("tuple_delimiter", self.config.tuple_delimiter.as_str()),
                ("record_delimiter", self.config.record_delimiter.as_str()),
                ("completion_delimiter", self.config.completion_delimiter.as_str()),
                ("input_text", input_text),
            ],
        )
    }

    fn options(&self, history: Vec<ChatMessage>) -> CompletionOptions {
        CompletionOptions::default()
            .with_history(history)
            .with_cache(self.cache.clone())
    }

    /// Raw model output for one chunk, gleaning turns appended.
    pub async fn run_gleaning(&self, content: &str) -> Result<String> {
        let prompt = self.build_prompt(content);
        let mut final_result = self.llm.complete(&prompt, &self.options(Vec::new())).await?;

        let continue_prompt = Prompt::EntityContinueExtraction.load();
        let if_loop_prompt = Prompt::EntityIfLoopExtraction.load();
        let mut history = vec![
            ChatMessage::user(prompt),
            ChatMessage::assistant(final_result.clone()),
        ];

        for turn in 0..self.config.max_gleaning {
            let glean = self
                .llm
                .complete(&continue_prompt, &self.options(history.clone()))
                .await?;
            history.push(ChatMessage::user(continue_prompt.clone()));
            history.push(ChatMessage::assistant(glean.clone()));
            final_result.push_str(&glean);

            if turn + 1 == self.config.max_gleaning {
                break;
            }

            let answer = self
                .llm
                .complete(&if_loop_prompt, &self.options(history.clone()))
                .await?;
            if clean_str(&answer).to_lowercase() != "yes" {
                debug!(turn, "Gleaning stopped by model");
                break;
            }
        }

        Ok(final_result)
    }

    pub async fn extract_chunk(&self, chunk: &TextChunk) -> Result<ChunkExtraction> {
        let output = self.run_gleaning(&chunk.content).await?;
        Ok(parse_extraction(&output, &chunk.id, &self.config))
    }

    /// Extract every chunk concurrently. Results keep the input order.
    pub async fn extract_chunks(&self, chunks: &[TextChunk]) -> Result<Vec<ChunkExtraction>> {
        let processed = AtomicUsize::new(0);
        let total = chunks.len();

        try_join_all(chunks.iter().map(|chunk| {
            let processed = &processed;
            async move {
                let extraction = self.extract_chunk(chunk).await?;
                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    chunk = %chunk.id,
                    entities = extraction.entity_count(),
                    relationships = extraction.relationship_count(),
                    "Processed chunk {}/{}",
                    done,
                    total
                );
                Ok::<_, crate::Error>(extraction)
            }
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::GenerationConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    fn sample_output() -> String {
        [
            r#"("entity"<|>"Apple"<|>"organization"<|>"Apple makes phones")"#,
            r#"("entity"<|>"Tim Cook"<|>"person"<|>"CEO of Apple")"#,
            r#"("relationship"<|>"Tim Cook"<|>"Apple"<|>"Tim Cook leads Apple"<|>"leadership"<|>9)"#,
            r#"("content_keywords"<|>"technology")<|COMPLETE|>"#,
        ]
        .join("##\n")
    }

    #[test]
    fn parses_entities_and_relationships() {
        let parsed = parse_extraction(&sample_output(), "chunk-1", &ExtractionConfig::default());

        assert_eq!(parsed.entities.len(), 2);
        let apple = &parsed.entities["\"APPLE\""][0];
        assert_eq!(apple.entity_type, "ORGANIZATION");
        assert_eq!(apple.description, "Apple makes phones");
        assert_eq!(apple.source_id, "chunk-1");

        let key = ("\"TIM COOK\"".to_string(), "\"APPLE\"".to_string());
        let rel = &parsed.relationships[&key][0];
        assert_eq!(rel.weight, 9.0);
        assert_eq!(rel.keywords, "leadership");
        assert_eq!(parsed.relationship_count(), 1);
    }

    #[test]
    fn weight_defaults_when_missing_or_not_numeric() {
        let config = ExtractionConfig::default();
        let five = r#"("relationship"<|>"A"<|>"B"<|>"desc"<|>"kw")"#;
        let word = r#"("relationship"<|>"A"<|>"C"<|>"desc"<|>"kw"<|>"strong")"#;
        let decimal = r#"("relationship"<|>"A"<|>"D"<|>"desc"<|>"kw"<|>0.5)"#;
        let parsed = parse_extraction(&[five, word, decimal].join("##"), "c", &config);

        let weight = |tgt: &str| {
            parsed.relationships[&("\"A\"".to_string(), format!("\"{}\"", tgt))][0].weight
        };
        assert_eq!(weight("B"), 1.0);
        assert_eq!(weight("C"), 1.0);
        assert_eq!(weight("D"), 0.5);
    }

    #[test]
    fn malformed_records_are_dropped() {
        let config = ExtractionConfig::default();
        let output = [
            r#"("entity"<|>"Short"<|>"person")"#,
            r#"("relationship"<|>"A"<|>"B"<|>"only desc")"#,
            r#"("entity"<|>""<|>"person"<|>"nameless")"#,
            r#"no parentheses at all"#,
            r#"("unknown"<|>"X"<|>"Y"<|>"Z"<|>"W")"#,
        ]
        .join("##");
        let parsed = parse_extraction(&output, "c", &config);
        assert!(parsed.entities.is_empty());
        assert!(parsed.relationships.is_empty());
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let output = r#"("entity"<|>"Apple"<|>"organization"<|>"desc"<|>"extra")"#;
        let parsed = parse_extraction(output, "c", &ExtractionConfig::default());
        assert_eq!(parsed.entity_count(), 1);
    }

    #[test]
    fn repeated_mentions_accumulate_per_key() {
        let output = [
            r#"("entity"<|>"Apple"<|>"organization"<|>"first")"#,
            r#"("entity"<|>"APPLE"<|>"company"<|>"second")"#,
        ]
        .join("##");
        let parsed = parse_extraction(&output, "c", &ExtractionConfig::default());
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities["\"APPLE\""].len(), 2);
    }

    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<(String, usize)>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete_with_config(
            &self,
            prompt: &str,
            _config: &GenerationConfig,
            options: &CompletionOptions,
        ) -> Result<String> {
            self.prompts
                .lock()
                .await
                .push((prompt.to_string(), options.history.len()));
            Ok(self.replies.lock().await.pop_front().unwrap_or_default())
        }
    }

    fn chunk(content: &str) -> TextChunk {
        TextChunk {
            id: "chunk-1".to_string(),
            content: content.to_string(),
            tokens: 3,
            chunk_order_index: 0,
            full_doc_id: "doc-1".to_string(),
        }
    }

    #[tokio::test]
    async fn gleaning_stops_when_model_says_no() {
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"("entity"<|>"Apple"<|>"organization"<|>"phones")"#,
            r#"##("entity"<|>"Tim Cook"<|>"person"<|>"CEO")"#,
            "NO",
        ]));
        let extractor = EntityExtractor::new(llm.clone(), ExtractionConfig::default());

        let parsed = extractor.extract_chunk(&chunk("Apple and Tim Cook")).await.unwrap();
        assert_eq!(parsed.entities.len(), 2);

        let prompts = llm.prompts.lock().await;
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].0.contains("Apple and Tim Cook"));
        assert_eq!(prompts[0].1, 0);
        assert_eq!(prompts[1].0, Prompt::EntityContinueExtraction.template());
        assert_eq!(prompts[1].1, 2);
        assert_eq!(prompts[2].0, Prompt::EntityIfLoopExtraction.template());
        assert_eq!(prompts[2].1, 4);
    }

    #[tokio::test]
    async fn gleaning_skips_loop_question_after_last_turn() {
        let llm = Arc::new(ScriptedLlm::new(&["", "", "\"yes\"", ""]));
        let config = ExtractionConfig {
            max_gleaning: 2,
            ..Default::default()
        };
        let extractor = EntityExtractor::new(llm.clone(), config);

        extractor.run_gleaning("text").await.unwrap();
        // initial, continue, loop(yes), continue
        assert_eq!(llm.prompts.lock().await.len(), 4);
    }

    #[tokio::test]
    async fn zero_gleaning_makes_single_call() {
        let llm = Arc::new(ScriptedLlm::new(&["only"]));
        let config = ExtractionConfig {
            max_gleaning: 0,
            ..Default::default()
        };
        let extractor = EntityExtractor::new(llm.clone(), config);
        assert_eq!(extractor.run_gleaning("text").await.unwrap(), "only");
        assert_eq!(llm.prompts.lock().await.len(), 1);
    }

    #[test]
    fn prompt_embeds_types_and_examples() {
        let llm = Arc::new(ScriptedLlm::new(&[]));
        let config = ExtractionConfig {
            entity_types: vec!["person".into(), "company".into()],
            example_number: Some(1),
            ..Default::default()
        };
        let prompt = EntityExtractor::new(llm, config).build_prompt("Some text");
        assert!(prompt.contains("Entity_types: person,company"));
        assert!(prompt.contains("Text: Some text"));
        assert!(prompt.contains("Example 1"));
        assert!(!prompt.contains("Example 2"));
        assert!(!prompt.contains("{tuple_delimiter}"));
    }

    #[test]
    fn custom_delimiters_reach_examples_and_parser() {
        let llm = Arc::new(ScriptedLlm::new(&[]));
        let config = ExtractionConfig {
            tuple_delimiter: "|~|".into(),
            record_delimiter: "%%".into(),
            completion_delimiter: "<END>".into(),
            ..Default::default()
        };
        let prompt = EntityExtractor::new(llm, config.clone()).build_prompt("Some text");
        assert_eq!(prompt.matches(prompts::DEFAULT_TUPLE_DELIMITER).count(), 0);
        assert_eq!(prompt.matches(prompts::DEFAULT_COMPLETION_DELIMITER).count(), 0);
        assert!(prompt.contains(r#"("entity"|~|"Apple"|~|"organization""#));

        let output = r#"("entity"|~|"Apple"|~|"organization"|~|"phones")%%("relationship"|~|"Apple"|~|"Austin"|~|"campus"|~|"expansion"|~|7)<END>"#;
        let parsed = parse_extraction(output, "c", &config);
        assert_eq!(parsed.entity_count(), 1);
        assert_eq!(parsed.relationship_count(), 1);
    }
}
