//! Merges extracted candidates into the committed knowledge graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::entity_extractor::{ChunkExtraction, EntityCandidate, RelationshipCandidate};
use super::tokenizer::Tokenizer;
use super::types::{
    compute_mdhash_id, split_field, Entity, EntityRecord, RelationRecord, Relationship,
    GRAPH_FIELD_SEP, UNKNOWN_ENTITY_TYPE,
};
use crate::integrations::{CachedResponse, CompletionOptions, LlmClient};
use crate::prompts::{self, Prompt};
use crate::storage::{
    GraphStorage, KvStorage, VectorRecord, VectorStorage, META_ENTITY_NAME, META_SRC_ID,
    META_TGT_ID,
};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Descriptions are cut to this many tokens before summarization.
    pub llm_model_max_token_size: usize,
    /// Descriptions longer than this are summarized.
    pub entity_summary_to_max_tokens: usize,
    /// Completion budget of the summary call.
    pub summary_max_tokens: u32,
    pub language: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            llm_model_max_token_size: 4096,
            entity_summary_to_max_tokens: 512,
            summary_max_tokens: 500,
            language: prompts::DEFAULT_LANGUAGE.to_string(),
        }
    }
}

/// Records committed by one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

/// Most frequent value; ties go to the value seen first.
fn most_common(values: &[String]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in values {
        *counts.entry(value.as_str()).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for value in values {
        let count = counts[value.as_str()];
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value.as_str(), count));
        }
    }
    best.map(|(value, _)| value.to_string())
}

/// Distinct non-empty fragments, sorted, joined by `GRAPH_FIELD_SEP`.
fn union_fields<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .flat_map(|v| split_field(v.as_ref()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(GRAPH_FIELD_SEP)
}

/// Group candidates of every chunk by key, chunk order preserved.
///
/// Edges are undirected, so `(A, B)` and `(B, A)` share one group keyed by
/// the orientation seen first.
pub fn group_candidates(
    extractions: Vec<ChunkExtraction>,
) -> (
    BTreeMap<String, Vec<EntityCandidate>>,
    BTreeMap<(String, String), Vec<RelationshipCandidate>>,
) {
    let mut entities: BTreeMap<String, Vec<EntityCandidate>> = BTreeMap::new();
    let mut relationships: BTreeMap<(String, String), Vec<RelationshipCandidate>> =
        BTreeMap::new();
    for extraction in extractions {
        for (name, candidates) in extraction.entities {
            entities.entry(name).or_default().extend(candidates);
        }
        for ((src, tgt), candidates) in extraction.relationships {
            let reversed = (tgt, src);
            let key = if relationships.contains_key(&reversed) {
                reversed
            } else {
                (reversed.1, reversed.0)
            };
            relationships.entry(key).or_default().extend(candidates);
        }
    }
    (entities, relationships)
}

/// Entity index records: `ent-` + md5(name).
pub fn entity_vector_records(entities: &[Entity]) -> HashMap<String, VectorRecord> {
    entities
        .iter()
        .map(|e| {
            (
                compute_mdhash_id(&e.name, "ent-"),
                VectorRecord::new(format!("{}{}", e.name, e.description))
                    .with_meta(META_ENTITY_NAME, e.name.clone()),
            )
        })
        .collect()
}

/// Vector id of an undirected edge: `rel-` + md5 of the sorted endpoints.
pub fn relationship_vector_id(src: &str, tgt: &str) -> String {
    let (a, b) = if src <= tgt { (src, tgt) } else { (tgt, src) };
    compute_mdhash_id(&format!("{}{}", a, b), "rel-")
}

/// Relationship index records keyed by [`relationship_vector_id`].
pub fn relationship_vector_records(relationships: &[Relationship]) -> HashMap<String, VectorRecord> {
    relationships
        .iter()
        .map(|r| {
            (
                relationship_vector_id(&r.src, &r.tgt),
                VectorRecord::new(format!(
                    "{}{}{}{}",
                    r.keywords, r.src, r.tgt, r.description
                ))
                .with_meta(META_SRC_ID, r.src.clone())
                .with_meta(META_TGT_ID, r.tgt.clone()),
            )
        })
        .collect()
}

/// Reconciles candidates with existing graph state and commits them.
pub struct GraphMerger {
    graph: Arc<dyn GraphStorage>,
    entities_vdb: Arc<dyn VectorStorage>,
    relationships_vdb: Arc<dyn VectorStorage>,
    llm: Arc<dyn LlmClient>,
    tokenizer: Arc<dyn Tokenizer>,
    config: MergeConfig,
    cache: Option<Arc<dyn KvStorage<CachedResponse>>>,
}

impl GraphMerger {
    pub fn new(
        graph: Arc<dyn GraphStorage>,
        entities_vdb: Arc<dyn VectorStorage>,
        relationships_vdb: Arc<dyn VectorStorage>,
        llm: Arc<dyn LlmClient>,
        tokenizer: Arc<dyn Tokenizer>,
        config: MergeConfig,
    ) -> Self {
        Self {
            graph,
            entities_vdb,
            relationships_vdb,
            llm,
            tokenizer,
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn KvStorage<CachedResponse>>>) -> Self {
        self.cache = cache;
        self
    }

    /// Compress `description` with one LLM call when it exceeds the
    /// summary threshold; otherwise return it unchanged.
    pub async fn summarize_descriptions(&self, name: &str, description: String) -> Result<String> {
        let tokens = self.tokenizer.count_tokens(&description);
        if tokens <= self.config.entity_summary_to_max_tokens {
            return Ok(description);
        }

        let truncated = self
            .tokenizer
            .truncate(&description, self.config.llm_model_max_token_size);
        let description_list = split_field(truncated).join("\n");
        let prompt = prompts::render(
            &Prompt::SummarizeEntityDescriptions.load(),
            &[
                ("entity_name", name),
                ("description_list", description_list.as_str()),
                ("language", self.config.language.as_str()),
            ],
        );

        debug!(entity = name, tokens, "Summarizing descriptions");
        let options = CompletionOptions::default()
            .with_max_tokens(self.config.summary_max_tokens)
            .with_cache(self.cache.clone());
        self.llm.complete(&prompt, &options).await
    }

    pub async fn merge_entity(&self, name: &str, candidates: &[EntityCandidate]) -> Result<Entity> {
        let mut types = Vec::with_capacity(candidates.len() + 1);
        let mut descriptions = Vec::with_capacity(candidates.len() + 1);
        let mut sources = Vec::with_capacity(candidates.len() + 1);

        if let Some(existing) = self.graph.get_node(name).await? {
            types.push(existing.entity_type);
            descriptions.push(existing.description);
            sources.push(existing.source_id);
        }
        for candidate in candidates {
            types.push(candidate.entity_type.clone());
            descriptions.push(candidate.description.clone());
            sources.push(candidate.source_id.clone());
        }

        let entity_type =
            most_common(&types).unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string());
        let description = self
            .summarize_descriptions(name, union_fields(&descriptions))
            .await?;
        let source_id = union_fields(&sources);

        self.graph
            .upsert_node(
                name,
                EntityRecord {
                    entity_type: entity_type.clone(),
                    description: description.clone(),
                    source_id: source_id.clone(),
                },
            )
            .await?;

        Ok(Entity {
            name: name.to_string(),
            entity_type,
            description,
            source_id,
        })
    }

    pub async fn merge_relationship(
        &self,
        src: &str,
        tgt: &str,
        candidates: &[RelationshipCandidate],
    ) -> Result<Relationship> {
        let mut weight = 0.0;
        let mut descriptions = Vec::with_capacity(candidates.len() + 1);
        let mut keywords = Vec::with_capacity(candidates.len() + 1);
        let mut sources = Vec::with_capacity(candidates.len() + 1);

        if let Some(existing) = self.graph.get_edge(src, tgt).await? {
            weight += existing.weight;
            descriptions.push(existing.description);
            keywords.push(existing.keywords);
            sources.push(existing.source_id);
        }
        for candidate in candidates {
            weight += candidate.weight;
            descriptions.push(candidate.description.clone());
            keywords.push(candidate.keywords.clone());
            sources.push(candidate.source_id.clone());
        }

        let description = self
            .summarize_descriptions(&format!("({}, {})", src, tgt), union_fields(&descriptions))
            .await?;
        let keywords = union_fields(&keywords);
        let source_id = union_fields(&sources);

        for endpoint in [src, tgt] {
            if !self.graph.has_node(endpoint).await? {
                debug!(entity = endpoint, "Creating stub endpoint");
                self.graph
                    .upsert_node(
                        endpoint,
                        EntityRecord {
                            entity_type: UNKNOWN_ENTITY_TYPE.to_string(),
                            description: description.clone(),
                            source_id: source_id.clone(),
                        },
                    )
                    .await?;
            }
        }

        self.graph
            .upsert_edge(
                src,
                tgt,
                RelationRecord {
                    weight,
                    description: description.clone(),
                    keywords: keywords.clone(),
                    source_id: source_id.clone(),
                },
            )
            .await?;

        Ok(Relationship {
            src: src.to_string(),
            tgt: tgt.to_string(),
            weight,
            description,
            keywords,
            source_id,
        })
    }

    /// Merge one ingestion batch and index the results.
    ///
    /// Returns `None` without writing anything when the batch yielded no
    /// entities or no relationships.
    pub async fn merge_batch(&self, extractions: Vec<ChunkExtraction>) -> Result<Option<MergeOutcome>> {
        let (entity_candidates, relationship_candidates) = group_candidates(extractions);

        if entity_candidates.is_empty() {
            warn!("Didn't extract any entities, maybe your LLM is not working");
            return Ok(None);
        }
        if relationship_candidates.is_empty() {
            warn!("Didn't extract any relationships, maybe your LLM is not working");
            return Ok(None);
        }

        let entities = try_join_all(
            entity_candidates
                .iter()
                .map(|(name, candidates)| self.merge_entity(name, candidates)),
        )
        .await?;

        let relationships = try_join_all(
            relationship_candidates
                .iter()
                .map(|((src, tgt), candidates)| self.merge_relationship(src, tgt, candidates)),
        )
        .await?;

        self.entities_vdb
            .upsert(entity_vector_records(&entities))
            .await?;
        self.relationships_vdb
            .upsert(relationship_vector_records(&relationships))
            .await?;

        info!(
            entities = entities.len(),
            relationships = relationships.len(),
            "Merged batch into knowledge graph"
        );

        Ok(Some(MergeOutcome {
            entities,
            relationships,
        }))
    }
}
