//! The `LightRag` facade: ingestion, custom graphs, deletion, streaming and queries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::chunker::{Chunker, DEFAULT_CHUNK_OVERLAP_TOKEN_SIZE, DEFAULT_CHUNK_TOKEN_SIZE};
use super::entity_extractor::{EntityExtractor, ExtractionConfig};
use super::graph::{
    entity_vector_records, relationship_vector_records, GraphMerger, MergeConfig, MergeOutcome,
};
use super::query::{QueryEngine, QueryParam};
use super::retriever::ContextBuilder;
use super::tokenizer::{RegexTokenizer, Tokenizer};
use super::types::{
    canonical_name, compute_mdhash_id, Entity, EntityRecord, FullDocument, RelationRecord,
    Relationship, TextChunk, UNKNOWN_ENTITY_TYPE,
};
use crate::integrations::{CachedResponse, Embedder, LlmClient};
use crate::metrics;
use crate::storage::{
    namespace, GraphStorage, KvStorage, MemoryGraphStorage, MemoryKvStorage, MemoryVectorStorage,
    VectorRecord, VectorStorage, META_FULL_DOC_ID,
};
use crate::{Error, Result};

/// Description given to custom entities that come without one.
pub const DEFAULT_CUSTOM_DESCRIPTION: &str = "No description provided";

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightRagConfig {
    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,
    pub extraction: ExtractionConfig,
    pub merge: MergeConfig,
    /// Memoize LLM responses in the `llm_response_cache` store.
    pub enable_llm_cache: bool,
}

impl Default for LightRagConfig {
    fn default() -> Self {
        Self {
            chunk_token_size: DEFAULT_CHUNK_TOKEN_SIZE,
            chunk_overlap_token_size: DEFAULT_CHUNK_OVERLAP_TOKEN_SIZE,
            extraction: ExtractionConfig::default(),
            merge: MergeConfig::default(),
            enable_llm_cache: true,
        }
    }
}

/// Every store the engine reads and writes.
#[derive(Clone)]
pub struct Storages {
    pub full_docs: Arc<dyn KvStorage<FullDocument>>,
    pub text_chunks: Arc<dyn KvStorage<TextChunk>>,
    pub llm_cache: Arc<dyn KvStorage<CachedResponse>>,
    pub entities_vdb: Arc<dyn VectorStorage>,
    pub relationships_vdb: Arc<dyn VectorStorage>,
    pub chunks_vdb: Arc<dyn VectorStorage>,
    pub graph: Arc<dyn GraphStorage>,
}

impl Storages {
    /// Volatile in-process stores.
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            full_docs: Arc::new(MemoryKvStorage::new(namespace::FULL_DOCS)),
            text_chunks: Arc::new(MemoryKvStorage::new(namespace::TEXT_CHUNKS)),
            llm_cache: Arc::new(MemoryKvStorage::new(namespace::LLM_RESPONSE_CACHE)),
            entities_vdb: Arc::new(MemoryVectorStorage::new(namespace::ENTITIES, embedder.clone())),
            relationships_vdb: Arc::new(MemoryVectorStorage::new(
                namespace::RELATIONSHIPS,
                embedder.clone(),
            )),
            chunks_vdb: Arc::new(MemoryVectorStorage::new(namespace::CHUNKS, embedder)),
            graph: Arc::new(MemoryGraphStorage::new()),
        }
    }

    /// In-process stores snapshotted to JSON files under `dir`.
    pub fn with_working_dir(dir: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            full_docs: Arc::new(MemoryKvStorage::with_working_dir(dir, namespace::FULL_DOCS)?),
            text_chunks: Arc::new(MemoryKvStorage::with_working_dir(dir, namespace::TEXT_CHUNKS)?),
            llm_cache: Arc::new(MemoryKvStorage::with_working_dir(
                dir,
                namespace::LLM_RESPONSE_CACHE,
            )?),
            entities_vdb: Arc::new(MemoryVectorStorage::with_working_dir(
                dir,
                namespace::ENTITIES,
                embedder.clone(),
            )?),
            relationships_vdb: Arc::new(MemoryVectorStorage::with_working_dir(
                dir,
                namespace::RELATIONSHIPS,
                embedder.clone(),
            )?),
            chunks_vdb: Arc::new(MemoryVectorStorage::with_working_dir(
                dir,
                namespace::CHUNKS,
                embedder,
            )?),
            graph: Arc::new(MemoryGraphStorage::with_working_dir(dir)?),
        })
    }
}

/// What one `insert` call committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertSummary {
    pub documents: usize,
    pub chunks: usize,
    pub entities: usize,
    pub relationships: usize,
}

/// A chunk supplied with a custom knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomChunk {
    pub content: String,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEntity {
    pub entity_name: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRelationship {
    pub src_id: String,
    pub tgt_id: String,
    pub description: String,
    pub keywords: String,
    #[serde(default)]
    pub weight: Option<f64>,
    pub source_id: String,
}

/// Caller-built graph inserted without extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomKnowledgeGraph {
    #[serde(default)]
    pub chunks: Vec<CustomChunk>,
    #[serde(default)]
    pub entities: Vec<CustomEntity>,
    #[serde(default)]
    pub relationships: Vec<CustomRelationship>,
}

/// Settings of [`LightRag::process_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Window in bytes searched for a sentence break.
    pub chunk_size: usize,
    /// Inserts allowed in flight at once.
    pub max_concurrency: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_concurrency: 5,
        }
    }
}

/// Cut complete pieces off the front of `buffer`.
///
/// Each piece ends at the last `.` inside the first `chunk_size` bytes, or at
/// `chunk_size` (moved back to a char boundary) when the window holds none.
fn drain_pieces(buffer: &mut Vec<u8>, chunk_size: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    while buffer.len() >= chunk_size {
        let cut = match buffer[..chunk_size].iter().rposition(|b| *b == b'.') {
            Some(dot) => dot + 1,
            None => {
                let mut cut = chunk_size;
                while cut > 1 && cut < buffer.len() && (buffer[cut] & 0xC0) == 0x80 {
                    cut -= 1;
                }
                cut
            }
        };
        let piece: Vec<u8> = buffer.drain(..cut).collect();
        let text = String::from_utf8_lossy(&piece).trim().to_string();
        if !text.is_empty() {
            pieces.push(text);
        }
    }
    pieces
}

/// Graph-augmented retrieval engine.
pub struct LightRag {
    config: LightRagConfig,
    chunker: Chunker,
    storages: Storages,
    extractor: EntityExtractor,
    merger: GraphMerger,
    query_engine: QueryEngine,
}

impl LightRag {
    /// Engine with the default regex tokenizer.
    pub fn new(config: LightRagConfig, llm: Arc<dyn LlmClient>, storages: Storages) -> Self {
        Self::with_tokenizer(config, llm, storages, Arc::new(RegexTokenizer::new()))
    }

    pub fn with_tokenizer(
        config: LightRagConfig,
        llm: Arc<dyn LlmClient>,
        storages: Storages,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let cache = config
            .enable_llm_cache
            .then(|| storages.llm_cache.clone());

        let chunker = Chunker::with_tokenizer(
            config.chunk_token_size,
            config.chunk_overlap_token_size,
            tokenizer.clone(),
        );
        let extractor =
            EntityExtractor::new(llm.clone(), config.extraction.clone()).with_cache(cache.clone());
        let merger = GraphMerger::new(
            storages.graph.clone(),
            storages.entities_vdb.clone(),
            storages.relationships_vdb.clone(),
            llm.clone(),
            tokenizer.clone(),
            config.merge.clone(),
        )
        .with_cache(cache.clone());
        let context = ContextBuilder::new(
            storages.graph.clone(),
            storages.entities_vdb.clone(),
            storages.relationships_vdb.clone(),
            storages.chunks_vdb.clone(),
            storages.text_chunks.clone(),
            tokenizer,
        );
        let query_engine = QueryEngine::new(llm, context)
            .with_language(config.extraction.language.clone())
            .with_example_number(config.extraction.example_number)
            .with_cache(cache);

        Self {
            config,
            chunker,
            storages,
            extractor,
            merger,
            query_engine,
        }
    }

    pub fn config(&self) -> &LightRagConfig {
        &self.config
    }

    pub fn storages(&self) -> &Storages {
        &self.storages
    }

    /// Chunk, extract and merge new documents.
    ///
    /// Documents and chunks already stored are skipped, so inserting the
    /// same text twice does no work the second time.
    pub async fn insert<S: AsRef<str>>(&self, docs: &[S]) -> Result<InsertSummary> {
        let started = Instant::now();

        let mut new_docs: HashMap<String, FullDocument> = HashMap::new();
        for doc in docs {
            let content = doc.as_ref().trim();
            if content.is_empty() {
                continue;
            }
            new_docs.insert(
                compute_mdhash_id(content, "doc-"),
                FullDocument {
                    content: content.to_string(),
                },
            );
        }

        let keys: Vec<String> = new_docs.keys().cloned().collect();
        let missing = self.storages.full_docs.filter_keys(&keys).await?;
        new_docs.retain(|key, _| missing.contains(key));
        if new_docs.is_empty() {
            warn!("All docs are already in the storage");
            return Ok(InsertSummary::default());
        }
        info!(docs = new_docs.len(), "[New Docs] inserting docs");

        let result = self.insert_documents(new_docs).await;
        let done = self.insert_done().await;

        metrics::record_insert(
            result.as_ref().map(|s| s.chunks).unwrap_or(0),
            started.elapsed(),
            result.is_ok(),
        );
        let summary = result?;
        done?;
        Ok(summary)
    }

    async fn insert_documents(
        &self,
        new_docs: HashMap<String, FullDocument>,
    ) -> Result<InsertSummary> {
        let mut chunks: HashMap<String, TextChunk> = HashMap::new();
        for (doc_id, doc) in &new_docs {
            for chunk in self.chunker.chunk(&doc.content, doc_id) {
                chunks.insert(chunk.id.clone(), chunk);
            }
        }

        let keys: Vec<String> = chunks.keys().cloned().collect();
        let missing = self.storages.text_chunks.filter_keys(&keys).await?;
        chunks.retain(|key, _| missing.contains(key));
        if chunks.is_empty() {
            warn!("All chunks are already in the storage");
            return Ok(InsertSummary::default());
        }
        info!(chunks = chunks.len(), "[New Chunks] inserting chunks");

        let mut ordered: Vec<TextChunk> = chunks.into_values().collect();
        ordered.sort_by(|a, b| {
            a.full_doc_id
                .cmp(&b.full_doc_id)
                .then(a.chunk_order_index.cmp(&b.chunk_order_index))
        });

        info!("[Entity Extraction]...");
        let extractions = self.extractor.extract_chunks(&ordered).await?;
        let Some(MergeOutcome {
            entities,
            relationships,
        }) = self.merger.merge_batch(extractions).await?
        else {
            warn!("No new entities and relationships found");
            return Ok(InsertSummary::default());
        };

        let chunk_vectors = ordered
            .iter()
            .map(|chunk| {
                (
                    chunk.id.clone(),
                    VectorRecord::new(chunk.content.clone())
                        .with_meta(META_FULL_DOC_ID, chunk.full_doc_id.clone()),
                )
            })
            .collect();
        self.storages.chunks_vdb.upsert(chunk_vectors).await?;

        let documents = new_docs.len();
        self.storages.full_docs.upsert(new_docs).await?;
        let chunk_count = ordered.len();
        self.storages
            .text_chunks
            .upsert(
                ordered
                    .into_iter()
                    .map(|chunk| (chunk.id.clone(), chunk))
                    .collect(),
            )
            .await?;

        Ok(InsertSummary {
            documents,
            chunks: chunk_count,
            entities: entities.len(),
            relationships: relationships.len(),
        })
    }

    async fn insert_done(&self) -> Result<()> {
        let s = &self.storages;
        try_join_all([
            s.full_docs.index_done_callback(),
            s.text_chunks.index_done_callback(),
            s.llm_cache.index_done_callback(),
            s.entities_vdb.index_done_callback(),
            s.relationships_vdb.index_done_callback(),
            s.chunks_vdb.index_done_callback(),
            s.graph.index_done_callback(),
        ])
        .await?;
        Ok(())
    }

    /// Write caller-supplied chunks, entities and relationships as is.
    ///
    /// Records overwrite what the graph holds under the same names. Endpoints
    /// of a relationship that are not in the graph get an `UNKNOWN` stub.
    pub async fn insert_custom_kg(&self, kg: CustomKnowledgeGraph) -> Result<InsertSummary> {
        if kg.chunks.is_empty() && kg.entities.is_empty() && kg.relationships.is_empty() {
            return Ok(InsertSummary::default());
        }
        let result = self.insert_custom_records(kg).await;
        let done = self.insert_done().await;
        let summary = result?;
        done?;
        Ok(summary)
    }

    async fn insert_custom_records(&self, kg: CustomKnowledgeGraph) -> Result<InsertSummary> {
        // Source ids naming a supplied chunk resolve to that chunk's key.
        let mut source_to_chunk: HashMap<String, String> = HashMap::new();
        let mut chunks: HashMap<String, TextChunk> = HashMap::new();
        for (order, custom) in kg.chunks.iter().enumerate() {
            let content = custom.content.trim();
            if content.is_empty() {
                continue;
            }
            let id = compute_mdhash_id(content, "chunk-");
            source_to_chunk.insert(custom.source_id.clone(), id.clone());
            chunks.insert(
                id.clone(),
                TextChunk {
                    id,
                    content: content.to_string(),
                    tokens: self.chunker_token_count(content),
                    chunk_order_index: order,
                    full_doc_id: custom.source_id.clone(),
                },
            );
        }
        let resolve = |source_id: &str| {
            source_to_chunk
                .get(source_id)
                .cloned()
                .unwrap_or_else(|| source_id.to_string())
        };

        let mut entities = Vec::with_capacity(kg.entities.len());
        for custom in &kg.entities {
            let entity = Entity {
                name: canonical_name(&custom.entity_name),
                entity_type: custom
                    .entity_type
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string()),
                description: custom
                    .description
                    .clone()
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_CUSTOM_DESCRIPTION.to_string()),
                source_id: resolve(&custom.source_id),
            };
            self.storages
                .graph
                .upsert_node(
                    &entity.name,
                    EntityRecord {
                        entity_type: entity.entity_type.clone(),
                        description: entity.description.clone(),
                        source_id: entity.source_id.clone(),
                    },
                )
                .await?;
            entities.push(entity);
        }

        let mut relationships = Vec::with_capacity(kg.relationships.len());
        for custom in &kg.relationships {
            let relationship = Relationship {
                src: canonical_name(&custom.src_id),
                tgt: canonical_name(&custom.tgt_id),
                weight: custom.weight.unwrap_or(1.0),
                description: custom.description.clone(),
                keywords: custom.keywords.clone(),
                source_id: resolve(&custom.source_id),
            };
            for endpoint in [&relationship.src, &relationship.tgt] {
                if !self.storages.graph.has_node(endpoint).await? {
                    self.storages
                        .graph
                        .upsert_node(
                            endpoint,
                            EntityRecord {
                                entity_type: UNKNOWN_ENTITY_TYPE.to_string(),
                                description: UNKNOWN_ENTITY_TYPE.to_string(),
                                source_id: relationship.source_id.clone(),
                            },
                        )
                        .await?;
                }
            }
            self.storages
                .graph
                .upsert_edge(
                    &relationship.src,
                    &relationship.tgt,
                    RelationRecord {
                        weight: relationship.weight,
                        description: relationship.description.clone(),
                        keywords: relationship.keywords.clone(),
                        source_id: relationship.source_id.clone(),
                    },
                )
                .await?;
            relationships.push(relationship);
        }

        if !chunks.is_empty() {
            let vectors = chunks
                .values()
                .map(|chunk| {
                    (
                        chunk.id.clone(),
                        VectorRecord::new(chunk.content.clone())
                            .with_meta(META_FULL_DOC_ID, chunk.full_doc_id.clone()),
                    )
                })
                .collect();
            self.storages.chunks_vdb.upsert(vectors).await?;
        }
        let chunk_count = chunks.len();
        self.storages.text_chunks.upsert(chunks).await?;
        if !entities.is_empty() {
            self.storages
                .entities_vdb
                .upsert(entity_vector_records(&entities))
                .await?;
        }
        if !relationships.is_empty() {
            self.storages
                .relationships_vdb
                .upsert(relationship_vector_records(&relationships))
                .await?;
        }

        info!(
            chunks = chunk_count,
            entities = entities.len(),
            relationships = relationships.len(),
            "Inserted custom knowledge graph"
        );
        Ok(InsertSummary {
            documents: 0,
            chunks: chunk_count,
            entities: entities.len(),
            relationships: relationships.len(),
        })
    }

    fn chunker_token_count(&self, content: &str) -> usize {
        self.chunker.tokenizer().count_tokens(content)
    }

    /// Remove an entity, its relationships and their vectors.
    pub async fn delete_by_entity(&self, entity_name: &str) -> Result<()> {
        let name = canonical_name(entity_name);
        let s = &self.storages;

        let result = async {
            s.entities_vdb.delete_entity(&name).await?;
            s.relationships_vdb.delete_relation(&name).await?;
            s.graph.delete_node(&name).await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(err) = result {
            error!(entity = %name, "Error while deleting entity: {}", err);
            return Err(err);
        }
        info!(entity = %name, "Entity and its relationships have been deleted");

        try_join_all([
            s.entities_vdb.index_done_callback(),
            s.relationships_vdb.index_done_callback(),
            s.graph.index_done_callback(),
        ])
        .await?;
        Ok(())
    }

    /// Insert a large text read from `reader` piece by piece.
    ///
    /// Returns the number of pieces inserted. The first failing insert's
    /// error is returned once every started insert has finished.
    pub async fn process_stream<R>(self: Arc<Self>, mut reader: R, options: StreamOptions) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if options.chunk_size == 0 || options.max_concurrency == 0 {
            return Err(Error::InvalidArgument(
                "chunk_size and max_concurrency must be positive".to_string(),
            ));
        }

        let semaphore = Arc::new(Semaphore::new(options.max_concurrency));
        let mut handles = Vec::new();
        let mut buffer: Vec<u8> = Vec::with_capacity(options.chunk_size);
        let mut read_buf = vec![0u8; 8 * 1024];

        loop {
            let n = reader.read(&mut read_buf).await?;
            let mut pieces = if n == 0 {
                let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                buffer.clear();
                if rest.is_empty() {
                    Vec::new()
                } else {
                    vec![rest]
                }
            } else {
                buffer.extend_from_slice(&read_buf[..n]);
                drain_pieces(&mut buffer, options.chunk_size)
            };

            for piece in pieces.drain(..) {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Task(e.to_string()))?;
                let rag = Arc::clone(&self);
                debug!(bytes = piece.len(), "Dispatching stream piece");
                handles.push(tokio::spawn(async move {
                    let result = rag.insert(&[piece]).await;
                    drop(permit);
                    if let Err(err) = &result {
                        error!("Error processing chunk: {}", err);
                    }
                    result
                }));
            }

            if n == 0 {
                break;
            }
        }

        let total = handles.len();
        let mut first_error = None;
        for handle in handles {
            if let Err(err) = handle.await? {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(pieces = total, "Stream processed");
                Ok(total)
            }
        }
    }

    /// Answer `query` with the retrieval strategy of `param.mode`.
    pub async fn query(&self, query: &str, param: &QueryParam) -> Result<String> {
        let response = self.query_engine.query(query, param).await?;
        if self.config.enable_llm_cache {
            self.storages.llm_cache.index_done_callback().await?;
        }
        Ok(response)
    }
}
