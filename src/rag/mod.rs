//! LightRAG: extraction-and-merge knowledge graph with multi-mode retrieval.
//!
//! Pipeline:
//! 1. [`chunker`] splits documents into overlapping token windows
//! 2. [`entity_extractor`] asks the LLM for entities and relationships per chunk
//! 3. [`graph`] merges candidates into the committed graph and vector indices
//! 4. [`retriever`] builds naive, local, global and hybrid contexts
//! 5. [`query`] extracts keywords, dispatches on mode and answers
//!
//! [`engine::LightRag`] ties the stages together.

pub mod chunker;
pub mod engine;
pub mod entity_extractor;
pub mod graph;
pub mod query;
pub mod retriever;
pub mod tokenizer;
pub mod types;

pub use chunker::Chunker;
pub use engine::{
    CustomChunk, CustomEntity, CustomKnowledgeGraph, CustomRelationship, InsertSummary, LightRag,
    LightRagConfig, Storages, StreamOptions,
};
pub use entity_extractor::{ChunkExtraction, EntityExtractor, ExtractionConfig};
pub use graph::{GraphMerger, MergeConfig, MergeOutcome};
pub use query::{QueryEngine, QueryKeywords, QueryMode, QueryParam};
pub use retriever::{ContextBuilder, ContextTables};
pub use tokenizer::{RegexTokenizer, Tokenizer};
pub use types::{Entity, FullDocument, Relationship, TextChunk};
