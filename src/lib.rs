//! LightRAG: graph-augmented retrieval over an LLM-extracted knowledge graph
//!
//! This library provides tools to:
//! - Chunk documents and extract entities and relationships with an LLM
//! - Merge extractions into a persistent knowledge graph and vector indices
//! - Answer questions in naive, local, global and hybrid retrieval modes
//! - Plug in memory, Qdrant and Neo4j storage backends
//! - Export Prometheus metrics for LLM calls, inserts and queries

pub mod config;
pub mod error;
pub mod integrations;
pub mod metrics;
pub mod prompts;
pub mod rag;
pub mod storage;

// Re-export common types
pub use config::Config;
pub use error::{Error, Result};
pub use integrations::{LlmClient, OpenAIClient};
pub use prompts::{load_prompt, Prompt};
pub use rag::{
    CustomKnowledgeGraph, InsertSummary, LightRag, LightRagConfig, QueryMode, QueryParam,
    Storages, StreamOptions,
};
