//! Storage capability traits.
//!
//! Three independent kinds of store back the engine:
//! - [`KvStorage`] for full documents, text chunks and the LLM response cache
//! - [`VectorStorage`] for the entity, relationship and chunk indices
//! - [`GraphStorage`] for the knowledge graph itself
//!
//! Every backend is selected at construction time and handed to
//! [`crate::LightRag`] behind an `Arc<dyn ...>`.

pub mod memory;
pub mod neo4j;
pub mod qdrant;

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::rag::types::{EntityRecord, RelationRecord};
use crate::Result;

pub use memory::{MemoryGraphStorage, MemoryKvStorage, MemoryVectorStorage};
pub use neo4j::Neo4jGraphStorage;
pub use qdrant::QdrantVectorStorage;

/// Namespaces used by the engine.
pub mod namespace {
    pub const FULL_DOCS: &str = "full_docs";
    pub const TEXT_CHUNKS: &str = "text_chunks";
    pub const LLM_RESPONSE_CACHE: &str = "llm_response_cache";
    pub const ENTITIES: &str = "entities";
    pub const RELATIONSHIPS: &str = "relationships";
    pub const CHUNKS: &str = "chunks";
}

/// Meta key holding the entity name on entity vectors.
pub const META_ENTITY_NAME: &str = "entity_name";
/// Meta key holding the source entity on relationship vectors.
pub const META_SRC_ID: &str = "src_id";
/// Meta key holding the target entity on relationship vectors.
pub const META_TGT_ID: &str = "tgt_id";
/// Meta key holding the parent document on chunk vectors.
pub const META_FULL_DOC_ID: &str = "full_doc_id";

#[async_trait]
pub trait KvStorage<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    async fn all_keys(&self) -> Result<Vec<String>>;

    async fn get_by_id(&self, id: &str) -> Result<Option<T>>;

    /// Values in the order of `ids`; missing keys yield `None`.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<T>>>;

    /// Keys from `keys` that are not stored yet.
    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>>;

    async fn upsert(&self, data: HashMap<String, T>) -> Result<()>;

    async fn index_done_callback(&self) -> Result<()>;
}

/// Text plus string metadata to embed and index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub content: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl VectorRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

/// One ranked hit from [`VectorStorage::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub meta: BTreeMap<String, String>,
}

impl VectorMatch {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

#[async_trait]
pub trait VectorStorage: Send + Sync {
    fn namespace(&self) -> &str;

    /// Top `top_k` records by similarity to `text`, best first.
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<VectorMatch>>;

    async fn upsert(&self, records: HashMap<String, VectorRecord>) -> Result<()>;

    /// Remove the entity vector of `entity_name`.
    async fn delete_entity(&self, entity_name: &str) -> Result<()>;

    /// Remove every relationship vector naming `entity_name` as an endpoint.
    async fn delete_relation(&self, entity_name: &str) -> Result<()>;

    async fn index_done_callback(&self) -> Result<()>;
}

/// Knowledge graph keyed by canonical entity names.
///
/// Edges are undirected for lookup: `has_edge(a, b) == has_edge(b, a)`.
#[async_trait]
pub trait GraphStorage: Send + Sync {
    async fn has_node(&self, name: &str) -> Result<bool>;

    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool>;

    async fn get_node(&self, name: &str) -> Result<Option<EntityRecord>>;

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<RelationRecord>>;

    /// Number of edges touching `name`.
    async fn node_degree(&self, name: &str) -> Result<usize>;

    /// Sum of both endpoint degrees.
    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize>;

    /// Edges touching `name` as `(name, neighbour)` pairs.
    async fn get_node_edges(&self, name: &str) -> Result<Vec<(String, String)>>;

    async fn upsert_node(&self, name: &str, record: EntityRecord) -> Result<()>;

    async fn upsert_edge(&self, src: &str, tgt: &str, record: RelationRecord) -> Result<()>;

    /// Remove a node and its incident edges. Neighbours are left alone.
    async fn delete_node(&self, name: &str) -> Result<()>;

    async fn index_done_callback(&self) -> Result<()>;
}
