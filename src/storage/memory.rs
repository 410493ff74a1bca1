//! In-process storage backends with optional JSON snapshots.
//!
//! Snapshots live in a working directory as `kv_store_<namespace>.json`,
//! `vdb_<namespace>.json` and `graph_store.json`. They are loaded on
//! construction and rewritten on every `index_done_callback`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{GraphStorage, KvStorage, VectorMatch, VectorRecord, VectorStorage};
use super::{META_SRC_ID, META_TGT_ID};
use crate::integrations::embeddings::{cosine_similarity, Embedder};
use crate::rag::types::{compute_mdhash_id, EntityRecord, RelationRecord};
use crate::Result;

fn load_snapshot<S: DeserializeOwned>(path: &Path) -> Result<Option<S>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

async fn write_snapshot<S: Serialize>(path: &Path, value: &S) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string(value)?;
    tokio::fs::write(path, json).await?;
    debug!(path = %path.display(), "Snapshot written");
    Ok(())
}

/// Hash map KV store.
pub struct MemoryKvStorage<T> {
    namespace: String,
    data: RwLock<HashMap<String, T>>,
    path: Option<PathBuf>,
}

impl<T> MemoryKvStorage<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Volatile store, nothing is persisted.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            data: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Store backed by `<dir>/kv_store_<namespace>.json`.
    pub fn with_working_dir(dir: impl AsRef<Path>, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let path = dir
            .as_ref()
            .join(format!("kv_store_{}.json", namespace));
        let data: HashMap<String, T> = load_snapshot(&path)?.unwrap_or_default();
        info!(namespace = %namespace, records = data.len(), "Loaded KV store");
        Ok(Self {
            namespace,
            data: RwLock::new(data),
            path: Some(path),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl<T> KvStorage<T> for MemoryKvStorage<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().await.keys().cloned().collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<T>> {
        Ok(self.data.read().await.get(id).cloned())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<T>>> {
        let data = self.data.read().await;
        Ok(ids.iter().map(|id| data.get(id).cloned()).collect())
    }

    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>> {
        let data = self.data.read().await;
        Ok(keys
            .iter()
            .filter(|key| !data.contains_key(*key))
            .cloned()
            .collect())
    }

    async fn upsert(&self, data: HashMap<String, T>) -> Result<()> {
        self.data.write().await.extend(data);
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let data = self.data.read().await;
            write_snapshot(path, &*data).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    record: VectorRecord,
    embedding: Vec<f32>,
}

/// Brute-force cosine index over an [`Embedder`].
pub struct MemoryVectorStorage {
    namespace: String,
    embedder: Arc<dyn Embedder>,
    data: RwLock<HashMap<String, StoredVector>>,
    path: Option<PathBuf>,
    min_score: f32,
}

impl MemoryVectorStorage {
    pub fn new(namespace: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            namespace: namespace.into(),
            embedder,
            data: RwLock::new(HashMap::new()),
            path: None,
            min_score: 0.0,
        }
    }

    /// Index backed by `<dir>/vdb_<namespace>.json`.
    pub fn with_working_dir(
        dir: impl AsRef<Path>,
        namespace: impl Into<String>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let path = dir.as_ref().join(format!("vdb_{}.json", namespace));
        let data: HashMap<String, StoredVector> = load_snapshot(&path)?.unwrap_or_default();
        info!(namespace = %namespace, vectors = data.len(), "Loaded vector store");
        Ok(Self {
            namespace,
            embedder,
            data: RwLock::new(data),
            path: Some(path),
            min_score: 0.0,
        })
    }

    /// Hits scoring at or below `min_score` are dropped from results.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.data.read().await.contains_key(id)
    }
}

#[async_trait]
impl VectorStorage for MemoryVectorStorage {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<VectorMatch>> {
        let query_embedding = self
            .embedder
            .embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let data = self.data.read().await;
        let mut scored: Vec<VectorMatch> = data
            .iter()
            .map(|(id, stored)| VectorMatch {
                id: id.clone(),
                score: cosine_similarity(&query_embedding, &stored.embedding),
                meta: stored.record.meta.clone(),
            })
            .filter(|hit| hit.score > self.min_score)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(top_k);
        debug!(namespace = %self.namespace, hits = scored.len(), "Vector query");
        Ok(scored)
    }

    async fn upsert(&self, records: HashMap<String, VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let (ids, records): (Vec<String>, Vec<VectorRecord>) = records.into_iter().unzip();
        let contents: Vec<String> = records.iter().map(|r| r.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&contents).await?;

        let mut data = self.data.write().await;
        for ((id, record), embedding) in ids.into_iter().zip(records).zip(embeddings) {
            data.insert(id, StoredVector { record, embedding });
        }
        debug!(namespace = %self.namespace, total = data.len(), "Vectors upserted");
        Ok(())
    }

    async fn delete_entity(&self, entity_name: &str) -> Result<()> {
        let id = compute_mdhash_id(entity_name, "ent-");
        if self.data.write().await.remove(&id).is_some() {
            debug!(namespace = %self.namespace, entity = entity_name, "Entity vector deleted");
        }
        Ok(())
    }

    async fn delete_relation(&self, entity_name: &str) -> Result<()> {
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|_, stored| {
            let meta = &stored.record.meta;
            meta.get(META_SRC_ID).map(String::as_str) != Some(entity_name)
                && meta.get(META_TGT_ID).map(String::as_str) != Some(entity_name)
        });
        debug!(
            namespace = %self.namespace,
            entity = entity_name,
            removed = before - data.len(),
            "Relation vectors deleted"
        );
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let data = self.data.read().await;
            write_snapshot(path, &*data).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEdge {
    src: String,
    tgt: String,
    #[serde(flatten)]
    record: RelationRecord,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphSnapshot {
    nodes: BTreeMap<String, EntityRecord>,
    edges: Vec<StoredEdge>,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: HashMap<String, EntityRecord>,
    edges: HashMap<(String, String), StoredEdge>,
    adjacency: HashMap<String, BTreeSet<String>>,
}

impl GraphState {
    fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut state = GraphState {
            nodes: snapshot.nodes.into_iter().collect(),
            ..Default::default()
        };
        for edge in snapshot.edges {
            state.insert_edge(edge);
        }
        state
    }

    fn to_snapshot(&self) -> GraphSnapshot {
        let mut edges: Vec<StoredEdge> = self.edges.values().cloned().collect();
        edges.sort_by(|a, b| (&a.src, &a.tgt).cmp(&(&b.src, &b.tgt)));
        GraphSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            edges,
        }
    }

    fn insert_edge(&mut self, edge: StoredEdge) {
        self.adjacency
            .entry(edge.src.clone())
            .or_default()
            .insert(edge.tgt.clone());
        self.adjacency
            .entry(edge.tgt.clone())
            .or_default()
            .insert(edge.src.clone());
        self.edges.insert(edge_key(&edge.src, &edge.tgt), edge);
    }

    fn degree(&self, name: &str) -> usize {
        self.adjacency.get(name).map_or(0, BTreeSet::len)
    }
}

fn edge_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Adjacency-map knowledge graph.
pub struct MemoryGraphStorage {
    state: RwLock<GraphState>,
    path: Option<PathBuf>,
}

impl Default for MemoryGraphStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            path: None,
        }
    }

    /// Graph backed by `<dir>/graph_store.json`.
    pub fn with_working_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join("graph_store.json");
        let state = load_snapshot::<GraphSnapshot>(&path)?
            .map(GraphState::from_snapshot)
            .unwrap_or_default();
        info!(
            nodes = state.nodes.len(),
            edges = state.edges.len(),
            "Loaded graph store"
        );
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    pub async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.state.read().await.edges.len()
    }

    /// All node names, sorted.
    pub async fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.nodes.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl GraphStorage for MemoryGraphStorage {
    async fn has_node(&self, name: &str) -> Result<bool> {
        Ok(self.state.read().await.nodes.contains_key(name))
    }

    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool> {
        Ok(self.state.read().await.edges.contains_key(&edge_key(src, tgt)))
    }

    async fn get_node(&self, name: &str) -> Result<Option<EntityRecord>> {
        Ok(self.state.read().await.nodes.get(name).cloned())
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<RelationRecord>> {
        Ok(self
            .state
            .read()
            .await
            .edges
            .get(&edge_key(src, tgt))
            .map(|edge| edge.record.clone()))
    }

    async fn node_degree(&self, name: &str) -> Result<usize> {
        Ok(self.state.read().await.degree(name))
    }

    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.degree(src) + state.degree(tgt))
    }

    async fn get_node_edges(&self, name: &str) -> Result<Vec<(String, String)>> {
        let state = self.state.read().await;
        Ok(state
            .adjacency
            .get(name)
            .map(|neighbours| {
                neighbours
                    .iter()
                    .map(|n| (name.to_string(), n.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_node(&self, name: &str, record: EntityRecord) -> Result<()> {
        self.state
            .write()
            .await
            .nodes
            .insert(name.to_string(), record);
        Ok(())
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, record: RelationRecord) -> Result<()> {
        self.state.write().await.insert_edge(StoredEdge {
            src: src.to_string(),
            tgt: tgt.to_string(),
            record,
        });
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.nodes.remove(name);
        if let Some(neighbours) = state.adjacency.remove(name) {
            for neighbour in neighbours {
                state.edges.remove(&edge_key(name, &neighbour));
                if let Some(set) = state.adjacency.get_mut(&neighbour) {
                    set.remove(name);
                }
            }
        }
        debug!(node = name, "Node deleted");
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let snapshot = self.state.read().await.to_snapshot();
            write_snapshot(path, &snapshot).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::embeddings::HashEmbedder;
    use crate::rag::types::FullDocument;
    use tempfile::tempdir;

    fn entity(entity_type: &str) -> EntityRecord {
        EntityRecord {
            entity_type: entity_type.to_string(),
            description: format!("a {}", entity_type),
            source_id: "chunk-1".to_string(),
        }
    }

    fn relation(weight: f64) -> RelationRecord {
        RelationRecord {
            weight,
            description: "related".to_string(),
            keywords: "kw".to_string(),
            source_id: "chunk-1".to_string(),
        }
    }

    #[tokio::test]
    async fn kv_filter_keys_returns_absent_keys() {
        let kv = MemoryKvStorage::<FullDocument>::new("docs");
        kv.upsert(HashMap::from([(
            "doc-1".to_string(),
            FullDocument {
                content: "hello".to_string(),
            },
        )]))
        .await
        .unwrap();

        let absent = kv
            .filter_keys(&["doc-1".to_string(), "doc-2".to_string()])
            .await
            .unwrap();
        assert_eq!(absent, HashSet::from(["doc-2".to_string()]));

        let values = kv
            .get_by_ids(&["doc-2".to_string(), "doc-1".to_string()])
            .await
            .unwrap();
        assert!(values[0].is_none());
        assert_eq!(values[1].as_ref().unwrap().content, "hello");
    }

    #[tokio::test]
    async fn kv_snapshot_round_trips_through_working_dir() {
        let dir = tempdir().unwrap();
        let kv = MemoryKvStorage::<FullDocument>::with_working_dir(dir.path(), "full_docs").unwrap();
        kv.upsert(HashMap::from([(
            "doc-1".to_string(),
            FullDocument {
                content: "persisted".to_string(),
            },
        )]))
        .await
        .unwrap();
        kv.index_done_callback().await.unwrap();
        assert!(dir.path().join("kv_store_full_docs.json").exists());

        let reloaded =
            MemoryKvStorage::<FullDocument>::with_working_dir(dir.path(), "full_docs").unwrap();
        let doc = reloaded.get_by_id("doc-1").await.unwrap().unwrap();
        assert_eq!(doc.content, "persisted");
    }

    #[tokio::test]
    async fn graph_edges_are_undirected_for_lookup() {
        let graph = MemoryGraphStorage::new();
        graph.upsert_node("\"A\"", entity("PERSON")).await.unwrap();
        graph.upsert_node("\"B\"", entity("PERSON")).await.unwrap();
        graph.upsert_edge("\"A\"", "\"B\"", relation(2.0)).await.unwrap();

        assert!(graph.has_edge("\"B\"", "\"A\"").await.unwrap());
        assert_eq!(
            graph.get_edge("\"B\"", "\"A\"").await.unwrap().unwrap().weight,
            2.0
        );
        assert_eq!(
            graph.get_node_edges("\"B\"").await.unwrap(),
            vec![("\"B\"".to_string(), "\"A\"".to_string())]
        );
    }

    #[tokio::test]
    async fn graph_degrees_count_incident_edges() {
        let graph = MemoryGraphStorage::new();
        for name in ["\"A\"", "\"B\"", "\"C\""] {
            graph.upsert_node(name, entity("ORG")).await.unwrap();
        }
        graph.upsert_edge("\"A\"", "\"B\"", relation(1.0)).await.unwrap();
        graph.upsert_edge("\"A\"", "\"C\"", relation(1.0)).await.unwrap();
        // re-upserting the same pair does not add a second edge
        graph.upsert_edge("\"B\"", "\"A\"", relation(3.0)).await.unwrap();

        assert_eq!(graph.node_degree("\"A\"").await.unwrap(), 2);
        assert_eq!(graph.node_degree("\"B\"").await.unwrap(), 1);
        assert_eq!(graph.edge_degree("\"A\"", "\"B\"").await.unwrap(), 3);
        assert_eq!(graph.node_degree("\"MISSING\"").await.unwrap(), 0);
        assert_eq!(graph.edge_count().await, 2);
    }

    #[tokio::test]
    async fn graph_delete_node_removes_incident_edges_only() {
        let graph = MemoryGraphStorage::new();
        for name in ["\"A\"", "\"B\"", "\"C\""] {
            graph.upsert_node(name, entity("ORG")).await.unwrap();
        }
        graph.upsert_edge("\"A\"", "\"B\"", relation(1.0)).await.unwrap();
        graph.upsert_edge("\"B\"", "\"C\"", relation(1.0)).await.unwrap();

        graph.delete_node("\"A\"").await.unwrap();

        assert!(!graph.has_node("\"A\"").await.unwrap());
        assert!(graph.has_node("\"B\"").await.unwrap());
        assert!(!graph.has_edge("\"A\"", "\"B\"").await.unwrap());
        assert!(graph.has_edge("\"B\"", "\"C\"").await.unwrap());
        assert_eq!(graph.node_degree("\"B\"").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn graph_snapshot_restores_adjacency() {
        let dir = tempdir().unwrap();
        let graph = MemoryGraphStorage::with_working_dir(dir.path()).unwrap();
        graph.upsert_node("\"A\"", entity("ORG")).await.unwrap();
        graph.upsert_node("\"B\"", entity("ORG")).await.unwrap();
        graph.upsert_edge("\"A\"", "\"B\"", relation(1.5)).await.unwrap();
        graph.index_done_callback().await.unwrap();

        let reloaded = MemoryGraphStorage::with_working_dir(dir.path()).unwrap();
        assert_eq!(reloaded.node_count().await, 2);
        assert_eq!(reloaded.node_degree("\"B\"").await.unwrap(), 1);
        assert_eq!(
            reloaded.get_edge("\"A\"", "\"B\"").await.unwrap().unwrap().weight,
            1.5
        );
    }

    #[tokio::test]
    async fn vector_query_ranks_by_similarity() {
        let vdb = MemoryVectorStorage::new("chunks", Arc::new(HashEmbedder::new(64)));
        vdb.upsert(HashMap::from([
            (
                "a".to_string(),
                VectorRecord::new("rust programming language"),
            ),
            ("b".to_string(), VectorRecord::new("gardening on weekends")),
        ]))
        .await
        .unwrap();

        let hits = vdb.query("rust language", 5).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert!(hits.iter().all(|h| h.score > 0.0));

        let limited = vdb.query("rust language", 0).await.unwrap();
        assert!(limited.is_empty());
    }

    #[tokio::test]
    async fn vector_delete_relation_matches_either_endpoint() {
        let vdb = MemoryVectorStorage::new("relationships", Arc::new(HashEmbedder::new(32)));
        vdb.upsert(HashMap::from([
            (
                "rel-1".to_string(),
                VectorRecord::new("x")
                    .with_meta(META_SRC_ID, "\"A\"")
                    .with_meta(META_TGT_ID, "\"B\""),
            ),
            (
                "rel-2".to_string(),
                VectorRecord::new("y")
                    .with_meta(META_SRC_ID, "\"C\"")
                    .with_meta(META_TGT_ID, "\"A\""),
            ),
            (
                "rel-3".to_string(),
                VectorRecord::new("z")
                    .with_meta(META_SRC_ID, "\"B\"")
                    .with_meta(META_TGT_ID, "\"C\""),
            ),
        ]))
        .await
        .unwrap();

        vdb.delete_relation("\"A\"").await.unwrap();

        assert_eq!(vdb.len().await, 1);
        assert!(vdb.contains("rel-3").await);
    }

    #[tokio::test]
    async fn vector_delete_entity_uses_name_hash() {
        let vdb = MemoryVectorStorage::new("entities", Arc::new(HashEmbedder::new(32)));
        let id = compute_mdhash_id("\"A\"", "ent-");
        vdb.upsert(HashMap::from([(id.clone(), VectorRecord::new("\"A\" desc"))]))
            .await
            .unwrap();

        vdb.delete_entity("\"A\"").await.unwrap();
        assert!(!vdb.contains(&id).await);
    }
}
