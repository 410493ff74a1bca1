//! Vector storage backed by Qdrant.
//!
//! One collection per namespace. Point ids are UUIDs derived from the md5
//! of the record id, and the payload keeps the original id, the content
//! and every meta field at top level so deletes can filter on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    r#match::MatchValue, value::Kind, CreateCollectionBuilder, DeletePointsBuilder, Distance,
    FieldCondition, Filter, Match, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{VectorMatch, VectorRecord, VectorStorage, META_ENTITY_NAME, META_SRC_ID, META_TGT_ID};
use crate::integrations::embeddings::Embedder;
use crate::Result;

pub const DEFAULT_COLLECTION_PREFIX: &str = "lightrag";

const PAYLOAD_ID: &str = "id";
const PAYLOAD_CONTENT: &str = "content";

/// Qdrant point id for a record id.
pub fn point_id(record_id: &str) -> Uuid {
    Uuid::from_bytes(md5::compute(record_id.as_bytes()).0)
}

/// Collection name for a namespace.
pub fn collection_name(prefix: &str, namespace: &str) -> String {
    if prefix.is_empty() {
        namespace.to_string()
    } else {
        format!("{}_{}", prefix, namespace)
    }
}

pub struct QdrantVectorStorage {
    client: Qdrant,
    namespace: String,
    collection: String,
    embedder: Arc<dyn Embedder>,
}

impl QdrantVectorStorage {
    /// Connect and make sure the namespace collection exists.
    pub async fn connect(
        url: &str,
        prefix: &str,
        namespace: impl Into<String>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let client = Qdrant::from_url(url).build()?;
        let namespace = namespace.into();
        let store = Self {
            client,
            collection: collection_name(prefix, &namespace),
            namespace,
            embedder,
        };
        store.init_collection().await?;
        Ok(store)
    }

    async fn init_collection(&self) -> Result<()> {
        let collections = self.client.list_collections().await?;

        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);

        if !exists {
            info!("Creating collection '{}'", self.collection);
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.embedder.dimension() as u64, Distance::Cosine),
                    ),
                )
                .await?;
        } else {
            debug!("Collection '{}' already exists", self.collection);
        }

        Ok(())
    }

    async fn delete_matching(&self, filter: Filter) -> Result<()> {
        self.client
            .delete_points(DeletePointsBuilder::new(&self.collection).points(filter))
            .await?;
        Ok(())
    }
}

fn keyword_condition(key: &str, value: &str) -> FieldCondition {
    FieldCondition {
        key: key.to_string(),
        r#match: Some(Match {
            match_value: Some(MatchValue::Keyword(value.to_string())),
        }),
        ..Default::default()
    }
}

fn payload_for(id: &str, record: &VectorRecord) -> HashMap<String, QdrantValue> {
    let mut payload: HashMap<String, QdrantValue> = HashMap::new();
    payload.insert(PAYLOAD_ID.into(), id.to_string().into());
    payload.insert(PAYLOAD_CONTENT.into(), record.content.clone().into());
    for (key, value) in &record.meta {
        payload.insert(key.clone(), value.clone().into());
    }
    payload
}

fn payload_str(value: &QdrantValue) -> Option<&str> {
    match &value.kind {
        Some(Kind::StringValue(v)) => Some(v),
        _ => None,
    }
}

#[async_trait]
impl VectorStorage for QdrantVectorStorage {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<VectorMatch>> {
        let embedding = self
            .embedder
            .embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, embedding, top_k as u64)
                    .with_payload(true),
            )
            .await?;

        let hits: Vec<VectorMatch> = results
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload;
                let id = payload.get(PAYLOAD_ID).and_then(payload_str)?.to_string();
                let meta: BTreeMap<String, String> = payload
                    .iter()
                    .filter(|(key, _)| key.as_str() != PAYLOAD_ID && key.as_str() != PAYLOAD_CONTENT)
                    .filter_map(|(key, value)| {
                        payload_str(value).map(|v| (key.clone(), v.to_string()))
                    })
                    .collect();
                Some(VectorMatch {
                    id,
                    score: point.score,
                    meta,
                })
            })
            .collect();

        debug!(collection = %self.collection, hits = hits.len(), "Vector query");
        Ok(hits)
    }

    async fn upsert(&self, records: HashMap<String, VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let (ids, records): (Vec<String>, Vec<VectorRecord>) = records.into_iter().unzip();
        let contents: Vec<String> = records.iter().map(|r| r.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&contents).await?;

        let points: Vec<PointStruct> = ids
            .iter()
            .zip(&records)
            .zip(embeddings)
            .map(|((id, record), embedding)| {
                PointStruct::new(
                    point_id(id).to_string(),
                    embedding,
                    payload_for(id, record),
                )
            })
            .collect();

        let count = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points))
            .await?;

        info!(collection = %self.collection, "Upserted {} vectors", count);
        Ok(())
    }

    async fn delete_entity(&self, entity_name: &str) -> Result<()> {
        self.delete_matching(Filter::must([
            keyword_condition(META_ENTITY_NAME, entity_name).into()
        ]))
        .await?;
        debug!(collection = %self.collection, entity = entity_name, "Entity vector deleted");
        Ok(())
    }

    async fn delete_relation(&self, entity_name: &str) -> Result<()> {
        self.delete_matching(Filter::should([
            keyword_condition(META_SRC_ID, entity_name).into(),
            keyword_condition(META_TGT_ID, entity_name).into(),
        ]))
        .await?;
        debug!(collection = %self.collection, entity = entity_name, "Relation vectors deleted");
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        // Qdrant persists on write.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_uuids() {
        let a = point_id("ent-abc");
        assert_eq!(a, point_id("ent-abc"));
        assert_ne!(a, point_id("ent-abd"));
        assert_eq!(a.as_bytes(), &md5::compute(b"ent-abc").0);
    }

    #[test]
    fn collection_names_are_prefixed() {
        assert_eq!(collection_name("lightrag", "entities"), "lightrag_entities");
        assert_eq!(collection_name("", "chunks"), "chunks");
    }

    #[test]
    fn payload_flattens_meta_fields() {
        let record = VectorRecord::new("APPLE makes phones")
            .with_meta(META_ENTITY_NAME, "\"APPLE\"");
        let payload = payload_for("ent-1", &record);

        assert_eq!(payload.get(PAYLOAD_ID).and_then(payload_str), Some("ent-1"));
        assert_eq!(
            payload.get(PAYLOAD_CONTENT).and_then(payload_str),
            Some("APPLE makes phones")
        );
        assert_eq!(
            payload.get(META_ENTITY_NAME).and_then(payload_str),
            Some("\"APPLE\"")
        );
    }

    #[test]
    fn keyword_condition_matches_exact_value() {
        let cond = keyword_condition(META_SRC_ID, "\"APPLE\"");
        assert_eq!(cond.key, META_SRC_ID);
        assert_eq!(
            cond.r#match.and_then(|m| m.match_value),
            Some(MatchValue::Keyword("\"APPLE\"".to_string()))
        );
    }
}
