//! Knowledge graph backed by Neo4j.
//!
//! Entities are `(:Entity {name})` nodes and relationships are `RELATED`
//! edges. Edges are merged without direction so `(a, b)` and `(b, a)`
//! address the same relationship.

use async_trait::async_trait;
use neo4rs::{query, Graph, Query};
use tracing::{debug, info};

use super::GraphStorage;
use crate::integrations::RetryPolicy;
use crate::rag::types::{EntityRecord, RelationRecord};
use crate::{Error, Result};

pub struct Neo4jGraphStorage {
    graph: Graph,
    /// Applied to writes.
    retry: RetryPolicy,
}

fn upsert_node_query(name: &str, record: &EntityRecord) -> Query {
    query(
        "MERGE (n:Entity {name: $name})
         SET n.entity_type = $entity_type,
             n.description = $description,
             n.source_id = $source_id",
    )
    .param("name", name)
    .param("entity_type", record.entity_type.clone())
    .param("description", record.description.clone())
    .param("source_id", record.source_id.clone())
}

fn upsert_edge_query(src: &str, tgt: &str, record: &RelationRecord) -> Query {
    query(
        "MERGE (a:Entity {name: $src})
         MERGE (b:Entity {name: $tgt})
         MERGE (a)-[r:RELATED]-(b)
         SET r.weight = $weight,
             r.description = $description,
             r.keywords = $keywords,
             r.source_id = $source_id",
    )
    .param("src", src)
    .param("tgt", tgt)
    .param("weight", record.weight)
    .param("description", record.description.clone())
    .param("keywords", record.keywords.clone())
    .param("source_id", record.source_id.clone())
}

impl Neo4jGraphStorage {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password).await?;
        let store = Self {
            graph,
            retry: RetryPolicy::default(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run a write, retrying transient failures.
    async fn run_write<F>(&self, build: F) -> Result<()>
    where
        F: Fn() -> Query,
    {
        let build = &build;
        self.retry
            .run(move || async move {
                self.graph.run(build()).await?;
                Ok::<_, Error>(())
            })
            .await
    }

    /// Connect using `NEO4J_URI`, `NEO4J_USER` and `NEO4J_PASSWORD`.
    pub async fn from_env() -> Result<Self> {
        let uri = std::env::var("NEO4J_URI").unwrap_or_else(|_| "bolt://localhost:7687".to_string());
        let user = std::env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string());
        let password = std::env::var("NEO4J_PASSWORD")
            .map_err(|_| Error::Config("NEO4J_PASSWORD not set".to_string()))?;

        Self::connect(&uri, &user, &password).await
    }

    async fn init_schema(&self) -> Result<()> {
        info!("Initializing Neo4j schema...");
        self.graph
            .run(query(
                "CREATE CONSTRAINT entity_name IF NOT EXISTS FOR (e:Entity) REQUIRE e.name IS UNIQUE",
            ))
            .await?;
        Ok(())
    }

    async fn count(&self, q: Query) -> Result<usize> {
        let mut result = self.graph.execute(q).await?;
        if let Some(row) = result.next().await? {
            return Ok(row.get::<i64>("c").unwrap_or(0).max(0) as usize);
        }
        Ok(0)
    }
}

#[async_trait]
impl GraphStorage for Neo4jGraphStorage {
    async fn has_node(&self, name: &str) -> Result<bool> {
        let q = query("MATCH (n:Entity {name: $name}) RETURN count(n) AS c").param("name", name);
        Ok(self.count(q).await? > 0)
    }

    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool> {
        let q = query(
            "MATCH (:Entity {name: $src})-[r:RELATED]-(:Entity {name: $tgt})
             RETURN count(r) AS c",
        )
        .param("src", src)
        .param("tgt", tgt);
        Ok(self.count(q).await? > 0)
    }

    async fn get_node(&self, name: &str) -> Result<Option<EntityRecord>> {
        let q = query(
            "MATCH (n:Entity {name: $name})
             RETURN n.entity_type AS entity_type, n.description AS description,
                    n.source_id AS source_id",
        )
        .param("name", name);

        let mut result = self.graph.execute(q).await?;
        if let Some(row) = result.next().await? {
            return Ok(Some(EntityRecord {
                entity_type: row.get("entity_type").unwrap_or_default(),
                description: row.get("description").unwrap_or_default(),
                source_id: row.get("source_id").unwrap_or_default(),
            }));
        }
        Ok(None)
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<RelationRecord>> {
        let q = query(
            "MATCH (:Entity {name: $src})-[r:RELATED]-(:Entity {name: $tgt})
             RETURN r.weight AS weight, r.description AS description,
                    r.keywords AS keywords, r.source_id AS source_id
             LIMIT 1",
        )
        .param("src", src)
        .param("tgt", tgt);

        let mut result = self.graph.execute(q).await?;
        if let Some(row) = result.next().await? {
            return Ok(Some(RelationRecord {
                weight: row.get::<f64>("weight").unwrap_or(1.0),
                description: row.get("description").unwrap_or_default(),
                keywords: row.get("keywords").unwrap_or_default(),
                source_id: row.get("source_id").unwrap_or_default(),
            }));
        }
        Ok(None)
    }

    async fn node_degree(&self, name: &str) -> Result<usize> {
        let q = query(
            "MATCH (n:Entity {name: $name})
             OPTIONAL MATCH (n)-[r:RELATED]-()
             RETURN count(r) AS c",
        )
        .param("name", name);
        self.count(q).await
    }

    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize> {
        Ok(self.node_degree(src).await? + self.node_degree(tgt).await?)
    }

    async fn get_node_edges(&self, name: &str) -> Result<Vec<(String, String)>> {
        let q = query(
            "MATCH (:Entity {name: $name})-[:RELATED]-(m:Entity)
             RETURN DISTINCT m.name AS neighbour
             ORDER BY neighbour",
        )
        .param("name", name);

        let mut result = self.graph.execute(q).await?;
        let mut edges = Vec::new();
        while let Some(row) = result.next().await? {
            if let Ok(neighbour) = row.get::<String>("neighbour") {
                edges.push((name.to_string(), neighbour));
            }
        }
        Ok(edges)
    }

    async fn upsert_node(&self, name: &str, record: EntityRecord) -> Result<()> {
        self.run_write(|| upsert_node_query(name, &record)).await?;
        debug!(node = name, "Upserted node");
        Ok(())
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, record: RelationRecord) -> Result<()> {
        self.run_write(|| upsert_edge_query(src, tgt, &record)).await?;
        debug!("Upserted edge: {} -- {}", src, tgt);
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.run_write(|| {
            query("MATCH (n:Entity {name: $name}) DETACH DELETE n").param("name", name)
        })
        .await?;
        debug!(node = name, "Node deleted");
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}
