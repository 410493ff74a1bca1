//! Retrieval context builder.
//!
//! Builds the entity / relationship / source tables handed to the final
//! completion. Four strategies are supported:
//! - naive: raw chunk similarity, no graph access
//! - local: entity hits and their one-hop neighbourhood
//! - global: relationship hits and their endpoints
//! - hybrid: both, merged line by line
//!
//! Every table is cut to a token budget with [`truncate_by_token_budget`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{try_join, try_join_all};
use tracing::{debug, info, warn};

use super::query::QueryParam;
use super::tokenizer::Tokenizer;
use super::types::{split_field, EntityRecord, RelationRecord, TextChunk};
use crate::storage::{
    GraphStorage, KvStorage, VectorStorage, META_ENTITY_NAME, META_SRC_ID, META_TGT_ID,
};
use crate::{Error, Result};

/// Separator between chunks in a naive context.
pub const CHUNK_SEPARATOR: &str = "\n--New Chunk--\n";

const ENTITY_HEADER: [&str; 5] = ["id", "entity", "type", "description", "rank"];
const RELATION_HEADER: [&str; 7] = [
    "id",
    "source",
    "target",
    "description",
    "keywords",
    "weight",
    "rank",
];
const SOURCE_HEADER: [&str; 2] = ["id", "content"];

/// Greedy prefix of `items` whose `key` token counts fit in `max_tokens`.
///
/// Stops at the first item that would overflow, later items are never
/// considered.
pub fn truncate_by_token_budget<T, F>(
    items: Vec<T>,
    key: F,
    max_tokens: usize,
    tokenizer: &dyn Tokenizer,
) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut total = 0;
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        total += tokenizer.count_tokens(key(&item));
        if total > max_tokens {
            break;
        }
        kept.push(item);
    }
    kept
}

/// Render rows as CSV with a header line.
pub fn csv_table<I>(header: &[&str], rows: I) -> Result<String>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(&row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::SerializationError(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|e| Error::SerializationError(e.to_string()))?;
    Ok(text.trim_end().to_string())
}

/// Distinct non-empty lines of `first` then `second`, first occurrence kept.
pub fn union_lines(first: &str, second: &str) -> String {
    let mut seen = HashSet::new();
    first
        .lines()
        .chain(second.lines())
        .filter(|line| !line.trim().is_empty())
        .filter(|line| seen.insert(*line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The three CSV tables of a graph context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextTables {
    pub entities: String,
    pub relationships: String,
    pub sources: String,
}

impl ContextTables {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.sources.is_empty()
    }

    /// Wrap the tables into the context block, `None` when all are empty.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        Some(format!(
            "\n-----Entities-----\n```csv\n{}\n```\n-----Relationships-----\n```csv\n{}\n```\n-----Sources-----\n```csv\n{}\n```\n",
            self.entities, self.relationships, self.sources
        ))
    }
}

/// Merge high-level and low-level tables, high-level lines first.
pub fn combine_contexts(high: &ContextTables, low: &ContextTables) -> ContextTables {
    ContextTables {
        entities: union_lines(&high.entities, &low.entities),
        relationships: union_lines(&high.relationships, &low.relationships),
        sources: union_lines(&high.sources, &low.sources),
    }
}

#[derive(Debug, Clone)]
struct RankedNode {
    name: String,
    record: EntityRecord,
    rank: usize,
}

#[derive(Debug, Clone)]
struct RankedEdge {
    src: String,
    tgt: String,
    record: RelationRecord,
    rank: usize,
}

fn sort_edges(edges: &mut [RankedEdge]) {
    edges.sort_by(|a, b| {
        b.rank.cmp(&a.rank).then_with(|| {
            b.record
                .weight
                .partial_cmp(&a.record.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
}

fn or_unknown(value: &str) -> String {
    if value.is_empty() {
        "UNKNOWN".to_string()
    } else {
        value.to_string()
    }
}

fn entity_rows(nodes: &[RankedNode]) -> Vec<Vec<String>> {
    nodes
        .iter()
        .enumerate()
        .map(|(i, n)| {
            vec![
                i.to_string(),
                n.name.clone(),
                or_unknown(&n.record.entity_type),
                or_unknown(&n.record.description),
                n.rank.to_string(),
            ]
        })
        .collect()
}

fn relation_rows(edges: &[RankedEdge]) -> Vec<Vec<String>> {
    edges
        .iter()
        .enumerate()
        .map(|(i, e)| {
            vec![
                i.to_string(),
                e.src.clone(),
                e.tgt.clone(),
                e.record.description.clone(),
                e.record.keywords.clone(),
                e.record.weight.to_string(),
                e.rank.to_string(),
            ]
        })
        .collect()
}

fn source_rows(chunks: &[TextChunk]) -> Vec<Vec<String>> {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| vec![i.to_string(), c.content.clone()])
        .collect()
}

fn build_tables(
    nodes: &[RankedNode],
    edges: &[RankedEdge],
    chunks: &[TextChunk],
) -> Result<ContextTables> {
    Ok(ContextTables {
        entities: csv_table(&ENTITY_HEADER, entity_rows(nodes))?,
        relationships: csv_table(&RELATION_HEADER, relation_rows(edges))?,
        sources: csv_table(&SOURCE_HEADER, source_rows(chunks))?,
    })
}

/// Reads the committed graph, indices and chunk store to build contexts.
pub struct ContextBuilder {
    graph: Arc<dyn GraphStorage>,
    entities_vdb: Arc<dyn VectorStorage>,
    relationships_vdb: Arc<dyn VectorStorage>,
    chunks_vdb: Arc<dyn VectorStorage>,
    text_chunks: Arc<dyn KvStorage<TextChunk>>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl ContextBuilder {
    pub fn new(
        graph: Arc<dyn GraphStorage>,
        entities_vdb: Arc<dyn VectorStorage>,
        relationships_vdb: Arc<dyn VectorStorage>,
        chunks_vdb: Arc<dyn VectorStorage>,
        text_chunks: Arc<dyn KvStorage<TextChunk>>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Self {
            graph,
            entities_vdb,
            relationships_vdb,
            chunks_vdb,
            text_chunks,
            tokenizer,
        }
    }

    /// Chunk contents most similar to `query`, joined by [`CHUNK_SEPARATOR`].
    pub async fn naive_context(&self, query: &str, param: &QueryParam) -> Result<Option<String>> {
        let hits = self.chunks_vdb.query(query, param.top_k).await?;
        if hits.is_empty() {
            return Ok(None);
        }

        let ids: Vec<String> = hits.into_iter().map(|h| h.id).collect();
        let chunks: Vec<TextChunk> = self
            .text_chunks
            .get_by_ids(&ids)
            .await?
            .into_iter()
            .flatten()
            .collect();
        let found = chunks.len();
        let chunks = truncate_by_token_budget(
            chunks,
            |c| c.content.as_str(),
            param.max_token_for_text_unit,
            self.tokenizer.as_ref(),
        );
        info!("Truncate {} to {} chunks", found, chunks.len());

        if chunks.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join(CHUNK_SEPARATOR),
        ))
    }

    async fn ranked_node(&self, name: String) -> Result<Option<RankedNode>> {
        let (record, rank) =
            try_join(self.graph.get_node(&name), self.graph.node_degree(&name)).await?;
        Ok(record.map(|record| RankedNode { name, record, rank }))
    }

    async fn ranked_edge(&self, src: String, tgt: String) -> Result<Option<RankedEdge>> {
        let (record, rank) = try_join(
            self.graph.get_edge(&src, &tgt),
            self.graph.edge_degree(&src, &tgt),
        )
        .await?;
        Ok(record.map(|record| RankedEdge {
            src,
            tgt,
            record,
            rank,
        }))
    }

    /// Entity-centred tables for low-level keywords.
    pub async fn local_context(&self, keywords: &str, param: &QueryParam) -> Result<ContextTables> {
        let hits = self.entities_vdb.query(keywords, param.top_k).await?;
        if hits.is_empty() {
            return Ok(ContextTables::default());
        }

        let names: Vec<String> = hits
            .iter()
            .filter_map(|h| h.meta(META_ENTITY_NAME).map(str::to_string))
            .collect();
        let nodes: Vec<RankedNode> = try_join_all(names.into_iter().map(|n| self.ranked_node(n)))
            .await?
            .into_iter()
            .flatten()
            .collect();
        if nodes.len() < hits.len() {
            warn!(
                missing = hits.len() - nodes.len(),
                "Some entity hits are missing from the graph"
            );
        }

        let node_edges: Vec<Vec<(String, String)>> =
            try_join_all(nodes.iter().map(|n| self.graph.get_node_edges(&n.name))).await?;

        let chunks = self
            .text_units_from_entities(&nodes, &node_edges, param)
            .await?;
        let edges = self.edges_from_entities(&node_edges, param).await?;

        info!(
            "Local query uses {} entities, {} relations, {} text units",
            nodes.len(),
            edges.len(),
            chunks.len()
        );
        build_tables(&nodes, &edges, &chunks)
    }

    /// Chunks cited by the entities, ranked by entity order then by how many
    /// one-hop neighbours cite the same chunk.
    async fn text_units_from_entities(
        &self,
        nodes: &[RankedNode],
        node_edges: &[Vec<(String, String)>],
        param: &QueryParam,
    ) -> Result<Vec<TextChunk>> {
        let mut neighbours: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for (_, neighbour) in node_edges.iter().flatten() {
            if seen.insert(neighbour.clone()) {
                neighbours.push(neighbour.clone());
            }
        }
        let neighbour_records =
            try_join_all(neighbours.iter().map(|n| self.graph.get_node(n))).await?;
        let neighbour_sources: HashMap<&str, HashSet<String>> = neighbours
            .iter()
            .zip(neighbour_records)
            .map(|(name, record)| {
                let sources = record
                    .map(|r| split_field(&r.source_id).into_iter().collect())
                    .unwrap_or_default();
                (name.as_str(), sources)
            })
            .collect();

        // (chunk id, entity order, relation count), first insertion wins.
        let mut units: Vec<(String, usize, usize)> = Vec::new();
        let mut indexed: HashSet<String> = HashSet::new();
        for (order, (node, edges)) in nodes.iter().zip(node_edges).enumerate() {
            for chunk_id in split_field(&node.record.source_id) {
                if !indexed.insert(chunk_id.clone()) {
                    continue;
                }
                let relation_counts = edges
                    .iter()
                    .filter(|(_, neighbour)| {
                        neighbour_sources
                            .get(neighbour.as_str())
                            .is_some_and(|sources| sources.contains(&chunk_id))
                    })
                    .count();
                units.push((chunk_id, order, relation_counts));
            }
        }

        let ids: Vec<String> = units.iter().map(|(id, _, _)| id.clone()).collect();
        let stored = self.text_chunks.get_by_ids(&ids).await?;
        let mut ranked: Vec<(TextChunk, usize, usize)> = units
            .into_iter()
            .zip(stored)
            .filter_map(|((_, order, count), chunk)| chunk.map(|c| (c, order, count)))
            .filter(|(c, _, _)| !c.content.is_empty())
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)));

        let ranked = truncate_by_token_budget(
            ranked,
            |(c, _, _)| c.content.as_str(),
            param.max_token_for_text_unit,
            self.tokenizer.as_ref(),
        );
        Ok(ranked.into_iter().map(|(c, _, _)| c).collect())
    }

    /// Distinct one-hop edges of the entities, by (degree, weight).
    async fn edges_from_entities(
        &self,
        node_edges: &[Vec<(String, String)>],
        param: &QueryParam,
    ) -> Result<Vec<RankedEdge>> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut seen = HashSet::new();
        for (a, b) in node_edges.iter().flatten() {
            let key = if a <= b {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };
            if seen.insert(key) {
                pairs.push((a.clone(), b.clone()));
            }
        }

        let mut edges: Vec<RankedEdge> =
            try_join_all(pairs.into_iter().map(|(a, b)| self.ranked_edge(a, b)))
                .await?
                .into_iter()
                .flatten()
                .collect();
        sort_edges(&mut edges);

        Ok(truncate_by_token_budget(
            edges,
            |e| e.record.description.as_str(),
            param.max_token_for_local_context,
            self.tokenizer.as_ref(),
        ))
    }

    /// Relationship-centred tables for high-level keywords.
    pub async fn global_context(&self, keywords: &str, param: &QueryParam) -> Result<ContextTables> {
        let hits = self.relationships_vdb.query(keywords, param.top_k).await?;
        if hits.is_empty() {
            return Ok(ContextTables::default());
        }

        let pairs: Vec<(String, String)> = hits
            .iter()
            .filter_map(|h| {
                Some((
                    h.meta(META_SRC_ID)?.to_string(),
                    h.meta(META_TGT_ID)?.to_string(),
                ))
            })
            .collect();
        let mut edges: Vec<RankedEdge> =
            try_join_all(pairs.into_iter().map(|(s, t)| self.ranked_edge(s, t)))
                .await?
                .into_iter()
                .flatten()
                .collect();
        sort_edges(&mut edges);
        let edges = truncate_by_token_budget(
            edges,
            |e| e.record.description.as_str(),
            param.max_token_for_global_context,
            self.tokenizer.as_ref(),
        );

        let nodes = self.entities_from_edges(&edges, param).await?;
        let chunks = self.text_units_from_edges(&edges, param).await?;

        info!(
            "Global query uses {} entities, {} relations, {} text units",
            nodes.len(),
            edges.len(),
            chunks.len()
        );
        build_tables(&nodes, &edges, &chunks)
    }

    async fn entities_from_edges(
        &self,
        edges: &[RankedEdge],
        param: &QueryParam,
    ) -> Result<Vec<RankedNode>> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        for edge in edges {
            for name in [&edge.src, &edge.tgt] {
                if seen.insert(name.clone()) {
                    names.push(name.clone());
                }
            }
        }

        let nodes: Vec<RankedNode> = try_join_all(names.into_iter().map(|n| self.ranked_node(n)))
            .await?
            .into_iter()
            .flatten()
            .collect();

        Ok(truncate_by_token_budget(
            nodes,
            |n| n.record.description.as_str(),
            param.max_token_for_local_context,
            self.tokenizer.as_ref(),
        ))
    }

    async fn text_units_from_edges(
        &self,
        edges: &[RankedEdge],
        param: &QueryParam,
    ) -> Result<Vec<TextChunk>> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        for edge in edges {
            for chunk_id in split_field(&edge.record.source_id) {
                if seen.insert(chunk_id.clone()) {
                    ids.push(chunk_id);
                }
            }
        }

        let chunks: Vec<TextChunk> = self
            .text_chunks
            .get_by_ids(&ids)
            .await?
            .into_iter()
            .flatten()
            .filter(|c| !c.content.is_empty())
            .collect();

        Ok(truncate_by_token_budget(
            chunks,
            |c| c.content.as_str(),
            param.max_token_for_text_unit,
            self.tokenizer.as_ref(),
        ))
    }

    /// Run both branches and merge their tables.
    pub async fn hybrid_context(
        &self,
        low_level: &str,
        high_level: &str,
        param: &QueryParam,
    ) -> Result<ContextTables> {
        let (low, high) = try_join(
            self.local_context(low_level, param),
            self.global_context(high_level, param),
        )
        .await?;

        if low.is_empty() {
            warn!("Low level context is empty, continuing with high level context only");
        }
        if high.is_empty() {
            warn!("High level context is empty, continuing with low level context only");
        }
        debug!(
            low_empty = low.is_empty(),
            high_empty = high.is_empty(),
            "Combining hybrid contexts"
        );

        Ok(combine_contexts(&high, &low))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::tokenizer::RegexTokenizer;
    use crate::rag::types::GRAPH_FIELD_SEP;
    use crate::storage::{MemoryGraphStorage, MemoryKvStorage, VectorMatch, VectorRecord};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Returns the same hits, best first, whatever the query.
    struct FixedHits {
        hits: Vec<VectorMatch>,
    }

    impl FixedHits {
        fn new(metas: Vec<Vec<(&str, &str)>>) -> Self {
            let hits = metas
                .into_iter()
                .enumerate()
                .map(|(i, meta)| VectorMatch {
                    id: format!("hit-{}", i),
                    score: 1.0 - i as f32 * 0.1,
                    meta: meta
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                })
                .collect();
            Self { hits }
        }
    }

    #[async_trait]
    impl VectorStorage for FixedHits {
        fn namespace(&self) -> &str {
            "fixed"
        }

        async fn query(&self, _text: &str, top_k: usize) -> Result<Vec<VectorMatch>> {
            Ok(self.hits.iter().take(top_k).cloned().collect())
        }

        async fn upsert(&self, _records: HashMap<String, VectorRecord>) -> Result<()> {
            Ok(())
        }

        async fn delete_entity(&self, _entity_name: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_relation(&self, _entity_name: &str) -> Result<()> {
            Ok(())
        }

        async fn index_done_callback(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Graph with known degrees:
    /// A: {N1, N2}, B: {N2, N3}, N2: {A, B}, N1: {A}, N3: {B}.
    async fn ranked_graph() -> ContextBuilder {
        let graph = Arc::new(MemoryGraphStorage::new());
        let node = |sources: &[&str]| EntityRecord {
            entity_type: "ORGANIZATION".to_string(),
            description: "node".to_string(),
            source_id: sources.join(GRAPH_FIELD_SEP),
        };
        graph.upsert_node("A", node(&["c1", "c2"])).await.unwrap();
        graph.upsert_node("B", node(&["c3"])).await.unwrap();
        graph.upsert_node("N1", node(&["c2"])).await.unwrap();
        graph.upsert_node("N2", node(&["c2", "c3"])).await.unwrap();
        graph.upsert_node("N3", node(&["c9"])).await.unwrap();

        let edge = |weight: f64, description: &str, source: &str| RelationRecord {
            weight,
            description: description.to_string(),
            keywords: "kw".to_string(),
            source_id: source.to_string(),
        };
        graph.upsert_edge("A", "N1", edge(1.0, "a-n1", "c1")).await.unwrap();
        graph.upsert_edge("A", "N2", edge(2.0, "a-n2", "c2")).await.unwrap();
        graph.upsert_edge("B", "N2", edge(3.0, "b-n2", "c3")).await.unwrap();
        graph.upsert_edge("B", "N3", edge(5.0, "b-n3", "c3")).await.unwrap();

        let text_chunks = Arc::new(MemoryKvStorage::<TextChunk>::new("text_chunks"));
        let chunk = |id: &str, content: &str| {
            (
                id.to_string(),
                TextChunk {
                    id: id.to_string(),
                    content: content.to_string(),
                    tokens: 2,
                    chunk_order_index: 0,
                    full_doc_id: "doc".to_string(),
                },
            )
        };
        text_chunks
            .upsert(HashMap::from([
                chunk("c1", "alpha one"),
                chunk("c2", "alpha two"),
                chunk("c3", "beta three"),
            ]))
            .await
            .unwrap();

        let entities = FixedHits::new(vec![
            vec![(META_ENTITY_NAME, "A")],
            vec![(META_ENTITY_NAME, "B")],
        ]);
        let relationships = FixedHits::new(vec![
            vec![(META_SRC_ID, "A"), (META_TGT_ID, "N1")],
            vec![(META_SRC_ID, "B"), (META_TGT_ID, "N2")],
            vec![(META_SRC_ID, "A"), (META_TGT_ID, "N2")],
        ]);

        ContextBuilder::new(
            graph,
            Arc::new(entities),
            Arc::new(relationships),
            Arc::new(FixedHits::new(Vec::new())),
            text_chunks,
            Arc::new(RegexTokenizer::new()),
        )
    }

    /// Column `index` of every data row.
    fn column(table: &str, index: usize) -> Vec<String> {
        table
            .lines()
            .skip(1)
            .map(|line| line.split(',').nth(index).unwrap_or_default().to_string())
            .collect()
    }

    fn endpoints(table: &str) -> Vec<String> {
        column(table, 1)
            .into_iter()
            .zip(column(table, 2))
            .map(|(a, b)| format!("{}-{}", a, b))
            .collect()
    }

    #[tokio::test]
    async fn local_sources_follow_entity_order_then_co_references() {
        let builder = ranked_graph().await;
        let tables = builder
            .local_context("a b", &QueryParam::default())
            .await
            .unwrap();

        // c2 is cited by both of A's neighbours, c1 by none; B's c3 comes last.
        assert_eq!(
            tables.sources,
            "id,content\n0,alpha two\n1,alpha one\n2,beta three"
        );
        assert_eq!(column(&tables.entities, 1), vec!["A", "B"]);
        assert_eq!(column(&tables.entities, 4), vec!["2", "2"]);
    }

    #[tokio::test]
    async fn local_relations_sort_by_degree_then_weight() {
        let builder = ranked_graph().await;
        let tables = builder
            .local_context("a b", &QueryParam::default())
            .await
            .unwrap();

        assert_eq!(
            column(&tables.relationships, 3),
            vec!["b-n2", "a-n2", "b-n3", "a-n1"]
        );
        assert_eq!(column(&tables.relationships, 6), vec!["4", "4", "3", "3"]);
    }

    #[tokio::test]
    async fn global_orders_edges_and_derives_entities_in_edge_order() {
        let builder = ranked_graph().await;
        let tables = builder
            .global_context("themes", &QueryParam::default())
            .await
            .unwrap();

        assert_eq!(endpoints(&tables.relationships), vec!["B-N2", "A-N2", "A-N1"]);
        assert_eq!(column(&tables.relationships, 6), vec!["4", "4", "3"]);
        assert_eq!(column(&tables.entities, 1), vec!["B", "N2", "A", "N1"]);
        assert_eq!(
            tables.sources,
            "id,content\n0,beta three\n1,alpha two\n2,alpha one"
        );
    }

    #[tokio::test]
    async fn hybrid_keeps_each_distinct_line_once() {
        let builder = ranked_graph().await;
        let param = QueryParam::default();
        let local = builder.local_context("a b", &param).await.unwrap();
        let global = builder.global_context("themes", &param).await.unwrap();
        let hybrid = builder.hybrid_context("a b", "themes", &param).await.unwrap();

        for (high, low, combined) in [
            (&global.entities, &local.entities, &hybrid.entities),
            (&global.relationships, &local.relationships, &hybrid.relationships),
            (&global.sources, &local.sources, &hybrid.sources),
        ] {
            let lines: Vec<&str> = combined.lines().collect();
            let distinct: HashSet<&str> = lines.iter().copied().collect();
            assert_eq!(lines.len(), distinct.len(), "duplicate line in {:?}", combined);

            let expected: HashSet<&str> = high.lines().chain(low.lines()).collect();
            assert_eq!(distinct, expected);
            // High-level lines lead.
            assert!(combined.starts_with(high.as_str()));
        }

        // B-N2 and A-N2 render identically in both branches.
        assert_eq!(hybrid.relationships.lines().count(), 6);
    }

    #[test]
    fn truncation_stops_at_first_overflow() {
        let tok = RegexTokenizer::new();
        let items = vec!["one two", "three four five", "six", "seven"];
        let kept = truncate_by_token_budget(items, |s| *s, 5, &tok);
        assert_eq!(kept, vec!["one two", "three four five"]);

        // "six" alone would fit after the overflow, but is not considered.
        let items = vec!["one two", "three four five six", "seven"];
        let kept = truncate_by_token_budget(items, |s| *s, 5, &tok);
        assert_eq!(kept, vec!["one two"]);
    }

    #[test]
    fn truncation_never_exceeds_budget() {
        let tok = RegexTokenizer::new();
        let items: Vec<String> = (1..20).map(|n| "w ".repeat(n)).collect();
        for budget in [0, 1, 7, 30, 100] {
            let kept = truncate_by_token_budget(items.clone(), |s| s.as_str(), budget, &tok);
            let used: usize = kept.iter().map(|s| tok.count_tokens(s)).sum();
            assert!(used <= budget);
            if let Some(next) = items.get(kept.len()) {
                assert!(used + tok.count_tokens(next) > budget);
            }
        }
    }

    #[test]
    fn csv_table_quotes_fields() {
        let table = csv_table(
            &["id", "content"],
            vec![vec!["0".to_string(), "hello, \"world\"".to_string()]],
        )
        .unwrap();
        assert_eq!(table, "id,content\n0,\"hello, \"\"world\"\"\"");
    }

    #[test]
    fn union_lines_keeps_first_occurrence() {
        let high = "id,entity\n0,A\n1,B";
        let low = "id,entity\n0,A\n1,C";
        assert_eq!(union_lines(high, low), "id,entity\n0,A\n1,B\n1,C");
        assert_eq!(union_lines("", low), low);
    }

    #[test]
    fn identical_branches_combine_to_single_copy() {
        let tables = ContextTables {
            entities: "id,entity\n0,A".to_string(),
            relationships: "id,source\n0,A".to_string(),
            sources: "id,content\n0,text".to_string(),
        };
        assert_eq!(combine_contexts(&tables, &tables), tables);
    }

    #[test]
    fn render_is_none_for_empty_tables() {
        assert!(ContextTables::default().render().is_none());
        let rendered = ContextTables {
            entities: "e".into(),
            relationships: "r".into(),
            sources: "s".into(),
        }
        .render()
        .unwrap();
        assert!(rendered.contains("-----Entities-----\n```csv\ne\n```"));
        assert!(rendered.contains("-----Sources-----\n```csv\ns\n```"));
    }

    #[test]
    fn edges_sort_by_rank_then_weight() {
        let edge = |src: &str, rank: usize, weight: f64| RankedEdge {
            src: src.to_string(),
            tgt: "X".to_string(),
            record: RelationRecord {
                weight,
                description: String::new(),
                keywords: String::new(),
                source_id: String::new(),
            },
            rank,
        };
        let mut edges = vec![edge("a", 1, 9.0), edge("b", 3, 1.0), edge("c", 3, 2.0)];
        sort_edges(&mut edges);
        let order: Vec<&str> = edges.iter().map(|e| e.src.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }
}
