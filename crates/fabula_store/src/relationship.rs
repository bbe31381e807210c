//! Relationship Graph Maintainer
//!
//! Owns the `relationships` table. Every content item that mentions two or
//! more inhabitants strengthens the edge between each unordered pair:
//! co-occurrence is incremented once per item, the pair's semantic
//! similarity is refreshed from the inhabitants' profile embeddings, and
//! the combined score is re-blended against the world's current maximum
//! co-occurrence so scores stay comparable within one world's graph.
//!
//! Edges are created on first co-occurrence and never deleted here; the
//! reconciler is the only writer that replaces them wholesale.

use anyhow::{Context, Result};
use fabula_core::config::RelationshipConfig;
use fabula_core::{ContentItem, Inhabitant};
use serde::Serialize;
use sqlx::Row;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::sqlite::SqliteStore;

/// Canonical unordered-pair ordering: smaller id first.
///
/// Uuid ordering matches the TEXT ordering of its hyphenated lowercase
/// form, so the `CHECK (a_id < b_id)` in the schema agrees with this.
pub fn canonical_pair(x: Uuid, y: Uuid) -> (Uuid, Uuid) {
    if x <= y {
        (x, y)
    } else {
        (y, x)
    }
}

/// Append `id` to the evidence list, dropping the oldest entries past `cap`.
/// The same content item never appears twice.
pub fn push_evidence(evidence: &mut Vec<Uuid>, id: Uuid, cap: usize) {
    if evidence.contains(&id) {
        return;
    }
    evidence.push(id);
    if evidence.len() > cap {
        let overflow = evidence.len() - cap;
        evidence.drain(..overflow);
    }
}

/// Blend co-occurrence and similarity into a combined score in [0, 1].
///
/// Co-occurrence is normalized against the maximum count observed across
/// the world's edges, so the strongest pair in a world scores the full
/// co-occurrence weight. Holding `world_max` and `similarity` fixed, the
/// result is non-decreasing in `co_occurrence`.
pub fn blend_score(
    co_occurrence: i64,
    world_max: i64,
    similarity: Option<f32>,
    cfg: &RelationshipConfig,
) -> f32 {
    let (w_co, w_sim) = cfg.weights();
    let max = world_max.max(1) as f32;
    let norm = (co_occurrence.max(0) as f32 / max).min(1.0);
    let sim = similarity.unwrap_or(0.0).clamp(0.0, 1.0);
    (w_co * norm + w_sim * sim).clamp(0.0, 1.0)
}

/// What a single content item did to one edge.
#[derive(Debug, Clone)]
pub struct EdgeTouch {
    pub a: Inhabitant,
    pub b: Inhabitant,
    /// True when this was the pair's first co-occurrence.
    pub created: bool,
}

// =============================================================================
// Read-side view types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub a_id: Uuid,
    pub b_id: Uuid,
    pub co_occurrence: i64,
    pub similarity: Option<f32>,
    pub combined_score: f32,
    pub evidence_ids: Vec<Uuid>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

// =============================================================================
// Maintainer
// =============================================================================

#[derive(Clone)]
pub struct RelationshipMaintainer {
    store: SqliteStore,
    cfg: RelationshipConfig,
}

impl RelationshipMaintainer {
    pub fn new(store: SqliteStore, cfg: RelationshipConfig) -> Self {
        Self { store, cfg }
    }

    /// Write-time hook: upsert one edge per unordered pair of known
    /// mentioned inhabitants. Orphan mention ids are skipped with a
    /// warning; self-pairs and repeated mentions within one item are
    /// deduplicated before pairing.
    pub async fn on_content_created(&self, item: &ContentItem) -> Result<Vec<EdgeTouch>> {
        let known = self.resolve_known_mentions(item).await?;
        if known.len() < 2 {
            return Ok(Vec::new());
        }

        // Canonical pairs, each counted once per content item.
        let mut pairs: BTreeSet<(Uuid, Uuid)> = BTreeSet::new();
        for i in 0..known.len() {
            for j in (i + 1)..known.len() {
                let (a, b) = canonical_pair(known[i].id, known[j].id);
                if a != b {
                    pairs.insert((a, b));
                }
            }
        }

        let mut touches = Vec::with_capacity(pairs.len());
        for (a_id, b_id) in pairs {
            let created = self.upsert_edge(item, a_id, b_id).await?;
            let a = known.iter().find(|i| i.id == a_id).cloned();
            let b = known.iter().find(|i| i.id == b_id).cloned();
            if let (Some(a), Some(b)) = (a, b) {
                touches.push(EdgeTouch { a, b, created });
            }
        }
        Ok(touches)
    }

    /// Deduplicated mentioned inhabitants that actually exist.
    async fn resolve_known_mentions(&self, item: &ContentItem) -> Result<Vec<Inhabitant>> {
        let mut unique: Vec<Uuid> = Vec::new();
        for id in &item.mentions {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let known: Vec<Inhabitant> = self
            .store
            .inhabitants_by_ids(&unique)
            .await?
            .into_iter()
            .filter(|i| i.world_id == item.world_id)
            .collect();
        for id in &unique {
            if !known.iter().any(|i| i.id == *id) {
                tracing::warn!(
                    "Content {} mentions unknown inhabitant {}, skipping",
                    item.id,
                    id
                );
            }
        }
        Ok(known)
    }

    /// One atomic read-modify-write per pair, followed by the independent
    /// rescale step against the world's current max co-occurrence.
    async fn upsert_edge(&self, item: &ContentItem, a_id: Uuid, b_id: Uuid) -> Result<bool> {
        // Similarity from the inhabitants' profile embeddings; when either
        // is missing, the prior stored value is left untouched.
        let emb_a = self.store.inhabitant_embedding(a_id).await?;
        let emb_b = self.store.inhabitant_embedding(b_id).await?;
        let similarity = match (&emb_a, &emb_b) {
            (Some((a, _)), Some((b, _))) => Some(cosine_similarity(a, b)),
            _ => None,
        };

        let existing = sqlx::query(
            "SELECT co_occurrence, evidence_json FROM relationships WHERE a_id = ? AND b_id = ?",
        )
        .bind(a_id.to_string())
        .bind(b_id.to_string())
        .fetch_optional(self.store.pool())
        .await
        .context("Failed to check existing edge")?;

        let created = existing.is_none();
        match existing {
            Some(row) => {
                let evidence_json: String = row.get("evidence_json");
                let mut evidence: Vec<Uuid> = serde_json::from_str(&evidence_json)
                    .context("Failed to parse edge evidence")?;
                push_evidence(&mut evidence, item.id, self.cfg.evidence_cap);
                let evidence_json =
                    serde_json::to_string(&evidence).context("Failed to serialize evidence")?;

                sqlx::query(
                    "UPDATE relationships SET \
                     co_occurrence = co_occurrence + 1, \
                     similarity = COALESCE(?, similarity), \
                     evidence_json = ?, \
                     updated_at = ? \
                     WHERE a_id = ? AND b_id = ?",
                )
                .bind(similarity)
                .bind(&evidence_json)
                .bind(item.created_at)
                .bind(a_id.to_string())
                .bind(b_id.to_string())
                .execute(self.store.pool())
                .await
                .context("Failed to update edge")?;
            }
            None => {
                let evidence_json = serde_json::to_string(&vec![item.id])
                    .context("Failed to serialize evidence")?;

                sqlx::query(
                    "INSERT INTO relationships \
                     (world_id, a_id, b_id, co_occurrence, similarity, combined_score, \
                      evidence_json, updated_at) \
                     VALUES (?, ?, ?, 1, ?, 0.0, ?, ?)",
                )
                .bind(item.world_id.to_string())
                .bind(a_id.to_string())
                .bind(b_id.to_string())
                .bind(similarity)
                .bind(&evidence_json)
                .bind(item.created_at)
                .execute(self.store.pool())
                .await
                .context("Failed to insert edge")?;
            }
        }

        self.rescale_edge(item.world_id, a_id, b_id).await?;
        Ok(created)
    }

    /// Recompute this edge's combined score. The world max is always read
    /// back from a bounded query, never cached in-process — other service
    /// instances may have moved it.
    async fn rescale_edge(&self, world_id: Uuid, a_id: Uuid, b_id: Uuid) -> Result<()> {
        let max_row = sqlx::query(
            "SELECT COALESCE(MAX(co_occurrence), 1) AS max_co \
             FROM relationships WHERE world_id = ?",
        )
        .bind(world_id.to_string())
        .fetch_one(self.store.pool())
        .await
        .context("Failed to read world max co-occurrence")?;
        let world_max: i64 = max_row.get("max_co");

        let row = sqlx::query(
            "SELECT co_occurrence, similarity FROM relationships WHERE a_id = ? AND b_id = ?",
        )
        .bind(a_id.to_string())
        .bind(b_id.to_string())
        .fetch_one(self.store.pool())
        .await
        .context("Failed to re-read edge for rescale")?;

        let co: i64 = row.get("co_occurrence");
        let similarity: Option<f32> = row.get::<Option<f64>, _>("similarity").map(|s| s as f32);
        let score = blend_score(co, world_max, similarity, &self.cfg);

        sqlx::query("UPDATE relationships SET combined_score = ? WHERE a_id = ? AND b_id = ?")
            .bind(score as f64)
            .bind(a_id.to_string())
            .bind(b_id.to_string())
            .execute(self.store.pool())
            .await
            .context("Failed to write combined score")?;

        Ok(())
    }

    /// Read contract: edges at or above `min_score`, joined with
    /// inhabitant display data. Pure filter + join, no recomputation.
    pub async fn get_graph(&self, world_id: Uuid, min_score: f32) -> Result<RelationshipGraph> {
        let rows = sqlx::query(
            "SELECT r.a_id, r.b_id, r.co_occurrence, r.similarity, r.combined_score, \
             r.evidence_json, r.updated_at, ia.name AS a_name, ib.name AS b_name \
             FROM relationships r \
             JOIN inhabitants ia ON ia.id = r.a_id \
             JOIN inhabitants ib ON ib.id = r.b_id \
             WHERE r.world_id = ? AND r.combined_score >= ? \
             ORDER BY r.combined_score DESC",
        )
        .bind(world_id.to_string())
        .bind(min_score as f64)
        .fetch_all(self.store.pool())
        .await
        .context("Failed to read relationship graph")?;

        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut edges = Vec::with_capacity(rows.len());
        for row in rows {
            let a_id: String = row.get("a_id");
            let b_id: String = row.get("b_id");
            let a_id = Uuid::parse_str(&a_id).context("Malformed edge endpoint")?;
            let b_id = Uuid::parse_str(&b_id).context("Malformed edge endpoint")?;
            let evidence_json: String = row.get("evidence_json");

            for (id, name) in [
                (a_id, row.get::<String, _>("a_name")),
                (b_id, row.get::<String, _>("b_name")),
            ] {
                if !nodes.iter().any(|n| n.id == id) {
                    nodes.push(GraphNode { id, name });
                }
            }

            edges.push(GraphEdge {
                a_id,
                b_id,
                co_occurrence: row.get("co_occurrence"),
                similarity: row.get::<Option<f64>, _>("similarity").map(|s| s as f32),
                combined_score: row.get::<f64, _>("combined_score") as f32,
                evidence_ids: serde_json::from_str(&evidence_json)
                    .context("Failed to parse edge evidence")?,
                updated_at: row.get("updated_at"),
            });
        }

        Ok(RelationshipGraph { nodes, edges })
    }
}
