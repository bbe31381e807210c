//! Reconciler
//!
//! Out-of-band repair pass for the derived tables. It recomputes the
//! relationship edges and arcs of a world from the full content corpus —
//! same algorithms as the write-time maintainers, applied in one batch in
//! creation order — diffs the result against the live tables, and then
//! replaces the live rows wholesale inside a single transaction. The
//! batch computation is authoritative; drift is corrected silently and
//! only counted for operational visibility.
//!
//! The swap-at-the-end shape makes the pass safely interruptible: a crash
//! mid-computation leaves the previous correct state untouched.

use anyhow::{Context, Result};
use fabula_core::{ContentKind, FabulaConfig};
use serde::Serialize;
use sqlx::Row;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::arcs::{arc_id_for, arc_title_for, decide_assignment, ArcCandidate, ArcDecision};
use crate::embedding::{cosine_similarity, incremental_mean};
use crate::relationship::{blend_score, canonical_pair, push_evidence};
use crate::sqlite::{SqliteStore, StoredContent};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    pub world_id: Uuid,
    pub content_items: usize,
    pub edges: usize,
    /// Live edges whose count, score, or evidence disagreed with the
    /// batch computation.
    pub edges_drifted: usize,
    /// Edges the batch produced but the live table was missing.
    pub edges_missing: usize,
    /// Live edges with no counterpart in the batch (e.g. content removed).
    pub edges_orphaned: usize,
    pub arcs: usize,
    /// Live arcs whose membership disagreed with the batch computation.
    pub arcs_drifted: usize,
}

impl DriftReport {
    pub fn drift_total(&self) -> usize {
        self.edges_drifted + self.edges_missing + self.edges_orphaned + self.arcs_drifted
    }
}

// =============================================================================
// Batch recomputation (pure)
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct ComputedEdge {
    pub a_id: Uuid,
    pub b_id: Uuid,
    pub co_occurrence: i64,
    pub similarity: Option<f32>,
    pub combined_score: f32,
    pub evidence: Vec<Uuid>,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ComputedArc {
    pub id: Uuid,
    pub inhabitant_id: Option<Uuid>,
    pub title: String,
    pub members: Vec<Uuid>,
    pub centroid: Vec<f32>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Default)]
pub(crate) struct ComputedState {
    pub edges: Vec<ComputedEdge>,
    pub arcs: Vec<ComputedArc>,
}

/// Replay a world's corpus through the same incremental rules the live
/// maintainers apply, entirely in memory. Deterministic for a given
/// corpus: arc ids derive from founding stories and the iteration order
/// is the corpus creation order.
pub(crate) fn compute_world_state(
    world_id: Uuid,
    corpus: &[StoredContent],
    known: &HashSet<Uuid>,
    cfg: &FabulaConfig,
) -> ComputedState {
    struct EdgeAccum {
        co_occurrence: i64,
        similarity: Option<f32>,
        evidence: Vec<Uuid>,
        updated_at: i64,
    }

    let mut profiles: HashMap<Uuid, (Vec<f32>, i64)> = HashMap::new();
    let mut edges: BTreeMap<(Uuid, Uuid), EdgeAccum> = BTreeMap::new();
    let mut arcs: Vec<ComputedArc> = Vec::new();
    let threshold = cfg.arc.threshold_for(world_id);

    for stored in corpus {
        let item = &stored.item;

        // Profile means first, matching the live ingest order.
        if let Some(embedding) = &stored.embedding {
            let mut involved: Vec<Uuid> =
                item.mentions.iter().copied().filter(|m| known.contains(m)).collect();
            if let Some(primary) = item.primary_inhabitant_id.filter(|p| known.contains(p)) {
                involved.push(primary);
            }
            involved.sort();
            involved.dedup();
            for id in involved {
                let entry = profiles.remove(&id);
                let (mean, count) = match entry {
                    Some((mean, count)) => {
                        (incremental_mean(Some(&mean), embedding, count), count + 1)
                    }
                    None => (embedding.clone(), 1),
                };
                profiles.insert(id, (mean, count));
            }
        }

        // Relationship edges.
        let mut mentioned: Vec<Uuid> = Vec::new();
        for id in &item.mentions {
            if known.contains(id) && !mentioned.contains(id) {
                mentioned.push(*id);
            }
        }
        for i in 0..mentioned.len() {
            for j in (i + 1)..mentioned.len() {
                let (a, b) = canonical_pair(mentioned[i], mentioned[j]);
                if a == b {
                    continue;
                }
                let similarity = match (profiles.get(&a), profiles.get(&b)) {
                    (Some((ea, _)), Some((eb, _))) => Some(cosine_similarity(ea, eb)),
                    _ => None,
                };
                let entry = edges.entry((a, b)).or_insert_with(|| EdgeAccum {
                    co_occurrence: 0,
                    similarity: None,
                    evidence: Vec::new(),
                    updated_at: item.created_at,
                });
                entry.co_occurrence += 1;
                if similarity.is_some() {
                    entry.similarity = similarity;
                }
                push_evidence(&mut entry.evidence, item.id, cfg.relationship.evidence_cap);
                entry.updated_at = item.created_at;
            }
        }

        // Arc assignment for stories with embeddings.
        if item.kind == ContentKind::Story {
            if let Some(embedding) = &stored.embedding {
                let own: Vec<ArcCandidate> = match item.primary_inhabitant_id {
                    Some(pid) => arcs
                        .iter()
                        .filter(|a| a.inhabitant_id == Some(pid))
                        .map(|a| ArcCandidate {
                            id: a.id,
                            centroid: a.centroid.clone(),
                            updated_at: a.updated_at,
                        })
                        .collect(),
                    None => Vec::new(),
                };
                let candidates = if own.is_empty() {
                    arcs.iter()
                        .map(|a| ArcCandidate {
                            id: a.id,
                            centroid: a.centroid.clone(),
                            updated_at: a.updated_at,
                        })
                        .collect()
                } else {
                    own
                };

                match decide_assignment(embedding, &candidates, threshold) {
                    ArcDecision::Join { arc_id } => {
                        if let Some(arc) = arcs.iter_mut().find(|a| a.id == arc_id) {
                            let count = arc.members.len() as i64;
                            arc.centroid =
                                incremental_mean(Some(&arc.centroid), embedding, count);
                            arc.members.push(item.id);
                            arc.updated_at = item.created_at;
                        }
                    }
                    ArcDecision::CreateNew => {
                        arcs.push(ComputedArc {
                            id: arc_id_for(item.id),
                            inhabitant_id: item.primary_inhabitant_id,
                            title: arc_title_for(item),
                            members: vec![item.id],
                            centroid: embedding.clone(),
                            created_at: item.created_at,
                            updated_at: item.created_at,
                        });
                    }
                }
            }
        }
    }

    // Authoritative scores: every edge rescaled against the final world max.
    let world_max = edges.values().map(|e| e.co_occurrence).max().unwrap_or(1);
    let edges = edges
        .into_iter()
        .map(|((a_id, b_id), e)| ComputedEdge {
            a_id,
            b_id,
            co_occurrence: e.co_occurrence,
            similarity: e.similarity,
            combined_score: blend_score(
                e.co_occurrence,
                world_max,
                e.similarity,
                &cfg.relationship,
            ),
            evidence: e.evidence,
            updated_at: e.updated_at,
        })
        .collect();

    ComputedState { edges, arcs }
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct Reconciler {
    store: SqliteStore,
    cfg: FabulaConfig,
}

impl Reconciler {
    pub fn new(store: SqliteStore, cfg: FabulaConfig) -> Self {
        Self { store, cfg }
    }

    pub async fn reconcile_all(&self) -> Result<Vec<DriftReport>> {
        let mut reports = Vec::new();
        for world_id in self.store.world_ids().await? {
            reports.push(self.reconcile_world(world_id).await?);
        }
        Ok(reports)
    }

    /// Recompute one world, diff, and swap. The swap transaction only
    /// replaces rows wholesale; it never interleaves per-row edits with
    /// live writers.
    pub async fn reconcile_world(&self, world_id: Uuid) -> Result<DriftReport> {
        let known = self.store.inhabitant_ids_for_world(world_id).await?;
        let corpus = self.store.list_world_content(world_id).await?;
        let computed = compute_world_state(world_id, &corpus, &known, &self.cfg);

        let mut report = DriftReport {
            world_id,
            content_items: corpus.len(),
            edges: computed.edges.len(),
            arcs: computed.arcs.len(),
            ..DriftReport::default()
        };
        self.diff_edges(world_id, &computed, &mut report).await?;
        self.diff_arcs(world_id, &computed, &mut report).await?;

        self.swap_world(world_id, &computed).await?;

        if report.drift_total() > 0 {
            tracing::warn!(
                "Reconciled world {}: {} drifted edges, {} missing, {} orphaned, {} drifted arcs",
                world_id,
                report.edges_drifted,
                report.edges_missing,
                report.edges_orphaned,
                report.arcs_drifted
            );
        } else {
            tracing::info!(
                "Reconciled world {}: no drift across {} edges and {} arcs",
                world_id,
                report.edges,
                report.arcs
            );
        }
        Ok(report)
    }

    async fn diff_edges(
        &self,
        world_id: Uuid,
        computed: &ComputedState,
        report: &mut DriftReport,
    ) -> Result<()> {
        let rows = sqlx::query(
            "SELECT a_id, b_id, co_occurrence, combined_score, evidence_json \
             FROM relationships WHERE world_id = ?",
        )
        .bind(world_id.to_string())
        .fetch_all(self.store.pool())
        .await
        .context("Failed to snapshot live edges")?;

        let mut live: HashMap<(Uuid, Uuid), (i64, f32, Vec<Uuid>)> = HashMap::new();
        for row in rows {
            let a: String = row.get("a_id");
            let b: String = row.get("b_id");
            let evidence_json: String = row.get("evidence_json");
            live.insert(
                (Uuid::parse_str(&a)?, Uuid::parse_str(&b)?),
                (
                    row.get("co_occurrence"),
                    row.get::<f64, _>("combined_score") as f32,
                    serde_json::from_str(&evidence_json).unwrap_or_default(),
                ),
            );
        }

        for edge in &computed.edges {
            match live.remove(&(edge.a_id, edge.b_id)) {
                Some((co, score, evidence)) => {
                    let drifted = co != edge.co_occurrence
                        || (score - edge.combined_score).abs() > 1e-4
                        || evidence != edge.evidence;
                    if drifted {
                        report.edges_drifted += 1;
                        tracing::debug!(
                            "Edge ({}, {}) drifted: live co={} score={:.4}, computed co={} score={:.4}",
                            edge.a_id,
                            edge.b_id,
                            co,
                            score,
                            edge.co_occurrence,
                            edge.combined_score
                        );
                    }
                }
                None => report.edges_missing += 1,
            }
        }
        report.edges_orphaned = live.len();
        Ok(())
    }

    async fn diff_arcs(
        &self,
        world_id: Uuid,
        computed: &ComputedState,
        report: &mut DriftReport,
    ) -> Result<()> {
        let rows = sqlx::query("SELECT id, member_ids_json FROM arcs WHERE world_id = ?")
            .bind(world_id.to_string())
            .fetch_all(self.store.pool())
            .await
            .context("Failed to snapshot live arcs")?;

        let mut live: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let members_json: String = row.get("member_ids_json");
            live.insert(
                Uuid::parse_str(&id)?,
                serde_json::from_str(&members_json).unwrap_or_default(),
            );
        }

        for arc in &computed.arcs {
            match live.remove(&arc.id) {
                Some(members) if members == arc.members => {}
                _ => report.arcs_drifted += 1,
            }
        }
        // Leftover live arcs have no computed counterpart.
        report.arcs_drifted += live.len();
        Ok(())
    }

    /// Replace the world's derived rows with the batch result, atomically.
    async fn swap_world(&self, world_id: Uuid, computed: &ComputedState) -> Result<()> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .context("Failed to begin reconcile swap")?;

        sqlx::query("DELETE FROM relationships WHERE world_id = ?")
            .bind(world_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM arcs WHERE world_id = ?")
            .bind(world_id.to_string())
            .execute(&mut *tx)
            .await?;

        for edge in &computed.edges {
            let evidence_json =
                serde_json::to_string(&edge.evidence).context("Failed to serialize evidence")?;
            sqlx::query(
                "INSERT INTO relationships \
                 (world_id, a_id, b_id, co_occurrence, similarity, combined_score, \
                  evidence_json, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(world_id.to_string())
            .bind(edge.a_id.to_string())
            .bind(edge.b_id.to_string())
            .bind(edge.co_occurrence)
            .bind(edge.similarity)
            .bind(edge.combined_score as f64)
            .bind(&evidence_json)
            .bind(edge.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for arc in &computed.arcs {
            let members_json =
                serde_json::to_string(&arc.members).context("Failed to serialize arc members")?;
            let centroid =
                bincode::serialize(&arc.centroid).context("Failed to serialize centroid")?;
            sqlx::query(
                "INSERT INTO arcs \
                 (id, world_id, inhabitant_id, title, member_ids_json, member_count, \
                  centroid, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(arc.id.to_string())
            .bind(world_id.to_string())
            .bind(arc.inhabitant_id.map(|id| id.to_string()))
            .bind(&arc.title)
            .bind(&members_json)
            .bind(arc.members.len() as i64)
            .bind(centroid)
            .bind(arc.created_at)
            .bind(arc.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit reconcile swap")?;
        Ok(())
    }
}
