//! Arc Assigner
//!
//! Owns the `arcs` table. Each new story is either appended to the most
//! similar existing arc (centroid cosine similarity above the configured
//! threshold) or opens a new arc with itself as the sole member. The
//! decision itself is a pure function of the story embedding, the
//! candidate centroids, and the threshold — the store mutation happens
//! only after the decision is made.
//!
//! No temporal windowing: similarity is the only admission criterion, so
//! a thread can resume after arbitrarily long in-world silence.

use anyhow::{Context, Result};
use fabula_core::config::ArcConfig;
use fabula_core::ContentItem;
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use crate::embedding::{cosine_similarity, incremental_mean};
use crate::sqlite::SqliteStore;

/// Similarities within this distance are considered tied.
const TIE_EPSILON: f32 = 1e-6;

/// Outcome of the pure assignment decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArcDecision {
    Join { arc_id: Uuid },
    CreateNew,
}

/// A candidate arc: just enough state to score it.
#[derive(Debug, Clone)]
pub struct ArcCandidate {
    pub id: Uuid,
    pub centroid: Vec<f32>,
    pub updated_at: i64,
}

/// Pick the best candidate by centroid similarity; ties within
/// floating-point tolerance prefer the most recently updated arc (the
/// most active thread wins). Below-threshold maxima open a new arc.
pub fn decide_assignment(
    embedding: &[f32],
    candidates: &[ArcCandidate],
    threshold: f32,
) -> ArcDecision {
    let mut best: Option<(&ArcCandidate, f32)> = None;
    for candidate in candidates {
        let sim = cosine_similarity(embedding, &candidate.centroid);
        match best {
            None => best = Some((candidate, sim)),
            Some((current, current_sim)) => {
                if sim > current_sim + TIE_EPSILON {
                    best = Some((candidate, sim));
                } else if (sim - current_sim).abs() <= TIE_EPSILON
                    && candidate.updated_at > current.updated_at
                {
                    best = Some((candidate, sim));
                }
            }
        }
    }

    match best {
        Some((candidate, sim)) if sim > threshold => ArcDecision::Join {
            arc_id: candidate.id,
        },
        _ => ArcDecision::CreateNew,
    }
}

/// Arc identity is derived from the founding story, so replaying the same
/// corpus (backfill, reconciliation) reproduces the same arc ids.
pub fn arc_id_for(founding_story: Uuid) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, founding_story.as_bytes())
}

/// Title for a freshly opened arc.
pub fn arc_title_for(item: &ContentItem) -> String {
    if !item.title.trim().is_empty() {
        return item.title.trim().to_string();
    }
    let words: Vec<&str> = item.body.split_whitespace().take(6).collect();
    if words.is_empty() {
        "Untitled arc".to_string()
    } else {
        words.join(" ")
    }
}

// =============================================================================
// View types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StoryArc {
    pub id: Uuid,
    pub world_id: Uuid,
    pub inhabitant_id: Option<Uuid>,
    pub title: String,
    pub member_ids: Vec<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArcWithMembers {
    pub arc: StoryArc,
    /// Sibling stories in creation order.
    pub members: Vec<ContentItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArcSummary {
    pub arc: StoryArc,
    pub member_count: i64,
}

/// What `on_story_created` did.
#[derive(Debug, Clone)]
pub struct ArcOutcome {
    pub arc_id: Uuid,
    /// True when a new arc was opened for this story.
    pub created: bool,
    pub title: String,
}

// =============================================================================
// Assigner
// =============================================================================

#[derive(Clone)]
pub struct ArcAssigner {
    store: SqliteStore,
    cfg: ArcConfig,
}

impl ArcAssigner {
    pub fn new(store: SqliteStore, cfg: ArcConfig) -> Self {
        Self { store, cfg }
    }

    /// Write-time hook for stories with a precomputed embedding.
    pub async fn on_story_created(
        &self,
        item: &ContentItem,
        embedding: &[f32],
    ) -> Result<ArcOutcome> {
        let candidates = self.candidates_for(item).await?;
        let threshold = self.cfg.threshold_for(item.world_id);

        match decide_assignment(embedding, &candidates, threshold) {
            ArcDecision::Join { arc_id } => {
                let title = self.append_member(arc_id, item, embedding).await?;
                Ok(ArcOutcome {
                    arc_id,
                    created: false,
                    title,
                })
            }
            ArcDecision::CreateNew => {
                let arc_id = arc_id_for(item.id);
                let title = arc_title_for(item);
                self.insert_arc(arc_id, item, embedding, &title).await?;
                Ok(ArcOutcome {
                    arc_id,
                    created: true,
                    title,
                })
            }
        }
    }

    /// Candidates are the primary inhabitant's arcs; a story without a
    /// primary inhabitant — or an inhabitant with no arcs yet — considers
    /// the whole world's arcs so early stories can join cross-inhabitant
    /// threads.
    async fn candidates_for(&self, item: &ContentItem) -> Result<Vec<ArcCandidate>> {
        if let Some(inhabitant_id) = item.primary_inhabitant_id {
            let own = self
                .load_candidates(
                    "SELECT id, centroid, updated_at FROM arcs WHERE inhabitant_id = ?",
                    &inhabitant_id.to_string(),
                )
                .await?;
            if !own.is_empty() {
                return Ok(own);
            }
        }
        self.load_candidates(
            "SELECT id, centroid, updated_at FROM arcs WHERE world_id = ?",
            &item.world_id.to_string(),
        )
        .await
    }

    async fn load_candidates(&self, sql: &str, bind: &str) -> Result<Vec<ArcCandidate>> {
        let rows = sqlx::query(sql)
            .bind(bind)
            .fetch_all(self.store.pool())
            .await
            .context("Failed to load arc candidates")?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let blob: Vec<u8> = row.get("centroid");
                Ok(ArcCandidate {
                    id: Uuid::parse_str(&id).context("Malformed arc id")?,
                    centroid: bincode::deserialize(&blob)
                        .context("Failed to deserialize centroid")?,
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }

    async fn insert_arc(
        &self,
        arc_id: Uuid,
        item: &ContentItem,
        embedding: &[f32],
        title: &str,
    ) -> Result<()> {
        let member_ids_json =
            serde_json::to_string(&vec![item.id]).context("Failed to serialize arc members")?;
        let centroid = bincode::serialize(embedding).context("Failed to serialize centroid")?;

        sqlx::query(
            "INSERT OR IGNORE INTO arcs \
             (id, world_id, inhabitant_id, title, member_ids_json, member_count, \
              centroid, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(arc_id.to_string())
        .bind(item.world_id.to_string())
        .bind(item.primary_inhabitant_id.map(|id| id.to_string()))
        .bind(title)
        .bind(&member_ids_json)
        .bind(centroid)
        .bind(item.created_at)
        .bind(item.created_at)
        .execute(self.store.pool())
        .await
        .context("Failed to insert arc")?;

        tracing::debug!("Opened arc {} for story {}", arc_id, item.id);
        Ok(())
    }

    /// Append a member and fold its embedding into the running-mean
    /// centroid — O(1) per append, no recompute over all members.
    async fn append_member(
        &self,
        arc_id: Uuid,
        item: &ContentItem,
        embedding: &[f32],
    ) -> Result<String> {
        let row = sqlx::query(
            "SELECT title, member_ids_json, member_count, centroid FROM arcs WHERE id = ?",
        )
        .bind(arc_id.to_string())
        .fetch_one(self.store.pool())
        .await
        .context("Failed to load arc for append")?;

        let title: String = row.get("title");
        let member_ids_json: String = row.get("member_ids_json");
        let member_count: i64 = row.get("member_count");
        let centroid_blob: Vec<u8> = row.get("centroid");

        let mut member_ids: Vec<Uuid> =
            serde_json::from_str(&member_ids_json).context("Failed to parse arc members")?;
        if member_ids.contains(&item.id) {
            // Replay of an already-assigned story; nothing to do.
            return Ok(title);
        }
        member_ids.push(item.id);

        let centroid: Vec<f32> =
            bincode::deserialize(&centroid_blob).context("Failed to deserialize centroid")?;
        let centroid = incremental_mean(Some(&centroid), embedding, member_count);

        sqlx::query(
            "UPDATE arcs SET member_ids_json = ?, member_count = member_count + 1, \
             centroid = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&member_ids).context("Failed to serialize arc members")?)
        .bind(bincode::serialize(&centroid).context("Failed to serialize centroid")?)
        .bind(item.created_at)
        .bind(arc_id.to_string())
        .execute(self.store.pool())
        .await
        .context("Failed to append arc member")?;

        tracing::debug!("Story {} joined arc {}", item.id, arc_id);
        Ok(title)
    }

    /// Read contract: the story's arc and all sibling members in creation
    /// order, or None while unassigned — always a valid state, never an
    /// error.
    pub async fn get_arc(&self, story_id: Uuid) -> Result<Option<ArcWithMembers>> {
        let needle = format!("%{}%", story_id);
        let row = sqlx::query(
            "SELECT id, world_id, inhabitant_id, title, member_ids_json, created_at, updated_at \
             FROM arcs WHERE member_ids_json LIKE ?",
        )
        .bind(&needle)
        .fetch_optional(self.store.pool())
        .await
        .context("Failed to look up arc membership")?;

        let Some(row) = row else { return Ok(None) };
        let arc = row_to_arc(&row)?;
        let members = self.store.content_by_ids_ordered(&arc.member_ids).await?;
        Ok(Some(ArcWithMembers { arc, members }))
    }

    /// Read contract: all arcs in a world with member counts; most
    /// recently active first. No clustering at read time.
    pub async fn list_arcs(&self, world_id: Uuid) -> Result<Vec<ArcSummary>> {
        let rows = sqlx::query(
            "SELECT id, world_id, inhabitant_id, title, member_ids_json, member_count, \
             created_at, updated_at FROM arcs WHERE world_id = ? ORDER BY updated_at DESC",
        )
        .bind(world_id.to_string())
        .fetch_all(self.store.pool())
        .await
        .context("Failed to list arcs")?;

        rows.iter()
            .map(|row| {
                Ok(ArcSummary {
                    arc: row_to_arc(row)?,
                    member_count: row.get("member_count"),
                })
            })
            .collect()
    }
}

fn row_to_arc(row: &sqlx::sqlite::SqliteRow) -> Result<StoryArc> {
    let id: String = row.get("id");
    let world_id: String = row.get("world_id");
    let inhabitant_id: Option<String> = row.get("inhabitant_id");
    let member_ids_json: String = row.get("member_ids_json");

    Ok(StoryArc {
        id: Uuid::parse_str(&id).context("Malformed arc id")?,
        world_id: Uuid::parse_str(&world_id).context("Malformed world id")?,
        inhabitant_id: inhabitant_id
            .map(|s| Uuid::parse_str(&s).context("Malformed inhabitant id"))
            .transpose()?,
        title: row.get("title"),
        member_ids: serde_json::from_str(&member_ids_json)
            .context("Failed to parse arc members")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
