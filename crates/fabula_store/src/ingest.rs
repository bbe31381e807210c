//! Content ingest pipeline
//!
//! The single entry point every content-creation path goes through. The
//! embedding is computed first (the provider may block or fail; no row is
//! touched while it is in flight), then the content row is persisted —
//! that write is the only one allowed to fail the request. Relationship,
//! arc, and feed updates run afterwards as best-effort steps: a failure
//! is logged and left for the reconciler's next pass, never surfaced to
//! the caller.
//!
//! Backfill replays the whole corpus through the same handlers after
//! clearing the derived tables, so it is safe to re-run.

use anyhow::{Context, Result};
use fabula_core::{ContentItem, ContentKind, EmbeddingProvider, FabulaConfig, FeedEventType};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::arcs::{ArcAssigner, ArcOutcome};
use crate::embedding::incremental_mean;
use crate::feed::{FeedKeys, FeedStore};
use crate::relationship::{EdgeTouch, RelationshipMaintainer};
use crate::sqlite::SqliteStore;

/// What one ingest call produced, for the caller's response body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReceipt {
    pub content_id: Uuid,
    pub arc_id: Option<Uuid>,
    pub arc_created: bool,
    pub edges_touched: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BackfillReport {
    pub replayed: usize,
    pub feed_events: i64,
}

pub struct IngestPipeline {
    store: SqliteStore,
    embedder: Arc<dyn EmbeddingProvider>,
    relationships: RelationshipMaintainer,
    arcs: ArcAssigner,
    feed: FeedStore,
    cfg: FabulaConfig,
}

impl IngestPipeline {
    pub fn new(
        store: SqliteStore,
        embedder: Arc<dyn EmbeddingProvider>,
        cfg: FabulaConfig,
    ) -> Self {
        let relationships =
            RelationshipMaintainer::new(store.clone(), cfg.relationship.clone());
        let arcs = ArcAssigner::new(store.clone(), cfg.arc.clone());
        let feed = FeedStore::new(store.clone());
        Self {
            store,
            embedder,
            relationships,
            arcs,
            feed,
            cfg,
        }
    }

    /// The `content created` hook: persist the item, then fan out to the
    /// derived-state maintainers.
    pub async fn content_created(&self, item: ContentItem) -> Result<IngestReceipt> {
        // 1. Embedding first — never under a lock, never fatal.
        let embedding = match item.kind {
            ContentKind::Story => match self.embedder.embed(&item.body).await {
                Ok(e) => Some(e),
                Err(e) => {
                    tracing::warn!(
                        "Embedding failed for content {}: {} (arc assignment deferred)",
                        item.id,
                        e
                    );
                    None
                }
            },
            ContentKind::Action => None,
        };

        // 2. The primary write. Bounded retry, then the request fails.
        let retries = self.cfg.ingest.max_retries;
        with_retries(retries, || self.store.insert_content(&item, embedding.as_deref()))
            .await
            .context("Failed to persist content item")?;

        // 3–6. Derived state, all best-effort from here on.
        let receipt = self.apply_derived(&item, embedding.as_deref()).await;
        Ok(receipt)
    }

    /// Steps shared by live ingest and backfill replay. Every failure is
    /// swallowed after logging: the content row already exists and the
    /// reconciler repairs whatever was missed.
    async fn apply_derived(&self, item: &ContentItem, embedding: Option<&[f32]>) -> IngestReceipt {
        if let Some(embedding) = embedding {
            if let Err(e) = self.update_inhabitant_profiles(item, embedding).await {
                tracing::warn!("Inhabitant profile update failed for {}: {}", item.id, e);
            }
        }

        let touches = match self.relationships.on_content_created(item).await {
            Ok(touches) => touches,
            Err(e) => {
                tracing::warn!("Relationship update failed for {}: {}", item.id, e);
                Vec::new()
            }
        };

        let arc = match (item.kind, embedding) {
            (ContentKind::Story, Some(embedding)) => {
                match self.arcs.on_story_created(item, embedding).await {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        tracing::warn!("Arc assignment failed for {}: {}", item.id, e);
                        None
                    }
                }
            }
            _ => None,
        };

        self.emit_feed_events(item, &touches, arc.as_ref()).await;

        IngestReceipt {
            content_id: item.id,
            arc_id: arc.as_ref().map(|a| a.arc_id),
            arc_created: arc.as_ref().map(|a| a.created).unwrap_or(false),
            edges_touched: touches.len(),
        }
    }

    /// Fold a story embedding into the running-mean profile of every
    /// inhabitant it involves.
    async fn update_inhabitant_profiles(
        &self,
        item: &ContentItem,
        embedding: &[f32],
    ) -> Result<()> {
        let mut involved: Vec<Uuid> = item.mentions.clone();
        if let Some(primary) = item.primary_inhabitant_id {
            involved.push(primary);
        }
        involved.sort();
        involved.dedup();

        let known = self.store.inhabitants_by_ids(&involved).await?;
        for inhabitant in known.into_iter().filter(|i| i.world_id == item.world_id) {
            let prev = self.store.inhabitant_embedding(inhabitant.id).await?;
            let (mean, count) = match prev {
                Some((mean, count)) => {
                    (incremental_mean(Some(&mean), embedding, count), count + 1)
                }
                None => (embedding.to_vec(), 1),
            };
            self.store
                .set_inhabitant_embedding(inhabitant.id, &mean, count)
                .await?;
        }
        Ok(())
    }

    /// Best-effort feed emission; an error here never fails the write.
    /// Event timestamps reuse the content's creation timestamp so a
    /// replayed corpus reproduces the same feed ordering.
    async fn emit_feed_events(
        &self,
        item: &ContentItem,
        touches: &[EdgeTouch],
        arc: Option<&ArcOutcome>,
    ) {
        let world_name = match self.store.get_world(item.world_id).await {
            Ok(Some(world)) => world.name,
            _ => String::new(),
        };
        let mention_rows = self
            .store
            .inhabitants_by_ids(&item.mentions)
            .await
            .unwrap_or_default();
        let mentions: Vec<_> = mention_rows
            .iter()
            .map(|i| json!({"id": i.id, "name": i.name}))
            .collect();

        let payload = json!({
            "content_id": item.id,
            "world_id": item.world_id,
            "world_name": world_name,
            "agent_id": item.agent_id,
            "kind": item.kind.as_str(),
            "title": item.title,
            "excerpt": item.excerpt(),
            "primary_inhabitant_id": item.primary_inhabitant_id,
            "mentions": mentions,
        });
        let keys = FeedKeys {
            world_id: Some(item.world_id),
            agent_id: Some(item.agent_id),
            content_id: Some(item.id),
        };
        if let Err(e) = self
            .feed
            .emit(FeedEventType::ContentCreated, payload, item.created_at, keys)
            .await
        {
            tracing::warn!("Feed emission failed for {}: {}", item.id, e);
        }

        for touch in touches.iter().filter(|t| t.created) {
            let payload = json!({
                "world_id": item.world_id,
                "world_name": world_name,
                "a_id": touch.a.id,
                "a_name": touch.a.name,
                "b_id": touch.b.id,
                "b_name": touch.b.name,
                "content_id": item.id,
            });
            let keys = FeedKeys {
                world_id: Some(item.world_id),
                agent_id: None,
                content_id: Some(item.id),
            };
            if let Err(e) = self
                .feed
                .emit(
                    FeedEventType::RelationshipFormed,
                    payload,
                    item.created_at,
                    keys,
                )
                .await
            {
                tracing::warn!("Relationship feed emission failed: {}", e);
            }
        }

        if let Some(arc) = arc.filter(|a| a.created) {
            let payload = json!({
                "arc_id": arc.arc_id,
                "title": arc.title,
                "world_id": item.world_id,
                "world_name": world_name,
                "inhabitant_id": item.primary_inhabitant_id,
                "story_id": item.id,
            });
            let keys = FeedKeys {
                world_id: Some(item.world_id),
                agent_id: None,
                content_id: Some(item.id),
            };
            if let Err(e) = self
                .feed
                .emit(FeedEventType::ArcOpened, payload, item.created_at, keys)
                .await
            {
                tracing::warn!("Arc feed emission failed: {}", e);
            }
        }
    }

    /// One-time batch job: wipe the derived tables and replay the full
    /// historical corpus through the same handlers, in creation order.
    /// Stored embeddings are reused — vectors are computed once at
    /// creation and never recomputed.
    pub async fn backfill(&self) -> Result<BackfillReport> {
        self.store.clear_derived().await?;

        let corpus = self.store.list_all_content().await?;
        let mut report = BackfillReport::default();
        for stored in &corpus {
            self.apply_derived(&stored.item, stored.embedding.as_deref())
                .await;
            report.replayed += 1;
        }
        report.feed_events = self.feed.count().await?;

        tracing::info!(
            "Backfill replayed {} content items into {} feed events",
            report.replayed,
            report.feed_events
        );
        Ok(report)
    }
}

/// Retry a transient store operation a bounded number of times before
/// giving up; the caller decides whether giving up is fatal.
pub async fn with_retries<T, F, Fut>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for n in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if n < attempts {
                    tracing::debug!("Attempt {}/{} failed: {}, retrying", n, attempts, e);
                }
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("retries exhausted")))
}
