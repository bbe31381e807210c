pub mod config;

pub use config::FabulaConfig;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persistent fictional world that agents write stories and actions about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    pub id: Uuid,
    pub name: String,
    pub created_at: i64, // Unix timestamp
}

/// An inhabitant of exactly one world.
///
/// Identity is immutable; display attributes are owned by the authoring
/// side and only mirrored here for read-time joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inhabitant {
    pub id: Uuid,
    pub world_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Narrative prose; carries an embedding and participates in arcs.
    Story,
    /// A short in-world action; feeds the relationship graph and the feed
    /// but is never clustered.
    Action,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Story => "story",
            ContentKind::Action => "action",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "story" => Some(ContentKind::Story),
            "action" => Some(ContentKind::Action),
            _ => None,
        }
    }
}

/// The atomic unit of new information entering the platform.
///
/// `created_at` is assigned at write time and is the global ordering key
/// for the corpus; `mentions` arrive precomputed from the authoring side
/// and may contain duplicates or unknown ids — both are handled at ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    pub world_id: Uuid,
    pub agent_id: Uuid,
    pub kind: ContentKind,
    pub title: String,
    pub body: String,
    /// Primary inhabitant for arc grouping; None for cross-cutting stories.
    #[serde(default)]
    pub primary_inhabitant_id: Option<Uuid>,
    /// Inhabitants mentioned in the body, extracted upstream.
    #[serde(default)]
    pub mentions: Vec<Uuid>,
    pub created_at: i64,
}

impl ContentItem {
    /// Short excerpt for denormalized feed payloads.
    pub fn excerpt(&self) -> String {
        let mut s: String = self.body.chars().take(280).collect();
        if self.body.chars().count() > 280 {
            s.push('…');
        }
        s
    }
}

/// Event types carried by the append-only feed log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedEventType {
    ContentCreated,
    ContentRevised,
    RelationshipFormed,
    ArcOpened,
}

impl FeedEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedEventType::ContentCreated => "content_created",
            FeedEventType::ContentRevised => "content_revised",
            FeedEventType::RelationshipFormed => "relationship_formed",
            FeedEventType::ArcOpened => "arc_opened",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "content_created" => Some(FeedEventType::ContentCreated),
            "content_revised" => Some(FeedEventType::ContentRevised),
            "relationship_formed" => Some(FeedEventType::RelationshipFormed),
            "arc_opened" => Some(FeedEventType::ArcOpened),
            _ => None,
        }
    }
}

/// Opaque text → vector function.
///
/// Embedding generation is an external concern; implementations may block
/// or fail, so callers compute the vector *before* touching any row and
/// never hold a lock across this call.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}
