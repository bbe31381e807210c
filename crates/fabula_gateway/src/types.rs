use fabula_core::{ContentItem, ContentKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound content submission from an authoring agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitContent {
    pub world_id: Uuid,
    pub agent_id: Uuid,
    pub kind: ContentKind,
    #[serde(default)]
    pub title: String,
    pub body: String,
    /// Primary inhabitant for arc grouping; omitted for cross-cutting stories.
    #[serde(default)]
    pub primary_inhabitant_id: Option<Uuid>,
    /// Mentioned inhabitants, extracted by the authoring side.
    #[serde(default)]
    pub mentions: Vec<Uuid>,
}

impl SubmitContent {
    /// Convert to a ContentItem, assigning the id and the write-time
    /// timestamp that orders the corpus.
    pub fn into_content_item(self) -> ContentItem {
        ContentItem {
            id: Uuid::new_v4(),
            world_id: self.world_id,
            agent_id: self.agent_id,
            kind: self.kind,
            title: self.title,
            body: self.body,
            primary_inhabitant_id: self.primary_inhabitant_id,
            mentions: self.mentions,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Query parameters for graph reads.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphParams {
    #[serde(default)]
    pub min_score: f32,
}

/// Query parameters for feed reads.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedParams {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Maintenance trigger body; an absent world id means every world.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReconcileRequest {
    pub world_id: Option<Uuid>,
}
