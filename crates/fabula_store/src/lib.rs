pub mod arcs;
pub mod embedding;
pub mod feed;
pub mod ingest;
pub mod reconcile;
pub mod relationship;
pub mod sqlite;

pub use arcs::{ArcAssigner, ArcDecision, ArcOutcome, ArcSummary, ArcWithMembers, StoryArc};
pub use embedding::{cosine_similarity, FastembedProvider};
pub use feed::{FeedCursor, FeedItem, FeedKeys, FeedPage, FeedStore};
pub use ingest::{BackfillReport, IngestPipeline, IngestReceipt};
pub use reconcile::{DriftReport, Reconciler};
pub use relationship::{RelationshipGraph, RelationshipMaintainer};
pub use sqlite::{SqliteStore, StoredContent};

#[cfg(test)]
mod tests;
