//! Feed Event Store & Reader
//!
//! An append-only log of fully denormalized events. The read side is a
//! single keyset-paginated query over `(created_at, id)` descending —
//! no joins, no aggregation, no per-type fan-out. The insertion sequence
//! id breaks ties between events sharing a timestamp so pagination never
//! skips or repeats a row.

use anyhow::{Context, Result};
use fabula_core::FeedEventType;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::sqlite::SqliteStore;

/// Opaque pagination marker: the timestamp and sequence id of the last
/// returned event, rendered as `"<ts>:<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedCursor {
    pub created_at: i64,
    pub seq: i64,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid feed cursor: {0}")]
pub struct ParseCursorError(String);

impl fmt::Display for FeedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.created_at, self.seq)
    }
}

impl FromStr for FeedCursor {
    type Err = ParseCursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts, seq) = s
            .split_once(':')
            .ok_or_else(|| ParseCursorError(s.to_string()))?;
        Ok(FeedCursor {
            created_at: ts.parse().map_err(|_| ParseCursorError(s.to_string()))?,
            seq: seq.parse().map_err(|_| ParseCursorError(s.to_string()))?,
        })
    }
}

impl Serialize for FeedCursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FeedCursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One row of the log, exactly as a reader renders it.
#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    pub id: i64,
    pub event_type: FeedEventType,
    pub created_at: i64,
    pub payload: serde_json::Value,
    pub world_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub content_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<FeedCursor>,
}

/// Optional foreign keys attached to an event for filtering.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedKeys {
    pub world_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub content_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct FeedStore {
    store: SqliteStore,
}

impl FeedStore {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Append one event. The payload must already contain everything a
    /// reader needs — rows are never joined or mutated after the fact.
    pub async fn emit(
        &self,
        event_type: FeedEventType,
        payload: serde_json::Value,
        created_at: i64,
        keys: FeedKeys,
    ) -> Result<i64> {
        let payload_json =
            serde_json::to_string(&payload).context("Failed to serialize feed payload")?;

        let result = sqlx::query(
            "INSERT INTO feed_events (event_type, created_at, payload, world_id, agent_id, content_id) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event_type.as_str())
        .bind(created_at)
        .bind(&payload_json)
        .bind(keys.world_id.map(|id| id.to_string()))
        .bind(keys.agent_id.map(|id| id.to_string()))
        .bind(keys.content_id.map(|id| id.to_string()))
        .execute(self.store.pool())
        .await
        .context("Failed to append feed event")?;

        Ok(result.last_insert_rowid())
    }

    /// Read contract: up to `limit` events strictly before `cursor`
    /// (everything, when absent), newest first. Returns the cursor for
    /// the next page, or None when this page was empty.
    pub async fn read(&self, cursor: Option<FeedCursor>, limit: i64) -> Result<FeedPage> {
        let rows = match cursor {
            Some(c) => {
                sqlx::query(
                    "SELECT id, event_type, created_at, payload, world_id, agent_id, content_id \
                     FROM feed_events \
                     WHERE created_at < ? OR (created_at = ? AND id < ?) \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(c.created_at)
                .bind(c.created_at)
                .bind(c.seq)
                .bind(limit)
                .fetch_all(self.store.pool())
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, event_type, created_at, payload, world_id, agent_id, content_id \
                     FROM feed_events ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(self.store.pool())
                .await
            }
        }
        .context("Failed to read feed page")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(row_to_feed_item(row)?);
        }

        let next_cursor = items.last().map(|last| FeedCursor {
            created_at: last.created_at,
            seq: last.id,
        });

        Ok(FeedPage { items, next_cursor })
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM feed_events")
            .fetch_one(self.store.pool())
            .await
            .context("Failed to count feed events")?;
        Ok(row.get("n"))
    }
}

fn row_to_feed_item(row: &sqlx::sqlite::SqliteRow) -> Result<FeedItem> {
    let event_type: String = row.get("event_type");
    let payload: String = row.get("payload");

    let parse_opt = |col: &str| -> Result<Option<Uuid>> {
        let v: Option<String> = row.get(col);
        v.map(|s| Uuid::parse_str(&s).context("Malformed feed foreign key"))
            .transpose()
    };

    Ok(FeedItem {
        id: row.get("id"),
        event_type: FeedEventType::parse(&event_type)
            .with_context(|| format!("Unknown feed event type: {}", event_type))?,
        created_at: row.get("created_at"),
        payload: serde_json::from_str(&payload).context("Failed to parse feed payload")?,
        world_id: parse_opt("world_id")?,
        agent_id: parse_opt("agent_id")?,
        content_id: parse_opt("content_id")?,
    })
}
