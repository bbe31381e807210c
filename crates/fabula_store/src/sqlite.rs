use anyhow::{Context, Result};
use fabula_core::{ContentItem, ContentKind, Inhabitant, World};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

/// SQLite-backed store holding both the content-store boundary tables
/// (worlds, inhabitants, content_items) and the derived tables the
/// maintainers own (relationships, arcs, feed_events).
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        // Single connection: SQLite is single-writer anyway, and one
        // connection makes an in-memory database shared across the store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(conn).await?;
                    Ok(())
                })
            })
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worlds (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create worlds table")?;

        // Inhabitant rows carry a running-mean embedding over the stories
        // that mention them; it backs pair semantic similarity.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inhabitants (
                id TEXT PRIMARY KEY,
                world_id TEXT NOT NULL,
                name TEXT NOT NULL,
                embedding BLOB,
                embedding_count INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(world_id) REFERENCES worlds(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create inhabitants table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_inhabitants_world ON inhabitants(world_id)")
            .execute(&self.pool)
            .await
            .context("Failed to create inhabitants world index")?;

        // created_at is the global ordering key; ties fall back to rowid.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content_items (
                id TEXT PRIMARY KEY,
                world_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                primary_inhabitant_id TEXT,
                mentions_json TEXT NOT NULL,
                embedding BLOB,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(world_id) REFERENCES worlds(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create content_items table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_content_world_created \
             ON content_items(world_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create content ordering index")?;

        // One row per unordered pair; the CHECK keeps pairs canonical so
        // mirrored edges can't exist.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relationships (
                world_id TEXT NOT NULL,
                a_id TEXT NOT NULL,
                b_id TEXT NOT NULL,
                co_occurrence INTEGER NOT NULL DEFAULT 0,
                similarity REAL,
                combined_score REAL NOT NULL DEFAULT 0.0,
                evidence_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (a_id, b_id),
                CHECK (a_id < b_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create relationships table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_relationships_world ON relationships(world_id)")
            .execute(&self.pool)
            .await
            .context("Failed to create relationships world index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS arcs (
                id TEXT PRIMARY KEY,
                world_id TEXT NOT NULL,
                inhabitant_id TEXT,
                title TEXT NOT NULL,
                member_ids_json TEXT NOT NULL,
                member_count INTEGER NOT NULL,
                centroid BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create arcs table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_arcs_world ON arcs(world_id)")
            .execute(&self.pool)
            .await
            .context("Failed to create arcs world index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_arcs_inhabitant ON arcs(inhabitant_id)")
            .execute(&self.pool)
            .await
            .context("Failed to create arcs inhabitant index")?;

        // Append-only; rows are never mutated, corrections append new events.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                world_id TEXT,
                agent_id TEXT,
                content_id TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create feed_events table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feed_created ON feed_events(created_at DESC, id DESC)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create feed ordering index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feed_event_type ON feed_events(event_type)")
            .execute(&self.pool)
            .await
            .context("Failed to create feed event_type index")?;

        Ok(())
    }
}

// =============================================================================
// Worlds & inhabitants
// =============================================================================

impl SqliteStore {
    pub async fn upsert_world(&self, world: &World) -> Result<()> {
        sqlx::query(
            "INSERT INTO worlds (id, name, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(world.id.to_string())
        .bind(&world.name)
        .bind(world.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert world")?;
        Ok(())
    }

    pub async fn get_world(&self, id: Uuid) -> Result<Option<World>> {
        let row = sqlx::query("SELECT id, name, created_at FROM worlds WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch world")?;

        row.map(|r| {
            let id_str: String = r.get("id");
            Ok(World {
                id: Uuid::parse_str(&id_str)?,
                name: r.get("name"),
                created_at: r.get("created_at"),
            })
        })
        .transpose()
    }

    pub async fn world_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM worlds ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list worlds")?;

        rows.iter()
            .map(|r| {
                let id: String = r.get("id");
                Uuid::parse_str(&id).context("Malformed world id")
            })
            .collect()
    }

    pub async fn upsert_inhabitant(&self, inhabitant: &Inhabitant) -> Result<()> {
        sqlx::query(
            "INSERT INTO inhabitants (id, world_id, name) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(inhabitant.id.to_string())
        .bind(inhabitant.world_id.to_string())
        .bind(&inhabitant.name)
        .execute(&self.pool)
        .await
        .context("Failed to upsert inhabitant")?;
        Ok(())
    }

    /// Fetch the subset of `ids` that exist, with display data.
    pub async fn inhabitants_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Inhabitant>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: String = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, world_id, name FROM inhabitants WHERE id IN ({})",
            placeholders
        );

        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id.to_string());
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch inhabitants by ids")?;

        rows.iter().map(row_to_inhabitant).collect()
    }

    pub async fn inhabitant_ids_for_world(&self, world_id: Uuid) -> Result<HashSet<Uuid>> {
        let rows = sqlx::query("SELECT id FROM inhabitants WHERE world_id = ?")
            .bind(world_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list inhabitant ids")?;

        rows.iter()
            .map(|r| {
                let id: String = r.get("id");
                Uuid::parse_str(&id).context("Malformed inhabitant id")
            })
            .collect()
    }

    pub async fn inhabitant_embedding(&self, id: Uuid) -> Result<Option<(Vec<f32>, i64)>> {
        let row = sqlx::query("SELECT embedding, embedding_count FROM inhabitants WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch inhabitant embedding")?;

        let Some(row) = row else { return Ok(None) };
        let blob: Option<Vec<u8>> = row.get("embedding");
        let count: i64 = row.get("embedding_count");
        match blob {
            Some(blob) => {
                let embedding: Vec<f32> =
                    bincode::deserialize(&blob).context("Failed to deserialize embedding")?;
                Ok(Some((embedding, count)))
            }
            None => Ok(None),
        }
    }

    pub async fn set_inhabitant_embedding(
        &self,
        id: Uuid,
        embedding: &[f32],
        count: i64,
    ) -> Result<()> {
        let blob = bincode::serialize(embedding).context("Failed to serialize embedding")?;
        sqlx::query("UPDATE inhabitants SET embedding = ?, embedding_count = ? WHERE id = ?")
            .bind(blob)
            .bind(count)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update inhabitant embedding")?;
        Ok(())
    }
}

// =============================================================================
// Content items
// =============================================================================

/// A content row plus its stored embedding.
///
/// Embeddings are computed once at creation and never recomputed, so
/// replay paths (backfill, reconciliation) read the stored vector instead
/// of calling the provider again.
#[derive(Debug, Clone)]
pub struct StoredContent {
    pub item: ContentItem,
    pub embedding: Option<Vec<f32>>,
}

impl SqliteStore {
    pub async fn insert_content(
        &self,
        item: &ContentItem,
        embedding: Option<&[f32]>,
    ) -> Result<()> {
        let mentions_json =
            serde_json::to_string(&item.mentions).context("Failed to serialize mentions")?;
        let embedding_blob = embedding
            .map(bincode::serialize)
            .transpose()
            .context("Failed to serialize embedding")?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO content_items
                (id, world_id, agent_id, kind, title, body,
                 primary_inhabitant_id, mentions_json, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.world_id.to_string())
        .bind(item.agent_id.to_string())
        .bind(item.kind.as_str())
        .bind(&item.title)
        .bind(&item.body)
        .bind(item.primary_inhabitant_id.map(|id| id.to_string()))
        .bind(&mentions_json)
        .bind(embedding_blob)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert content item")?;

        Ok(())
    }

    pub async fn get_content(&self, id: Uuid) -> Result<Option<StoredContent>> {
        let row = sqlx::query(
            "SELECT id, world_id, agent_id, kind, title, body, primary_inhabitant_id, \
             mentions_json, embedding, created_at FROM content_items WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch content item")?;

        row.as_ref().map(row_to_stored_content).transpose()
    }

    /// All content for a world in creation order, the replay order for
    /// backfill and reconciliation.
    pub async fn list_world_content(&self, world_id: Uuid) -> Result<Vec<StoredContent>> {
        let rows = sqlx::query(
            "SELECT id, world_id, agent_id, kind, title, body, primary_inhabitant_id, \
             mentions_json, embedding, created_at FROM content_items \
             WHERE world_id = ? ORDER BY created_at, rowid",
        )
        .bind(world_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list world content")?;

        rows.iter().map(row_to_stored_content).collect()
    }

    pub async fn list_all_content(&self) -> Result<Vec<StoredContent>> {
        let rows = sqlx::query(
            "SELECT id, world_id, agent_id, kind, title, body, primary_inhabitant_id, \
             mentions_json, embedding, created_at FROM content_items \
             ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list content corpus")?;

        rows.iter().map(row_to_stored_content).collect()
    }

    /// Members of an arc in creation order, given their ids.
    pub async fn content_by_ids_ordered(&self, ids: &[Uuid]) -> Result<Vec<ContentItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: String = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, world_id, agent_id, kind, title, body, primary_inhabitant_id, \
             mentions_json, embedding, created_at FROM content_items \
             WHERE id IN ({}) ORDER BY created_at, rowid",
            placeholders
        );

        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id.to_string());
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch arc members")?;

        rows.iter()
            .map(|r| row_to_stored_content(r).map(|sc| sc.item))
            .collect()
    }
}

// =============================================================================
// Derived-table maintenance helpers
// =============================================================================

impl SqliteStore {
    /// Wipe all derived state: relationship edges, arcs, feed events, and
    /// the inhabitant running-mean embeddings. The content corpus stays.
    ///
    /// Used by backfill so a replay starts from empty and re-running is
    /// idempotent. Resetting the feed autoincrement makes replayed event
    /// ids reproducible too.
    pub async fn clear_derived(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin clear")?;

        sqlx::query("DELETE FROM relationships")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM arcs").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM feed_events").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'feed_events'")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE inhabitants SET embedding = NULL, embedding_count = 0")
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("Failed to commit clear")?;
        tracing::info!("Cleared derived tables for replay");
        Ok(())
    }
}

// =============================================================================
// Row conversions
// =============================================================================

fn row_to_inhabitant(row: &sqlx::sqlite::SqliteRow) -> Result<Inhabitant> {
    let id: String = row.get("id");
    let world_id: String = row.get("world_id");
    Ok(Inhabitant {
        id: Uuid::parse_str(&id).context("Malformed inhabitant id")?,
        world_id: Uuid::parse_str(&world_id).context("Malformed world id")?,
        name: row.get("name"),
    })
}

fn row_to_stored_content(row: &sqlx::sqlite::SqliteRow) -> Result<StoredContent> {
    let id: String = row.get("id");
    let world_id: String = row.get("world_id");
    let agent_id: String = row.get("agent_id");
    let kind: String = row.get("kind");
    let primary: Option<String> = row.get("primary_inhabitant_id");
    let mentions_json: String = row.get("mentions_json");
    let embedding_blob: Option<Vec<u8>> = row.get("embedding");

    let embedding = embedding_blob
        .map(|blob| bincode::deserialize::<Vec<f32>>(&blob))
        .transpose()
        .context("Failed to deserialize content embedding")?;

    Ok(StoredContent {
        item: ContentItem {
            id: Uuid::parse_str(&id).context("Malformed content id")?,
            world_id: Uuid::parse_str(&world_id).context("Malformed world id")?,
            agent_id: Uuid::parse_str(&agent_id).context("Malformed agent id")?,
            kind: ContentKind::parse(&kind)
                .with_context(|| format!("Unknown content kind: {}", kind))?,
            title: row.get("title"),
            body: row.get("body"),
            primary_inhabitant_id: primary
                .map(|p| Uuid::parse_str(&p).context("Malformed inhabitant id"))
                .transpose()?,
            mentions: serde_json::from_str(&mentions_json)
                .context("Failed to parse mentions")?,
            created_at: row.get("created_at"),
        },
        embedding,
    })
}
