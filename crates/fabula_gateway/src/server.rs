use crate::types::{FeedParams, GraphParams, ReconcileRequest, SubmitContent};
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fabula_core::config::FeedConfig;
use fabula_store::{
    ArcAssigner, ArcSummary, ArcWithMembers, BackfillReport, DriftReport, FeedCursor, FeedItem,
    FeedStore, IngestPipeline, IngestReceipt, Reconciler, RelationshipGraph,
    RelationshipMaintainer,
};
use futures_util::stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

/// Shared state for the API server.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<IngestPipeline>,
    relationships: RelationshipMaintainer,
    arcs: ArcAssigner,
    feed: FeedStore,
    reconciler: Arc<Reconciler>,
    feed_cfg: FeedConfig,
}

/// The HTTP surface over the derived stores.
///
/// - `POST /content` — the content-created hook
/// - `GET /worlds/:world_id/graph` — relationship graph
/// - `GET /arcs/:story_id`, `GET /worlds/:world_id/arcs` — arc reads
/// - `GET /feed`, `GET /feed/stream` — buffered and incremental feed reads
/// - `POST /reconcile`, `POST /backfill` — maintenance triggers
/// - `GET /health`
pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
}

impl ApiServer {
    pub fn new(
        pipeline: Arc<IngestPipeline>,
        relationships: RelationshipMaintainer,
        arcs: ArcAssigner,
        feed: FeedStore,
        reconciler: Arc<Reconciler>,
        feed_cfg: FeedConfig,
        host: &str,
        port: u16,
    ) -> Self {
        Self {
            state: AppState {
                pipeline,
                relationships,
                arcs,
                feed,
                reconciler,
                feed_cfg,
            },
            host: host.to_string(),
            port,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/content", post(submit_content))
            .route("/worlds/:world_id/graph", get(get_graph))
            .route("/worlds/:world_id/arcs", get(list_arcs))
            .route("/arcs/:story_id", get(get_arc))
            .route("/feed", get(get_feed))
            .route("/feed/stream", get(stream_feed))
            .route("/reconcile", post(reconcile))
            .route("/backfill", post(backfill))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        tracing::info!("API listening on {}", addr);
        axum::serve(listener, router)
            .await
            .context("API server failed")?;
        Ok(())
    }
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("Request failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn health() -> &'static str {
    "ok"
}

async fn submit_content(
    State(state): State<AppState>,
    Json(submit): Json<SubmitContent>,
) -> Result<Json<IngestReceipt>, (StatusCode, String)> {
    let item = submit.into_content_item();
    state
        .pipeline
        .content_created(item)
        .await
        .map(Json)
        .map_err(internal)
}

async fn get_graph(
    State(state): State<AppState>,
    Path(world_id): Path<Uuid>,
    Query(params): Query<GraphParams>,
) -> Result<Json<RelationshipGraph>, (StatusCode, String)> {
    state
        .relationships
        .get_graph(world_id, params.min_score)
        .await
        .map(Json)
        .map_err(internal)
}

async fn get_arc(
    State(state): State<AppState>,
    Path(story_id): Path<Uuid>,
) -> Result<Json<Option<ArcWithMembers>>, (StatusCode, String)> {
    state.arcs.get_arc(story_id).await.map(Json).map_err(internal)
}

async fn list_arcs(
    State(state): State<AppState>,
    Path(world_id): Path<Uuid>,
) -> Result<Json<Vec<ArcSummary>>, (StatusCode, String)> {
    state.arcs.list_arcs(world_id).await.map(Json).map_err(internal)
}

fn parse_cursor(raw: &Option<String>) -> Result<Option<FeedCursor>, (StatusCode, String)> {
    match raw {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("{}", e))),
    }
}

async fn get_feed(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
) -> Result<Json<fabula_store::FeedPage>, (StatusCode, String)> {
    let cursor = parse_cursor(&params.cursor)?;
    let limit = state.feed_cfg.clamp_limit(params.limit);
    state.feed.read(cursor, limit).await.map(Json).map_err(internal)
}

// =============================================================================
// Streaming feed
// =============================================================================

enum StreamStep {
    /// Read the next batch starting below `cursor`.
    Page {
        cursor: Option<FeedCursor>,
        remaining: i64,
        total: usize,
    },
    Finished,
}

fn items_frame(items: &[FeedItem]) -> Bytes {
    let mut buf = serde_json::to_vec(&json!({"type": "items", "items": items})).unwrap_or_default();
    buf.push(b'\n');
    Bytes::from(buf)
}

fn done_frame(next_cursor: Option<FeedCursor>, total: usize) -> Bytes {
    let mut buf = serde_json::to_vec(&json!({
        "type": "done",
        "next_cursor": next_cursor,
        "total": total,
    }))
    .unwrap_or_default();
    buf.push(b'\n');
    Bytes::from(buf)
}

/// Incrementally-flushed variant of the feed read: the same page, but
/// delivered as newline-delimited JSON frames while rows are still being
/// fetched. Repeated `items` frames, then one `done` frame carrying the
/// next cursor and the total count.
async fn stream_feed(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let cursor = parse_cursor(&params.cursor)?;
    let limit = state.feed_cfg.clamp_limit(params.limit);
    let batch = state.feed_cfg.stream_batch_size.max(1);
    let feed = state.feed.clone();

    let body_stream = stream::unfold(
        StreamStep::Page {
            cursor,
            remaining: limit,
            total: 0,
        },
        move |step| {
            let feed = feed.clone();
            async move {
                match step {
                    StreamStep::Finished => None,
                    StreamStep::Page {
                        cursor,
                        remaining,
                        total,
                    } => {
                        if remaining <= 0 {
                            return Some((
                                Ok::<Bytes, Infallible>(done_frame(cursor, total)),
                                StreamStep::Finished,
                            ));
                        }
                        match feed.read(cursor, batch.min(remaining)).await {
                            Ok(page) if !page.items.is_empty() => {
                                let n = page.items.len();
                                let frame = items_frame(&page.items);
                                Some((
                                    Ok(frame),
                                    StreamStep::Page {
                                        cursor: page.next_cursor,
                                        remaining: remaining - n as i64,
                                        total: total + n,
                                    },
                                ))
                            }
                            Ok(_) => Some((Ok(done_frame(cursor, total)), StreamStep::Finished)),
                            Err(e) => {
                                tracing::error!("Feed stream read failed: {:#}", e);
                                // Close with the last good cursor so the
                                // client can resume from where it left off.
                                Some((Ok(done_frame(cursor, total)), StreamStep::Finished))
                            }
                        }
                    }
                }
            }
        },
    );

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body_stream),
    ))
}

// =============================================================================
// Maintenance
// =============================================================================

async fn reconcile(
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<Vec<DriftReport>>, (StatusCode, String)> {
    let result = match req.world_id {
        Some(world_id) => state
            .reconciler
            .reconcile_world(world_id)
            .await
            .map(|r| vec![r]),
        None => state.reconciler.reconcile_all().await,
    };
    result.map(Json).map_err(internal)
}

async fn backfill(
    State(state): State<AppState>,
) -> Result<Json<BackfillReport>, (StatusCode, String)> {
    state.pipeline.backfill().await.map(Json).map_err(internal)
}
