use anyhow::Result;
use clap::{Parser, Subcommand};
use fabula_core::FabulaConfig;
use fabula_gateway::ApiServer;
use fabula_store::{
    ArcAssigner, FastembedProvider, FeedStore, IngestPipeline, Reconciler, RelationshipMaintainer,
    SqliteStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database (overrides config/env)
    #[arg(short, long)]
    db: Option<String>,

    /// Path to the TOML config file
    #[arg(short, long, default_value = "fabula.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server with the background reconciler
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Recompute derived state and repair drift, once
    Reconcile {
        /// Only this world (all worlds when omitted)
        #[arg(long)]
        world: Option<Uuid>,
    },
    /// Replay the full content corpus into empty derived tables
    Backfill,
    /// Print a world's relationship graph
    Graph {
        world: Uuid,
        #[arg(long, default_value_t = 0.0)]
        min_score: f32,
    },
    /// Print the newest feed events
    Feed {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        cursor: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = FabulaConfig::load_or_default(&cli.config);
    if let Some(db) = cli.db {
        cfg.database.path = db;
    }

    info!("Opening store at {}...", cfg.database.path);
    let store = SqliteStore::new(&cfg.database.path).await?;

    match cli.command {
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| cfg.http.host.clone());
            let port = port.unwrap_or(cfg.http.port);

            info!("Loading embedding model...");
            let embedder = Arc::new(FastembedProvider::new()?);

            let pipeline = Arc::new(IngestPipeline::new(store.clone(), embedder, cfg.clone()));
            let relationships =
                RelationshipMaintainer::new(store.clone(), cfg.relationship.clone());
            let arcs = ArcAssigner::new(store.clone(), cfg.arc.clone());
            let feed = FeedStore::new(store.clone());
            let reconciler = Arc::new(Reconciler::new(store.clone(), cfg.clone()));

            // Background reconciliation, decoupled from request traffic.
            let interval_hours = cfg.reconcile.interval_hours.max(1);
            let background = reconciler.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(interval_hours * 3600));
                loop {
                    ticker.tick().await;
                    match background.reconcile_all().await {
                        Ok(reports) => {
                            let drift: usize = reports.iter().map(|r| r.drift_total()).sum();
                            info!(
                                "Reconciliation pass over {} worlds, {} drift corrections",
                                reports.len(),
                                drift
                            );
                        }
                        Err(e) => error!("Reconciliation pass failed: {:#}", e),
                    }
                }
            });

            ApiServer::new(
                pipeline,
                relationships,
                arcs,
                feed,
                reconciler,
                cfg.feed.clone(),
                &host,
                port,
            )
            .run()
            .await
        }
        Command::Reconcile { world } => {
            let reconciler = Reconciler::new(store, cfg);
            let reports = match world {
                Some(world_id) => vec![reconciler.reconcile_world(world_id).await?],
                None => reconciler.reconcile_all().await?,
            };
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(())
        }
        Command::Backfill => {
            info!("Loading embedding model...");
            let embedder = Arc::new(FastembedProvider::new()?);
            let pipeline = IngestPipeline::new(store, embedder, cfg);
            let report = pipeline.backfill().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Graph { world, min_score } => {
            let relationships = RelationshipMaintainer::new(store, cfg.relationship.clone());
            let graph = relationships.get_graph(world, min_score).await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
            Ok(())
        }
        Command::Feed { limit, cursor } => {
            let feed = FeedStore::new(store);
            let cursor: Option<fabula_store::FeedCursor> =
                cursor.map(|s| s.parse()).transpose()?;
            let page = feed.read(cursor, cfg.feed.clamp_limit(Some(limit))).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
    }
}
