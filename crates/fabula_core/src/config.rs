use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FabulaConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub relationship: RelationshipConfig,
    pub arc: ArcConfig,
    pub feed: FeedConfig,
    pub reconcile: ReconcileConfig,
    pub ingest: IngestConfig,
}

impl FabulaConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: FabulaConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FABULA_DB") {
            self.database.path = v;
        }
        if let Ok(v) = std::env::var("FABULA_HTTP_HOST") {
            self.http.host = v;
        }
        if let Ok(v) = std::env::var("FABULA_HTTP_PORT") {
            if let Ok(n) = v.parse() {
                self.http.port = n;
            }
        }
        if let Ok(v) = std::env::var("FABULA_ARC_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.arc.similarity_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("FABULA_RECONCILE_INTERVAL_HOURS") {
            if let Ok(n) = v.parse() {
                self.reconcile.interval_hours = n;
            }
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "fabula.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8640,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelationshipConfig {
    /// Weight of the normalized co-occurrence count in the combined score.
    pub co_occurrence_weight: f32,
    /// Weight of the semantic similarity in the combined score.
    pub similarity_weight: f32,
    /// Maximum evidence ids kept per edge (most recent win).
    pub evidence_cap: usize,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            co_occurrence_weight: 0.6,
            similarity_weight: 0.4,
            evidence_cap: 50,
        }
    }
}

impl RelationshipConfig {
    /// The two weights, renormalized so they sum to 1.
    ///
    /// A config file may specify weights that don't add up; scores must
    /// stay in [0,1] regardless.
    pub fn weights(&self) -> (f32, f32) {
        let sum = self.co_occurrence_weight + self.similarity_weight;
        if sum <= f32::EPSILON {
            return (1.0, 0.0);
        }
        (
            self.co_occurrence_weight / sum,
            self.similarity_weight / sum,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArcConfig {
    /// Minimum centroid similarity for a story to join an existing arc.
    pub similarity_threshold: f32,
    /// Per-world overrides; worlds with naturally similar premises may
    /// need a higher bar to avoid over-merging threads.
    pub world_thresholds: HashMap<Uuid, f32>,
}

impl Default for ArcConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            world_thresholds: HashMap::new(),
        }
    }
}

impl ArcConfig {
    pub fn threshold_for(&self, world_id: Uuid) -> f32 {
        self.world_thresholds
            .get(&world_id)
            .copied()
            .unwrap_or(self.similarity_threshold)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Page size when the caller doesn't specify one.
    pub default_limit: i64,
    /// Hard cap on requested page sizes.
    pub max_limit: i64,
    /// Rows per flushed batch on the streaming read path.
    pub stream_batch_size: i64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 200,
            stream_batch_size: 32,
        }
    }
}

impl FeedConfig {
    pub fn clamp_limit(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Interval between background reconciliation passes.
    pub interval_hours: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_hours: 24 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Bounded retries for store conflicts before deferring to reconciliation.
    pub max_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}
