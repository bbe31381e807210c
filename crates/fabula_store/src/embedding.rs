use anyhow::Result;
use async_trait::async_trait;
use fabula_core::EmbeddingProvider;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use std::sync::Arc;

pub type Embedding = Vec<f32>;

/// Local fastembed-backed implementation of the embedding boundary.
///
/// The model download/load happens once at construction; the per-call
/// embed is CPU-bound and may still take tens of milliseconds, which is
/// why the ingest pipeline computes vectors before touching any row.
#[derive(Clone)]
pub struct FastembedProvider {
    model: Arc<TextEmbedding>,
}

impl FastembedProvider {
    pub fn new() -> Result<Self> {
        // multilingual-e5-small handles mixed-language story text well.
        let options = InitOptions::new(FastEmbedModel::MultilingualE5Small)
            .with_show_download_progress(true);

        let model = TextEmbedding::try_new(options)?;

        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastembedProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.model.embed(vec![text], None)?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Failed to generate embedding"))
    }
}

/// Calculate cosine similarity between two vectors.
/// Returns a value between -1.0 and 1.0 (1.0 = identical direction).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// One step of a running mean: `m' = m + (x - m) / n` where `n` counts the
/// sample being folded in. Dimension mismatches (model swap) reset to the
/// new sample rather than mixing spaces.
pub fn incremental_mean(prev: Option<&[f32]>, sample: &[f32], prev_count: i64) -> Vec<f32> {
    match prev {
        Some(mean) if mean.len() == sample.len() && prev_count > 0 => {
            let n = (prev_count + 1) as f32;
            mean.iter()
                .zip(sample)
                .map(|(m, x)| m + (x - m) / n)
                .collect()
        }
        _ => sample.to_vec(),
    }
}
