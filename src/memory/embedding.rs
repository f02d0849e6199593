//! Embedding service over a Model2Vec static model.
//!
//! The model loads once (lazily) and every encode runs on a blocking thread.
//! When the model cannot be loaded the service degrades to "unavailable" and
//! the hybrid retriever falls back to keyword-only scoring rather than
//! failing the request.

use anyhow::{Context, Result};
use model2vec_rs::model::StaticModel;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub const DEFAULT_MODEL_ID: &str = "minishlab/potion-base-8M";

enum Backend {
    /// Model2Vec static model, lazily loaded.
    Model {
        model_id: String,
        cell: OnceCell<Option<Arc<StaticModel>>>,
    },
    /// Deterministic bag-of-words hashing. No model download; used by tests
    /// and as an explicit opt-in for fully offline deployments.
    Hashed { dim: usize },
}

pub struct EmbeddingService {
    backend: Backend,
}

impl EmbeddingService {
    pub fn new() -> Self {
        let model_id =
            std::env::var("MODEL2VEC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());
        Self {
            backend: Backend::Model {
                model_id,
                cell: OnceCell::new(),
            },
        }
    }

    pub fn hashed(dim: usize) -> Self {
        Self {
            backend: Backend::Hashed { dim: dim.max(8) },
        }
    }

    async fn get_model(&self) -> Option<Arc<StaticModel>> {
        let Backend::Model { model_id, cell } = &self.backend else {
            return None;
        };
        cell.get_or_init(|| async {
            let model_id = model_id.clone();
            info!("[Embedding] Loading Model2Vec model: {}", model_id);
            let loaded = tokio::task::spawn_blocking(move || {
                StaticModel::from_pretrained(&model_id, None, None, None)
            })
            .await;
            match loaded {
                Ok(Ok(model)) => Some(Arc::new(model)),
                Ok(Err(e)) => {
                    warn!("[Embedding] Model load failed: {} — embeddings disabled", e);
                    None
                }
                Err(e) => {
                    warn!("[Embedding] Model load task failed: {} — embeddings disabled", e);
                    None
                }
            }
        })
        .await
        .clone()
    }

    pub async fn is_available(&self) -> bool {
        match &self.backend {
            Backend::Hashed { .. } => true,
            Backend::Model { .. } => self.get_model().await.is_some(),
        }
    }

    /// Encode one text. `None` when the model is unavailable.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match &self.backend {
            Backend::Hashed { dim } => Some(hash_embed(text, *dim)),
            Backend::Model { .. } => {
                let model = self.get_model().await?;
                let text = text.to_string();
                let result =
                    tokio::task::spawn_blocking(move || model.encode_single(&text)).await;
                match result {
                    Ok(vec) => Some(vec),
                    Err(e) => {
                        warn!("[Embedding] encode task failed: {}", e);
                        None
                    }
                }
            }
        }
    }

    pub async fn embed_or_err(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text)
            .await
            .context("embedding model unavailable")
    }
}

impl Default for EmbeddingService {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic bag-of-words hash embedding, L2-normalized. Token overlap
/// maps to cosine similarity, which is all the hybrid retriever needs from
/// the offline backend.
fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    let mut vec = vec![0.0_f32; dim];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        // FNV-1a over the token bytes.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in token.bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        vec[(hash % dim as u64) as usize] += 1.0;
    }
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
    vec
}

/// Cosine similarity between two f32 vectors. 0.0 on mismatch or zero
/// magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}
