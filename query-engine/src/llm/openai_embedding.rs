use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::CreateEmbeddingRequestArgs;
use async_openai::Client;
use async_trait::async_trait;
use common::error::AppError;
use common::utils::tokens::TokenCounter;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::debug;

use super::TextEmbedder;

/// Default token window for a single embedding request.
pub const DEFAULT_EMBEDDING_MAX_TOKENS: usize = 8191;

/// OpenAI-compatible embedding client. Long inputs are split into token
/// windows; the per-window vectors are combined with a length-weighted
/// average and L2-normalized, so callers always receive a unit vector.
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    counter: TokenCounter,
    max_tokens: usize,
    timeout: Duration,
    max_retries: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        model: impl Into<String>,
        api_key: &str,
        base_url: &str,
        counter: TokenCounter,
        timeout: Duration,
        max_retries: usize,
    ) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self {
            client: Client::with_config(config),
            model: model.into(),
            counter,
            max_tokens: DEFAULT_EMBEDDING_MAX_TOKENS,
            timeout,
            max_retries: max_retries.min(10),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn embed_window(&self, window: &str) -> Result<Vec<f32>, AppError> {
        let strategy = ExponentialBackoff::from_millis(250)
            .map(jitter)
            .take(self.max_retries);

        let response = Retry::spawn(strategy, || async {
            let request = CreateEmbeddingRequestArgs::default()
                .model(&self.model)
                .input([window])
                .build()
                .map_err(|e| AppError::Embedding(e.to_string()))?;

            tokio::time::timeout(self.timeout, self.client.embeddings().create(request))
                .await
                .map_err(|_| AppError::Embedding("embedding request timed out".to_string()))?
                .map_err(|e| AppError::Embedding(e.to_string()))
        })
        .await?;

        response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| AppError::Embedding("no embedding data received".to_string()))
    }
}

#[async_trait]
impl TextEmbedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let windows = self.counter.chunks(text, self.max_tokens)?;
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(windows.len());
        let mut weights = Vec::with_capacity(windows.len());
        for window in &windows {
            let vector = self.embed_window(window).await?;
            weights.push(self.counter.count(window) as f32);
            vectors.push(vector);
        }
        debug!(windows = windows.len(), "Combined embedding windows");
        Ok(combine_embeddings(&vectors, &weights))
    }
}

/// Length-weighted average of the window vectors, normalized to unit length.
pub(crate) fn combine_embeddings(vectors: &[Vec<f32>], weights: &[f32]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let dimension = first.len();
    let total_weight: f32 = weights.iter().sum();
    if total_weight == 0.0 {
        return vec![0.0; dimension];
    }

    let mut combined = vec![0.0f32; dimension];
    for (vector, weight) in vectors.iter().zip(weights) {
        for (slot, value) in combined.iter_mut().zip(vector) {
            *slot += value * weight / total_weight;
        }
    }

    let norm: f32 = combined.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut combined {
            *value /= norm;
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_embedding_is_unit_norm() {
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let combined = combine_embeddings(&vectors, &[3.0, 1.0]);
        let norm: f32 = combined.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        // the heavier window dominates
        assert!(combined[0] > combined[1]);
    }

    #[test]
    fn test_single_window_passthrough_direction() {
        let combined = combine_embeddings(&[vec![0.0, 2.0]], &[5.0]);
        assert!((combined[1] - 1.0).abs() < 1e-6);
        assert!(combined[0].abs() < 1e-6);
    }

    #[test]
    fn test_empty_input() {
        assert!(combine_embeddings(&[], &[]).is_empty());
    }
}
