use std::sync::Arc;

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::error::AppError;

/// Shared token counter over a tiktoken encoding. Cloning is cheap; the
/// underlying BPE tables are reference counted.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TokenCounter {
    /// Builds a counter for the named encoding. `cl100k_base` is the family
    /// used by the default chat and embedding models.
    pub fn new(encoding_model: &str) -> Result<Self, AppError> {
        let bpe = match encoding_model {
            "cl100k_base" => cl100k_base(),
            "o200k_base" => o200k_base(),
            other => {
                return Err(AppError::Validation(format!(
                    "unknown encoding model: {other}"
                )))
            }
        }
        .map_err(|e| AppError::Internal(format!("failed to load tokenizer: {e}")))?;

        Ok(Self { bpe: Arc::new(bpe) })
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Splits `text` into windows of at most `max_tokens` tokens, decoding
    /// each window back to a string. Windows preserve input order.
    pub fn chunks(&self, text: &str, max_tokens: usize) -> Result<Vec<String>, AppError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = self.bpe.encode_with_special_tokens(text);
        let mut windows = Vec::new();
        for window in tokens.chunks(max_tokens.max(1)) {
            let decoded = self
                .bpe
                .decode(window.to_vec())
                .map_err(|e| AppError::Internal(format!("failed to decode tokens: {e}")))?;
            windows.push(decoded);
        }
        Ok(windows)
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_is_positive_for_text() {
        let counter = TokenCounter::new("cl100k_base").unwrap();
        assert!(counter.count("hello world") > 0);
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn test_chunks_cover_whole_text() {
        let counter = TokenCounter::new("cl100k_base").unwrap();
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let windows = counter.chunks(text, 3).unwrap();
        assert!(windows.len() > 1);
        assert_eq!(windows.concat(), text);
        for window in &windows {
            assert!(counter.count(window) <= 3);
        }
    }

    #[test]
    fn test_unknown_encoding_is_rejected() {
        assert!(TokenCounter::new("p50k_base").is_err());
    }
}
