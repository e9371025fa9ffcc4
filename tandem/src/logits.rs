//! Opaque logits trait for backend-agnostic decoding.
//!
//! The decoder decides *what* to do with each row (greedy, nucleus
//! sampling, beam expansion); the backend decides *how* (GPU kernel, CPU
//! scan, etc.).

use crate::{Error, Result};

/// Logits produced by the final pipeline stage for one micro-batch step.
///
/// Rows are laid out sequence-major: row `s * beam_width + b` holds beam `b`
/// of sequence `s`.
pub trait Logits: Send {
    /// Vocabulary size (number of logit values per row).
    fn vocab_size(&self) -> usize;

    /// Number of rows in this batch.
    fn batch_size(&self) -> usize;

    /// Greedy: return the token index with the highest logit in `row`.
    ///
    /// # Errors
    /// Returns an error if the underlying operation fails.
    fn argmax(&self, row: usize) -> Result<u32>;

    /// Nucleus (top-p) sampling with temperature and repetition penalty for
    /// a specific row.
    ///
    /// # Errors
    /// Returns an error if the underlying operation fails.
    fn sample_top_p(
        &self,
        row: usize,
        temperature: f32,
        top_p: f32,
        rng_seed: u64,
        repetition_penalty: f32,
        recent_tokens: &[u32],
    ) -> Result<u32>;

    /// Log-softmax of `row` over the whole vocabulary.
    ///
    /// # Errors
    /// Returns an error if the underlying operation fails.
    fn log_softmax(&self, row: usize) -> Result<Vec<f32>>;

    /// Exclude `token` from every later selection on `row` (its logit is
    /// driven to negative infinity).
    ///
    /// # Errors
    /// Returns an error if the row or token is out of range.
    fn suppress_token(&mut self, row: usize, token: u32) -> Result<()>;

    /// Log-probability of `token` in `row`.
    ///
    /// # Errors
    /// Returns an error if `token` is outside the vocabulary.
    fn log_prob(&self, row: usize, token: u32) -> Result<f32> {
        let log_probs = self.log_softmax(row)?;
        log_probs.get(token as usize).copied().ok_or_else(|| {
            Error::InvalidShape(format!(
                "token {token} outside vocabulary of {}",
                log_probs.len()
            ))
        })
    }

    /// The `k` most likely tokens of `row` with their log-probabilities,
    /// most likely first. Ties resolve to the lower token id.
    ///
    /// # Errors
    /// Returns an error if the underlying operation fails.
    fn top_k_log_probs(&self, row: usize, k: usize) -> Result<Vec<(u32, f32)>> {
        let log_probs = self.log_softmax(row)?;
        #[allow(clippy::cast_possible_truncation)]
        let mut indexed: Vec<(u32, f32)> = log_probs
            .into_iter()
            .enumerate()
            .map(|(i, lp)| (i as u32, lp))
            .collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        indexed.truncate(k);
        Ok(indexed)
    }
}
