//! Host logits with scalar sampling.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tandem::logits::Logits;
use tandem::{Error, Result};

/// f32 logits held on the host, one row per sequence × beam.
#[derive(Debug, Clone)]
pub struct HostLogits {
    data: Vec<f32>,
    vocab_size: usize,
    batch_size: usize,
}

impl HostLogits {
    /// Wrap `batch_size * vocab_size` row-major values.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if the data length does not match.
    pub fn new(data: Vec<f32>, batch_size: usize, vocab_size: usize) -> Result<Self> {
        if vocab_size == 0 || data.len() != batch_size * vocab_size {
            return Err(Error::InvalidShape(format!(
                "{} logits for {batch_size} rows of vocabulary {vocab_size}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            vocab_size,
            batch_size,
        })
    }

    /// Raw values of one row.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if `row` is out of range.
    pub fn row(&self, row: usize) -> Result<&[f32]> {
        if row >= self.batch_size {
            return Err(Error::InvalidShape(format!(
                "row {row} out of range for {} rows",
                self.batch_size
            )));
        }
        let start = row * self.vocab_size;
        Ok(&self.data[start..start + self.vocab_size])
    }

    fn row_mut(&mut self, row: usize) -> Result<&mut [f32]> {
        if row >= self.batch_size {
            return Err(Error::InvalidShape(format!(
                "row {row} out of range for {} rows",
                self.batch_size
            )));
        }
        let start = row * self.vocab_size;
        Ok(&mut self.data[start..start + self.vocab_size])
    }
}

impl Logits for HostLogits {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn argmax(&self, row: usize) -> Result<u32> {
        let values = self.row(row)?;
        let mut max_idx = 0u32;
        let mut max_val = f32::NEG_INFINITY;
        #[allow(clippy::cast_possible_truncation)]
        for (i, &v) in values.iter().enumerate() {
            if v > max_val {
                max_val = v;
                max_idx = i as u32;
            }
        }
        Ok(max_idx)
    }

    fn sample_top_p(
        &self,
        row: usize,
        temperature: f32,
        top_p: f32,
        rng_seed: u64,
        repetition_penalty: f32,
        recent_tokens: &[u32],
    ) -> Result<u32> {
        let mut logits = self.row(row)?.to_vec();

        #[allow(clippy::float_cmp)]
        if repetition_penalty != 1.0 {
            for &tok in recent_tokens {
                if let Some(l) = logits.get_mut(tok as usize) {
                    if *l > 0.0 {
                        *l /= repetition_penalty;
                    } else {
                        *l *= repetition_penalty;
                    }
                }
            }
        }

        #[allow(clippy::float_cmp)]
        if temperature != 1.0 {
            for l in &mut logits {
                *l /= temperature;
            }
        }

        let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<f32> = logits.iter().map(|l| (l - max_logit).exp()).collect();
        let sum: f32 = probs.iter().sum();
        for p in &mut probs {
            *p /= sum;
        }

        let mut indexed: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        // Nucleus
        let mut cumulative = 0.0f32;
        let mut cutoff = indexed.len();
        for (i, &(_, p)) in indexed.iter().enumerate() {
            cumulative += p;
            if cumulative >= top_p {
                cutoff = i + 1;
                break;
            }
        }
        let nucleus = &indexed[..cutoff];

        let nucleus_sum: f32 = nucleus.iter().map(|(_, p)| p).sum();
        let mut rng = StdRng::seed_from_u64(rng_seed);
        let r: f32 = rng.gen();
        let mut cumul = 0.0;
        #[allow(clippy::cast_possible_truncation)]
        for &(idx, p) in nucleus {
            cumul += p / nucleus_sum;
            if cumul >= r {
                return Ok(idx as u32);
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        Ok(nucleus[0].0 as u32)
    }

    fn log_softmax(&self, row: usize) -> Result<Vec<f32>> {
        let values = self.row(row)?;
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = values
            .iter()
            .map(|v| (v - max).exp())
            .sum::<f32>()
            .ln()
            + max;
        Ok(values.iter().map(|v| v - log_sum).collect())
    }

    fn suppress_token(&mut self, row: usize, token: u32) -> Result<()> {
        let vocab = self.vocab_size;
        let slot = self.row_mut(row)?.get_mut(token as usize).ok_or_else(|| {
            Error::InvalidShape(format!("token {token} outside vocabulary of {vocab}"))
        })?;
        *slot = f32::NEG_INFINITY;
        Ok(())
    }
}
