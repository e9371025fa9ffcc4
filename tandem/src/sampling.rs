//! Sampling policy for a `generate` call

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How the decoder turns logits into tokens.
///
/// The numerical work lives behind [`Logits`](crate::Logits); this type only
/// selects the strategy and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of beams per sequence. `1` disables beam search.
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
    /// Logit temperature. `None` means greedy (argmax) decoding.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus probability threshold in (0, 1].
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Repetition penalty factor (1.0 = off).
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    /// Number of most recent tokens the repetition penalty looks at.
    #[serde(default)]
    pub repetition_penalty_window: usize,
    /// Seed for the PRNG. Same seed + same input → same output.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Minimum number of generated tokens before the end id is accepted.
    #[serde(default)]
    pub min_length: usize,
    /// Accumulate per-sequence log-probabilities into the output.
    #[serde(default)]
    pub output_log_probs: bool,
}

fn default_beam_width() -> usize {
    1
}

fn default_top_p() -> f32 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}

fn default_seed() -> u64 {
    42
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            beam_width: default_beam_width(),
            temperature: None,
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            repetition_penalty_window: 0,
            seed: default_seed(),
            min_length: 0,
            output_log_probs: false,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding, one beam.
    #[must_use]
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Beam search with `beam_width` beams.
    #[must_use]
    pub fn beam_search(beam_width: usize) -> Self {
        Self {
            beam_width,
            ..Self::default()
        }
    }

    /// Whether tokens are chosen by argmax (or beam expansion) rather than
    /// drawn from the distribution.
    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.temperature.is_none()
    }

    /// Reject parameter values the decoder cannot use.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the bad parameter.
    pub fn validate(&self) -> Result<()> {
        if self.beam_width == 0 {
            return Err(Error::Configuration("beam_width must be > 0".into()));
        }
        if let Some(t) = self.temperature {
            if t <= 0.0 || !t.is_finite() {
                return Err(Error::Configuration(format!(
                    "temperature must be > 0, got {t}"
                )));
            }
            if self.beam_width > 1 {
                return Err(Error::Configuration(
                    "sampling with temperature is not supported with beam search".into(),
                ));
            }
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::Configuration(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(Error::Configuration(format!(
                "repetition_penalty must be > 0, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }

    /// Seed for an independent sampling stream (one per micro-batch or one
    /// per request). Streams never share state, so assignment of sequences
    /// to streams fully determines the output.
    #[must_use]
    pub fn stream_seed(&self, stream: u64) -> u64 {
        splitmix64(
            self.seed
                .wrapping_add(stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        )
    }

    /// Seed of one draw: row `row` of `stream` at decode step `step`.
    #[must_use]
    pub fn draw_seed(&self, stream: u64, step: usize, row: usize) -> u64 {
        let position = ((step as u64) << 32) ^ row as u64;
        splitmix64(self.stream_seed(stream) ^ position.wrapping_mul(0xD6E8_FEB8_6659_FD93))
    }

    /// Extract the recent token window for repetition penalty.
    #[must_use]
    pub fn recent_window<'a>(&self, tokens: &'a [u32]) -> &'a [u32] {
        let start = tokens.len().saturating_sub(self.repetition_penalty_window);
        &tokens[start..]
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
