//! Session configuration
//!
//! Fixed at session construction. `generate` may be called with batch sizes
//! and beam widths smaller than the configured maxima, never larger. The
//! maximum batch size is divided across micro-batches to size each
//! micro-batch's execution contexts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::world::WorldLayout;
use crate::{Error, Result};

/// Configuration for the reference block-pool KV cache manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of tokens stored per block.
    #[serde(default = "default_tokens_per_block")]
    pub tokens_per_block: usize,
    /// Total number of blocks in the pool.
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
}

fn default_tokens_per_block() -> usize {
    64
}

fn default_num_blocks() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tokens_per_block: default_tokens_per_block(),
            num_blocks: default_num_blocks(),
        }
    }
}

/// Immutable configuration of a generation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Largest batch (number of prompts) accepted by `generate`.
    pub max_batch_size: usize,
    /// Largest beam width accepted by `generate`.
    pub max_beam_width: usize,
    /// Upper bound on prompt length plus generated tokens.
    pub max_sequence_length: usize,
    /// Run one decoder (and one sampling stream) per request instead of one
    /// per micro-batch.
    #[serde(default)]
    pub decoder_per_request: bool,
    /// Record generation steps once per shape and replay them afterwards.
    #[serde(default)]
    pub reuse_captured_steps: bool,
    /// KV cache manager configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Explicit micro-batch count. When `None` it is inferred from the
    /// pipeline depth (one micro-batch per pipeline stage).
    #[serde(default)]
    pub num_micro_batches: Option<usize>,
    /// Upper bound on a single cross-rank wait, in milliseconds.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

impl SessionConfig {
    /// Create a configuration with the three required maxima and defaults
    /// for everything else.
    #[must_use]
    pub fn new(max_batch_size: usize, max_beam_width: usize, max_sequence_length: usize) -> Self {
        Self {
            max_batch_size,
            max_beam_width,
            max_sequence_length,
            decoder_per_request: false,
            reuse_captured_steps: false,
            cache: CacheConfig::default(),
            num_micro_batches: None,
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }

    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed values are invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the values are invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values no session can run with.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_batch_size", self.max_batch_size),
            ("max_beam_width", self.max_beam_width),
            ("max_sequence_length", self.max_sequence_length),
            ("cache.tokens_per_block", self.cache.tokens_per_block),
            ("cache.num_blocks", self.cache.num_blocks),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Configuration(format!("{name} must be > 0")));
            }
        }
        match self.num_micro_batches {
            Some(0) => Err(Error::Configuration(
                "num_micro_batches must be > 0".into(),
            )),
            Some(n) if n > self.max_batch_size => Err(Error::Configuration(format!(
                "num_micro_batches ({n}) exceeds max_batch_size ({})",
                self.max_batch_size
            ))),
            _ => Ok(()),
        }
    }

    /// Number of micro-batches a session on `world` runs with.
    ///
    /// The explicit override wins; otherwise a pipeline-parallel group uses
    /// one micro-batch per stage so every stage has work in flight, and a
    /// single stage uses one.
    #[must_use]
    pub fn resolve_micro_batches(&self, world: &WorldLayout) -> usize {
        let inferred = if world.is_pipeline_parallel() {
            world.pipeline_parallelism
        } else {
            1
        };
        self.num_micro_batches
            .unwrap_or(inferred)
            .clamp(1, self.max_batch_size)
    }

    /// Sequences per micro-batch when the maximum batch is split into
    /// `num_micro_batches` groups.
    #[must_use]
    pub fn micro_batch_capacity(&self, num_micro_batches: usize) -> usize {
        self.max_batch_size.div_ceil(num_micro_batches.max(1))
    }

    /// Cross-rank wait bound as a [`Duration`].
    #[must_use]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let json = r#"{
            "max_batch_size": 8,
            "max_beam_width": 1,
            "max_sequence_length": 512
        }"#;

        let config = SessionConfig::from_json(json).unwrap();

        assert_eq!(config.max_batch_size, 8);
        assert!(!config.decoder_per_request);
        assert!(!config.reuse_captured_steps);
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.num_micro_batches, None);
        assert_eq!(config.sync_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_config_full() {
        let json = r#"{
            "max_batch_size": 16,
            "max_beam_width": 4,
            "max_sequence_length": 2048,
            "decoder_per_request": true,
            "reuse_captured_steps": true,
            "cache": { "tokens_per_block": 32, "num_blocks": 4096 },
            "num_micro_batches": 4,
            "sync_timeout_ms": 500
        }"#;

        let config = SessionConfig::from_json(json).unwrap();

        assert!(config.decoder_per_request);
        assert!(config.reuse_captured_steps);
        assert_eq!(config.cache.tokens_per_block, 32);
        assert_eq!(config.cache.num_blocks, 4096);
        assert_eq!(config.num_micro_batches, Some(4));
        assert_eq!(config.micro_batch_capacity(4), 4);
    }

    #[test]
    fn test_validate_rejects_zero_maxima() {
        let err = SessionConfig::new(0, 1, 128).validate().unwrap_err();
        assert!(err.to_string().contains("max_batch_size"), "{err}");

        let mut config = SessionConfig::new(4, 1, 128);
        config.cache.num_blocks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_micro_batch_override() {
        let mut config = SessionConfig::new(4, 1, 128);
        config.num_micro_batches = Some(0);
        assert!(config.validate().is_err());

        config.num_micro_batches = Some(5);
        assert!(config.validate().is_err());

        config.num_micro_batches = Some(4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_micro_batches() {
        let config = SessionConfig::new(8, 1, 128);
        assert_eq!(config.resolve_micro_batches(&WorldLayout::single()), 1);

        let pipelined = WorldLayout::new(1, 4, 0).unwrap();
        assert_eq!(config.resolve_micro_batches(&pipelined), 4);

        let mut config = SessionConfig::new(2, 1, 128);
        assert_eq!(config.resolve_micro_batches(&pipelined), 2);

        config.num_micro_batches = Some(1);
        assert_eq!(config.resolve_micro_batches(&pipelined), 1);
    }

    #[test]
    fn test_micro_batch_capacity_rounds_up() {
        let config = SessionConfig::new(7, 1, 128);
        assert_eq!(config.micro_batch_capacity(1), 7);
        assert_eq!(config.micro_batch_capacity(2), 4);
        assert_eq!(config.micro_batch_capacity(3), 3);
    }
}
