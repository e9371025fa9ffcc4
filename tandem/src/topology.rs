//! Static model shape description

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::Result;

/// Shape of the model being served. Read-only after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTopology {
    /// Hidden dimension size
    pub hidden_size: usize,
    /// Number of transformer layers
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Number of key-value heads (for GQA, defaults to `num_heads`)
    #[serde(default)]
    pub num_kv_heads: Option<usize>,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Activation / KV cache dtype
    #[serde(default = "default_dtype")]
    pub dtype: DType,
    /// Logits dtype
    #[serde(default = "default_logits_dtype")]
    pub logits_dtype: DType,
}

fn default_dtype() -> DType {
    DType::F16
}

fn default_logits_dtype() -> DType {
    DType::F32
}

impl ModelTopology {
    /// Load the topology from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let topology: Self = serde_json::from_str(&content)?;
        Ok(topology)
    }

    /// Number of key-value heads (for grouped-query attention)
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    /// Dimension of each attention head
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Vocabulary rounded up so it splits evenly across `tensor_parallelism`
    /// ranks (the logits projection is column-parallel).
    #[must_use]
    pub fn padded_vocab_size(&self, tensor_parallelism: usize) -> usize {
        self.vocab_size.next_multiple_of(tensor_parallelism.max(1))
    }

    /// Bytes of KV cache one token occupies on a rank holding `num_layers`
    /// layers and `1 / tensor_parallelism` of the KV heads.
    #[must_use]
    pub fn kv_bytes_per_token(&self, num_layers: usize, tensor_parallelism: usize) -> usize {
        let kv_heads = self.num_kv_heads().div_ceil(tensor_parallelism.max(1));
        2 * num_layers * kv_heads * self.head_dim() * self.dtype.size_in_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_defaults() {
        let json = r#"{
            "hidden_size": 2048,
            "num_layers": 22,
            "num_heads": 32,
            "vocab_size": 32000
        }"#;

        let topology: ModelTopology = serde_json::from_str(json).unwrap();

        assert_eq!(topology.num_kv_heads(), 32);
        assert_eq!(topology.head_dim(), 64);
        assert_eq!(topology.dtype, DType::F16);
        assert_eq!(topology.logits_dtype, DType::F32);
    }

    #[test]
    fn test_padded_vocab_size() {
        let topology = ModelTopology {
            hidden_size: 64,
            num_layers: 2,
            num_heads: 4,
            num_kv_heads: None,
            vocab_size: 32001,
            dtype: DType::F32,
            logits_dtype: DType::F32,
        };
        assert_eq!(topology.padded_vocab_size(1), 32001);
        assert_eq!(topology.padded_vocab_size(2), 32002);
        assert_eq!(topology.padded_vocab_size(8), 32008);
    }

    #[test]
    fn test_kv_bytes_per_token_gqa() {
        let topology = ModelTopology {
            hidden_size: 2048,
            num_layers: 16,
            num_heads: 32,
            num_kv_heads: Some(8),
            vocab_size: 128_256,
            dtype: DType::BF16,
            logits_dtype: DType::F32,
        };
        // K and V, 8 layers on this stage, 4 heads per rank at tp=2, 64 dims, 2 bytes
        assert_eq!(topology.kv_bytes_per_token(8, 2), 2 * 8 * 4 * 64 * 2);
    }
}
