//! Error types for Tandem

use thiserror::Error;

/// Result type alias using Tandem's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tandem operations
#[derive(Error, Debug)]
pub enum Error {
    /// The request does not fit the session's configured maxima. Raised
    /// before any device work is issued.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The cache manager could not admit a micro-batch.
    #[error(
        "KV cache exhausted for micro-batch {micro_batch}: \
         requested {requested} blocks, {available} available"
    )]
    ResourceExhausted {
        micro_batch: usize,
        requested: usize,
        available: usize,
    },

    /// A cross-rank receive or stop-check did not complete, or a peer rank
    /// reported a failure through the stop broadcast.
    #[error("Synchronization failure: {0}")]
    Synchronization(String),

    /// The caller's per-step callback failed.
    #[error("Callback failure: {0}")]
    Callback(String),

    #[error("Step capture error: {0}")]
    Capture(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the same session after this error
    /// (with different parameters or once capacity frees up).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::ResourceExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhausted_message() {
        let err = Error::ResourceExhausted {
            micro_batch: 2,
            requested: 8,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "KV cache exhausted for micro-batch 2: requested 8 blocks, 3 available"
        );
    }

    #[test]
    fn recoverable_classification() {
        assert!(Error::Configuration("batch too large".into()).is_recoverable());
        assert!(Error::ResourceExhausted {
            micro_batch: 0,
            requested: 1,
            available: 0
        }
        .is_recoverable());
        assert!(!Error::Synchronization("peer hung up".into()).is_recoverable());
        assert!(!Error::Callback("boom".into()).is_recoverable());
    }

    #[test]
    fn json_error_converts() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("JSON parsing error"));
    }
}
