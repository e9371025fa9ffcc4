//! Tandem: pipeline-parallel autoregressive generation
//!
//! This crate provides the core types and the narrow collaborator traits the
//! generation session drives: the step engine, logits, the KV cache manager
//! and the cross-rank link. The session itself lives in `tandem-runtime`;
//! host reference collaborators live in `tandem-cpu`.

pub mod comm;
pub mod config;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod logits;
pub mod sampling;
pub mod step;
pub mod topology;
pub mod world;

pub use comm::{CrossRankLink, EventKind, LocalLink, Payload, PayloadTag, StopFlag, SyncEvent};
pub use config::{CacheConfig, SessionConfig};
pub use dtype::DType;
pub use engine::{
    ContextId, ShapeBucket, StepEngine, StepInputs, StepOutput, StepPhase, StepShape,
};
pub use error::{Error, Result};
pub use kv_cache::{
    BlockKvCacheManager, BlockPool, BlockTable, CacheExhausted, KvCacheManager, ReserveError,
};
pub use logits::Logits;
pub use sampling::SamplingConfig;
pub use step::{FinalizedSequence, FinishReason, StepUpdate};
pub use topology::ModelTopology;
pub use world::WorldLayout;
