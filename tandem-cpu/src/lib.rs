//! Host reference collaborators for Tandem.
//!
//! Everything a generation session needs to run without an accelerator: a
//! deterministic toy step engine, f32 host logits with scalar sampling, and
//! an in-process channel link for multi-rank pipelines driven from threads.
//!
//! Intended for tests, simulation and debugging. Nothing here is optimised.

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod engine;
pub mod link;
pub mod logits;

pub use engine::{EndRule, EngineStats, FaultPlan, ToyEngine, ToyRecording};
pub use link::ChannelLink;
pub use logits::HostLogits;
