//! Tandem Runtime: the generation session
//!
//! Drives autoregressive generation for one rank of a pipeline- and
//! tensor-parallel group. The session owns the control loop; the forward
//! pass, the cache memory and the transport belong to collaborators it
//! reaches through the traits of the `tandem` crate.
//!
//! # Architecture
//!
//! ```text
//! GenerationSession<E, C, L>       ← one per rank, calls are sequential
//!   ├── ContextPool                ← per micro-batch execution contexts
//!   ├── CapturedStepCache × N      ← ping-pong recorded generation steps
//!   ├── E: StepEngine              ← forward pass of this rank's stage
//!   ├── C: KvCacheManager          ← per-sequence cache reservations
//!   └── L: CrossRankLink           ← decoder updates + stop consensus
//!
//! GenerationRun                    ← one call in flight
//!   └── MicroBatch × N             ← DecoderState, reservations, transfers
//! ```

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

pub mod captured_step;
pub mod context_pool;
pub mod decoder;
pub mod io;
pub mod micro_batch;
pub mod session;

pub use captured_step::{CapturedStepCache, SlotState};
pub use context_pool::ContextPool;
pub use decoder::{DecoderRole, DecoderState, SamplingStreams, StepRows, StopCriteria};
pub use io::{GenerationInput, GenerationOutput, StepCallback, StepEvent};
pub use micro_batch::{partition, MicroBatch, PendingRecv};
pub use session::{
    AbortHandle, GenerationRun, GenerationSession, MicroBatchStatus, MicroBatchStepper,
};
