//! Step engine trait: the forward-pass execution engine as seen by the
//! generation session.
//!
//! The engine is a black box that executes one forward step of *this rank's*
//! pipeline stage against a preallocated execution context. Hidden-state
//! hand-off between stages is the engine's own business; the session only
//! exchanges decoder state.
//!
//! Engines may also record a step into a replayable capture (e.g. a CUDA
//! graph) so repeated steps of the same shape skip per-op host dispatch.

use crate::logits::Logits;
use crate::Result;

/// Handle to an execution context owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub usize);

/// Which half of generation a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepPhase {
    /// First step: the whole prompt is processed and the first token sampled.
    Context,
    /// Every later step: one token per row.
    Generation,
}

/// Shape range an execution context is bound to.
///
/// Every dimension accepts `1..=max`; [`ShapeBucket::row_profile`] and
/// [`ShapeBucket::input_profile`] give the `[min, opt, max]` triple the
/// engine optimises for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeBucket {
    pub phase: StepPhase,
    /// Rows (sequences × beams) the context can hold.
    pub max_rows: usize,
    pub beam_width: usize,
    /// Longest per-row input this step (prompt length bucket on the context
    /// step, 1 afterwards).
    pub max_input_len: usize,
    /// Longest total sequence the context's attention must cover.
    pub max_sequence_length: usize,
    /// Ping-pong index for generation contexts (0 or 1).
    pub flip: usize,
}

impl ShapeBucket {
    /// `[min, opt, max]` rows.
    #[must_use]
    pub fn row_profile(&self) -> [usize; 3] {
        profile(self.max_rows)
    }

    /// `[min, opt, max]` input length.
    #[must_use]
    pub fn input_profile(&self) -> [usize; 3] {
        profile(self.max_input_len)
    }

    /// Whether a step of `rows` rows and `input_len` tokens per row fits.
    #[must_use]
    pub fn admits(&self, rows: usize, input_len: usize) -> bool {
        (1..=self.max_rows).contains(&rows) && (1..=self.max_input_len).contains(&input_len)
    }
}

fn profile(max: usize) -> [usize; 3] {
    [1, max.div_ceil(2).max(1), max]
}

/// Exact shape of one step. A capture is only valid for the shape it was
/// recorded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepShape {
    pub phase: StepPhase,
    pub rows: usize,
    pub beam_width: usize,
    pub input_len: usize,
}

/// Host-side inputs assembled for one micro-batch step.
///
/// Row `r` is beam `r % beam_width` of the micro-batch's sequence
/// `r / beam_width`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInputs {
    pub shape: StepShape,
    pub micro_batch: usize,
    pub step: usize,
    /// Tokens fed to each row (the prompt on the context step, the last
    /// generated token afterwards; a finished row repeats its last token).
    pub tokens: Vec<Vec<u32>>,
    /// Tokens already resident in each row's KV cache before this step.
    pub past_lengths: Vec<usize>,
    /// Whether each row is still generating.
    pub live: Vec<bool>,
    /// Cache slot (absolute sequence index) of each row.
    pub cache_slots: Vec<usize>,
}

/// Result of one forward step on this rank.
#[derive(Debug)]
pub enum StepOutput<L> {
    /// Final pipeline stage: logits, one row per `StepInputs` row.
    Logits(L),
    /// Intermediate stage: activations were handed to the next stage.
    Forwarded,
}

impl<L> StepOutput<L> {
    /// The logits, if this rank holds the final stage.
    pub fn into_logits(self) -> Option<L> {
        match self {
            Self::Logits(l) => Some(l),
            Self::Forwarded => None,
        }
    }
}

/// Forward-pass execution engine for one rank.
pub trait StepEngine {
    /// Logits type returned by the final stage.
    type Logits: Logits;

    /// Opaque replayable recording of one step.
    type Recording;

    /// Return a context bound to `bucket`, creating it if needed.
    ///
    /// # Errors
    /// Returns an error if the engine has no profile covering the bucket.
    fn select_context(&mut self, bucket: &ShapeBucket) -> Result<ContextId>;

    /// Execute one step directly.
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    fn run_step(&mut self, context: ContextId, inputs: &StepInputs)
        -> Result<StepOutput<Self::Logits>>;

    /// Execute one step while recording it for later replay.
    ///
    /// # Errors
    /// Returns an error if the forward pass or the capture fails.
    fn record_step(
        &mut self,
        context: ContextId,
        inputs: &StepInputs,
    ) -> Result<(StepOutput<Self::Logits>, Self::Recording)>;

    /// Write `inputs` into the recording's bound buffers and replay it as a
    /// single launch.
    ///
    /// # Errors
    /// Returns an error if the launch fails.
    fn replay_step(
        &mut self,
        recording: &Self::Recording,
        inputs: &StepInputs,
    ) -> Result<StepOutput<Self::Logits>>;

    /// Free the device resources behind a recording.
    ///
    /// # Errors
    /// Returns an error if the device refuses to release the recording.
    fn release_recording(&mut self, recording: Self::Recording) -> Result<()>;
}
