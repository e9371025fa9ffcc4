//! Request and result buffers of a `generate` call, plus the per-step
//! callback.

#![allow(clippy::module_name_repetitions)]

use std::sync::mpsc;

use tandem::{Error, FinalizedSequence, FinishReason, Result};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A batch of prompts plus generation limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInput {
    /// One prompt per sequence. Lengths are taken from the vectors.
    pub sequences: Vec<Vec<u32>>,
    /// Token that ends a sequence. It is never appended to the output.
    pub end_id: u32,
    /// Token fed to finished rows and used to pad [`GenerationOutput::padded_ids`].
    pub pad_id: u32,
    /// Upper bound on generated tokens per sequence.
    pub max_new_tokens: usize,
}

impl GenerationInput {
    /// Input padded with the end id.
    #[must_use]
    pub fn new(sequences: Vec<Vec<u32>>, end_id: u32, max_new_tokens: usize) -> Self {
        Self {
            sequences,
            end_id,
            pad_id: end_id,
            max_new_tokens,
        }
    }

    #[must_use]
    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.sequences.len()
    }

    #[must_use]
    pub fn prompt_lengths(&self) -> Vec<usize> {
        self.sequences.iter().map(Vec::len).collect()
    }

    #[must_use]
    pub fn max_prompt_len(&self) -> usize {
        self.sequences.iter().map(Vec::len).max().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Per-step callback
// ---------------------------------------------------------------------------

/// What one micro-batch produced in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEvent {
    pub micro_batch: usize,
    pub step: usize,
    /// Absolute index of the micro-batch's first sequence.
    pub first_sequence: usize,
    pub beam_width: usize,
    /// Token appended to each row this step, sequence-major.
    pub tokens: Vec<Option<u32>>,
    /// No further step follows for this micro-batch. Reported before the
    /// ranks agree on stopping, so only the final pipeline stage sees an
    /// abort here; elsewhere the events of an aborted micro-batch just end.
    pub finished: bool,
}

/// Caller-supplied hook run after every step of every micro-batch.
///
/// Runs on the thread driving the loop; it must return promptly. An error
/// aborts the whole `generate` call on every rank of the pipeline group at
/// the same step.
pub trait StepCallback {
    /// # Errors
    /// Any error aborts the call with [`Error::Callback`].
    fn on_step(&mut self, event: &StepEvent) -> Result<()>;
}

impl<F> StepCallback for F
where
    F: FnMut(&StepEvent) -> Result<()>,
{
    fn on_step(&mut self, event: &StepEvent) -> Result<()> {
        self(event)
    }
}

/// Streams events to a receiver; a dropped receiver fails the call.
impl StepCallback for mpsc::Sender<StepEvent> {
    fn on_step(&mut self, event: &StepEvent) -> Result<()> {
        self.send(event.clone())
            .map_err(|_| Error::Callback("step event receiver dropped".into()))
    }
}

// ---------------------------------------------------------------------------
// Result sink
// ---------------------------------------------------------------------------

/// Caller-owned sink of a `generate` call.
///
/// Rows are sequence-major (`sequence * beam_width + beam`). Ids are written
/// once, at finalisation; the callback sees tokens as they are produced.
#[derive(Default)]
pub struct GenerationOutput<'cb> {
    ids: Vec<Vec<u32>>,
    prompt_lengths: Vec<usize>,
    finish_reasons: Vec<Option<FinishReason>>,
    cum_log_probs: Option<Vec<f32>>,
    beam_width: usize,
    pad_id: u32,
    callback: Option<Box<dyn StepCallback + 'cb>>,
}

impl<'cb> GenerationOutput<'cb> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that also reports every step to `callback`.
    #[must_use]
    pub fn with_callback(callback: impl StepCallback + 'cb) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            ..Self::default()
        }
    }

    /// Whether any result has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn num_sequences(&self) -> usize {
        self.ids.len().checked_div(self.beam_width).unwrap_or(0)
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    /// Prompt followed by generated tokens, truncated at the finish point.
    ///
    /// # Panics
    /// Panics if `sequence` or `beam` is out of range.
    #[must_use]
    pub fn ids(&self, sequence: usize, beam: usize) -> &[u32] {
        &self.ids[self.row(sequence, beam)]
    }

    /// Generated tokens only.
    ///
    /// # Panics
    /// Panics if `sequence` or `beam` is out of range.
    #[must_use]
    pub fn generated(&self, sequence: usize, beam: usize) -> &[u32] {
        let row = self.row(sequence, beam);
        &self.ids[row][self.prompt_lengths[row]..]
    }

    /// Total length (prompt + generated) of every row.
    #[must_use]
    pub fn lengths(&self) -> Vec<usize> {
        self.ids.iter().map(Vec::len).collect()
    }

    /// # Panics
    /// Panics if `sequence` or `beam` is out of range.
    #[must_use]
    pub fn finish_reason(&self, sequence: usize, beam: usize) -> Option<FinishReason> {
        self.finish_reasons[self.row(sequence, beam)]
    }

    /// Cumulative log-probabilities per row, when requested.
    #[must_use]
    pub fn cum_log_probs(&self) -> Option<&[f32]> {
        self.cum_log_probs.as_deref()
    }

    /// Every row padded with the pad id to the longest row.
    #[must_use]
    pub fn padded_ids(&self) -> Vec<Vec<u32>> {
        let width = self.ids.iter().map(Vec::len).max().unwrap_or(0);
        self.ids
            .iter()
            .map(|row| {
                let mut padded = row.clone();
                padded.resize(width, self.pad_id);
                padded
            })
            .collect()
    }

    fn row(&self, sequence: usize, beam: usize) -> usize {
        assert!(beam < self.beam_width, "beam {beam} out of range");
        sequence * self.beam_width + beam
    }

    pub(crate) fn notify(&mut self, event: &StepEvent) -> Result<()> {
        match self.callback.as_mut() {
            Some(callback) => callback.on_step(event).map_err(|e| match e {
                Error::Callback(_) => e,
                other => Error::Callback(other.to_string()),
            }),
            None => Ok(()),
        }
    }

    /// Size the buffers for a finished call. Previous results are dropped.
    pub(crate) fn prepare(
        &mut self,
        num_sequences: usize,
        beam_width: usize,
        pad_id: u32,
        log_probs: bool,
    ) {
        let rows = num_sequences * beam_width;
        self.ids = vec![Vec::new(); rows];
        self.prompt_lengths = vec![0; rows];
        self.finish_reasons = vec![None; rows];
        self.cum_log_probs = log_probs.then(|| vec![0.0; rows]);
        self.beam_width = beam_width;
        self.pad_id = pad_id;
    }

    /// Write the finalised rows of the micro-batch starting at
    /// `first_sequence`.
    pub(crate) fn write(&mut self, first_sequence: usize, rows: Vec<FinalizedSequence>) {
        let base = first_sequence * self.beam_width;
        for (i, seq) in rows.into_iter().enumerate() {
            let r = base + i;
            if let Some(lp) = self.cum_log_probs.as_mut() {
                lp[r] = seq.cum_log_prob;
            }
            self.prompt_lengths[r] = seq.prompt_len;
            self.finish_reasons[r] = seq.finish_reason;
            self.ids[r] = seq.tokens;
        }
    }
}

impl std::fmt::Debug for GenerationOutput<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOutput")
            .field("ids", &self.ids)
            .field("finish_reasons", &self.finish_reasons)
            .field("cum_log_probs", &self.cum_log_probs)
            .field("beam_width", &self.beam_width)
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}
