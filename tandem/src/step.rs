//! Decoder step records exchanged between pipeline ranks.

use crate::comm::PayloadTag;

/// Why a row stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// The end id was sampled (it is not appended to the output).
    EndId,
    /// The row reached its new-token limit or the maximum sequence length.
    Length,
    /// A session-wide abort forced the row to stop.
    Aborted,
}

/// Outcome of one decoder step for one micro-batch.
///
/// Produced by the rank holding the final stage and applied verbatim on
/// every other pipeline rank, so all ranks keep identical decoder state.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub tag: PayloadTag,
    /// Token appended to each row this step; `None` if nothing was appended
    /// (row already finished, or it just sampled the end id).
    pub tokens: Vec<Option<u32>>,
    /// Row (within the same sequence) whose history each row continues.
    /// The identity mapping unless beam search reordered beams.
    pub parents: Vec<usize>,
    /// Finish state of each row after this step.
    pub finished: Vec<Option<FinishReason>>,
    /// Cumulative log-probability of each row after this step.
    pub cum_log_probs: Vec<f32>,
}

impl StepUpdate {
    /// Number of rows covered by the update.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.tokens.len()
    }

    /// Whether every row is finished after this step.
    #[must_use]
    pub fn all_finished(&self) -> bool {
        self.finished.iter().all(Option::is_some)
    }
}

/// Final output of one row (sequence × beam).
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedSequence {
    /// Prompt followed by the generated tokens, truncated at the row's
    /// finish point.
    pub tokens: Vec<u32>,
    pub prompt_len: usize,
    pub finish_reason: Option<FinishReason>,
    pub cum_log_prob: f32,
}

impl FinalizedSequence {
    /// Generated tokens only.
    #[must_use]
    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }
}
