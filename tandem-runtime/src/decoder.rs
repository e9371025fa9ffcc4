//! Per-micro-batch decoder state.
//!
//! The final pipeline stage turns logits into a [`StepUpdate`] with
//! [`DecoderState::decode`] and applies it; every other stage applies the
//! same update after receiving it. Because `apply` is the only mutator, all
//! ranks hold identical state after each step.

#![allow(clippy::module_name_repetitions)]

use std::ops::Range;

use tandem::comm::PayloadTag;
use tandem::{
    Error, FinalizedSequence, FinishReason, Logits, Result, SamplingConfig, StepUpdate,
    WorldLayout,
};

/// How this rank obtains decoder outcomes. Chosen once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderRole {
    /// Final pipeline stage: samples from logits and sends updates.
    Local,
    /// Any other stage: receives updates from the final stage.
    ReceiveOnly,
}

impl DecoderRole {
    #[must_use]
    pub fn for_world(world: &WorldLayout) -> Self {
        if world.is_last_pipeline_rank() {
            Self::Local
        } else {
            Self::ReceiveOnly
        }
    }
}

/// Row-level stop conditions of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopCriteria {
    pub end_id: u32,
    pub pad_id: u32,
    pub max_new_tokens: usize,
    pub max_sequence_length: usize,
    /// Generated tokens required before the end id is accepted.
    pub min_length: usize,
}

/// Which sampling stream each draw comes from.
///
/// Per request, each sequence draws from its own stream keyed by its
/// absolute index, so results do not depend on the micro-batch partition.
/// Otherwise the whole micro-batch shares a stream keyed by its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingStreams {
    pub per_request: bool,
    pub micro_batch: usize,
    pub first_sequence: usize,
}

impl SamplingStreams {
    /// Seed for beam `beam` of local sequence `sequence` at `step`.
    #[must_use]
    pub fn seed(
        &self,
        sampling: &SamplingConfig,
        step: usize,
        sequence: usize,
        beam_width: usize,
        beam: usize,
    ) -> u64 {
        if self.per_request {
            sampling.draw_seed((self.first_sequence + sequence) as u64, step, beam)
        } else {
            sampling.draw_seed(self.micro_batch as u64, step, sequence * beam_width + beam)
        }
    }
}

/// Host inputs of one step, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRows {
    pub tokens: Vec<Vec<u32>>,
    pub past_lengths: Vec<usize>,
    pub live: Vec<bool>,
}

impl StepRows {
    /// Longest per-row input.
    #[must_use]
    pub fn input_len(&self) -> usize {
        self.tokens.iter().map(Vec::len).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Row {
    tokens: Vec<u32>,
    finished: Option<FinishReason>,
    cum_log_prob: f32,
}

/// Running state of every row (sequence × beam) of one micro-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderState {
    beam_width: usize,
    criteria: StopCriteria,
    prompt_lens: Vec<usize>,
    rows: Vec<Row>,
    steps: usize,
    finalized: bool,
}

impl DecoderState {
    /// # Panics
    /// Panics if `prompts` is empty, a prompt is empty, or `beam_width` is
    /// zero.
    #[must_use]
    pub fn new(prompts: &[Vec<u32>], beam_width: usize, criteria: StopCriteria) -> Self {
        assert!(beam_width > 0, "beam_width must be > 0");
        assert!(!prompts.is_empty(), "decoder state needs at least one sequence");
        let mut rows = Vec::with_capacity(prompts.len() * beam_width);
        for prompt in prompts {
            assert!(!prompt.is_empty(), "empty prompt");
            for _ in 0..beam_width {
                rows.push(Row {
                    tokens: prompt.clone(),
                    finished: None,
                    cum_log_prob: 0.0,
                });
            }
        }
        Self {
            beam_width,
            criteria,
            prompt_lens: prompts.iter().map(Vec::len).collect(),
            rows,
            steps: 0,
            finalized: false,
        }
    }

    #[must_use]
    pub fn num_sequences(&self) -> usize {
        self.prompt_lens.len()
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Steps applied so far.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[must_use]
    pub fn criteria(&self) -> &StopCriteria {
        &self.criteria
    }

    /// Prompt plus generated tokens of `row`.
    #[must_use]
    pub fn tokens(&self, row: usize) -> &[u32] {
        &self.rows[row].tokens
    }

    #[must_use]
    pub fn finish_reason(&self, row: usize) -> Option<FinishReason> {
        self.rows[row].finished
    }

    #[must_use]
    pub fn generated_len(&self, row: usize) -> usize {
        self.rows[row].tokens.len() - self.prompt_lens[row / self.beam_width]
    }

    fn beams(&self, sequence: usize) -> Range<usize> {
        sequence * self.beam_width..(sequence + 1) * self.beam_width
    }

    #[must_use]
    pub fn all_finished(&self) -> bool {
        self.rows.iter().all(|r| r.finished.is_some())
    }

    /// Local indices of sequences with at least one unfinished beam.
    #[must_use]
    pub fn live_sequences(&self) -> Vec<usize> {
        (0..self.num_sequences())
            .filter(|&s| self.rows[self.beams(s)].iter().any(|r| r.finished.is_none()))
            .collect()
    }

    /// Mark every unfinished row finished with `reason`.
    pub fn force_finish(&mut self, reason: FinishReason) {
        for row in &mut self.rows {
            row.finished.get_or_insert(reason);
        }
    }

    /// Inputs of step `step`: the prompt on the first step, the last token
    /// afterwards. Finished rows are fed the pad id.
    #[must_use]
    pub fn inputs_for_step(&self, step: usize) -> StepRows {
        let mut tokens = Vec::with_capacity(self.rows.len());
        let mut past_lengths = Vec::with_capacity(self.rows.len());
        let mut live = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let is_live = row.finished.is_none();
            if step == 0 {
                tokens.push(row.tokens.clone());
                past_lengths.push(0);
            } else if is_live {
                tokens.push(row.tokens[row.tokens.len() - 1..].to_vec());
                past_lengths.push(row.tokens.len() - 1);
            } else {
                tokens.push(vec![self.criteria.pad_id]);
                past_lengths.push(row.tokens.len());
            }
            live.push(is_live);
        }
        StepRows {
            tokens,
            past_lengths,
            live,
        }
    }

    /// Where a row stands after choosing `token`: the token to append (if
    /// any) and its finish reason (if it finished).
    fn settle(&self, row: usize, token: u32) -> (Option<u32>, Option<FinishReason>) {
        if token == self.criteria.end_id {
            return (None, Some(FinishReason::EndId));
        }
        let generated = self.generated_len(row) + 1;
        let total = self.rows[row].tokens.len() + 1;
        if generated >= self.criteria.max_new_tokens || total >= self.criteria.max_sequence_length
        {
            (Some(token), Some(FinishReason::Length))
        } else {
            (Some(token), None)
        }
    }

    fn suppress_end_if_short<L: Logits>(&self, logits: &mut L, row: usize) -> Result<()> {
        if self.generated_len(row) < self.criteria.min_length
            && (self.criteria.end_id as usize) < logits.vocab_size()
        {
            logits.suppress_token(row, self.criteria.end_id)?;
        }
        Ok(())
    }

    /// Choose the next token of every row from `logits` (final stage only).
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if the logits do not cover every
    /// row, or any error raised by the logits backend.
    pub fn decode<L: Logits>(
        &self,
        logits: &mut L,
        sampling: &SamplingConfig,
        streams: &SamplingStreams,
        tag: PayloadTag,
    ) -> Result<StepUpdate> {
        if logits.batch_size() != self.rows.len() {
            return Err(Error::InvalidShape(format!(
                "{} logit rows for {} decoder rows",
                logits.batch_size(),
                self.rows.len()
            )));
        }
        if self.finalized {
            return Err(Error::Other("decoder state already finalized".into()));
        }

        let n = self.rows.len();
        let mut update = StepUpdate {
            tag,
            tokens: vec![None; n],
            parents: (0..n).map(|r| r % self.beam_width).collect(),
            finished: self.rows.iter().map(|r| r.finished).collect(),
            cum_log_probs: self.rows.iter().map(|r| r.cum_log_prob).collect(),
        };

        for sequence in 0..self.num_sequences() {
            if self.beam_width == 1 {
                self.decode_single(logits, sampling, streams, sequence, &mut update)?;
            } else {
                self.decode_beams(logits, sequence, &mut update)?;
            }
        }
        Ok(update)
    }

    fn decode_single<L: Logits>(
        &self,
        logits: &mut L,
        sampling: &SamplingConfig,
        streams: &SamplingStreams,
        sequence: usize,
        update: &mut StepUpdate,
    ) -> Result<()> {
        let row = sequence;
        if self.rows[row].finished.is_some() {
            return Ok(());
        }
        self.suppress_end_if_short(logits, row)?;

        let token = match sampling.temperature {
            Some(temperature) => logits.sample_top_p(
                row,
                temperature,
                sampling.top_p,
                streams.seed(sampling, self.steps, sequence, 1, 0),
                sampling.repetition_penalty,
                sampling.recent_window(&self.rows[row].tokens),
            )?,
            None => logits.argmax(row)?,
        };
        if sampling.output_log_probs {
            update.cum_log_probs[row] += logits.log_prob(row, token)?;
        }

        let (appended, finished) = self.settle(row, token);
        update.tokens[row] = appended;
        update.finished[row] = finished;
        Ok(())
    }

    /// Beam expansion: every live beam proposes its `beam_width` best
    /// continuations, the best proposals across beams fill the live slots.
    /// On the first step all beams share a history, so only beam 0 expands.
    fn decode_beams<L: Logits>(
        &self,
        logits: &mut L,
        sequence: usize,
        update: &mut StepUpdate,
    ) -> Result<()> {
        let beams = self.beams(sequence);
        let live: Vec<usize> = beams
            .clone()
            .filter(|&r| self.rows[r].finished.is_none())
            .collect();
        if live.is_empty() {
            return Ok(());
        }
        let expanding: &[usize] = if self.steps == 0 { &live[..1] } else { &live };

        // (score, parent row, token)
        let mut candidates: Vec<(f32, usize, u32)> = Vec::new();
        for &row in expanding {
            self.suppress_end_if_short(logits, row)?;
            for (token, lp) in logits.top_k_log_probs(row, self.beam_width)? {
                if lp.is_finite() {
                    candidates.push((self.rows[row].cum_log_prob + lp, row, token));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut chosen = candidates.into_iter();
        for &slot in &live {
            match chosen.next() {
                Some((score, parent, token)) => {
                    let (appended, finished) = self.settle(parent, token);
                    update.parents[slot] = parent - beams.start;
                    update.tokens[slot] = appended;
                    update.finished[slot] = finished;
                    update.cum_log_probs[slot] = score;
                }
                // Vocabulary smaller than the beam: nothing left to explore.
                None => update.finished[slot] = Some(FinishReason::Length),
            }
        }
        Ok(())
    }

    /// Apply one step's outcome. The same update applied on every rank
    /// yields the same state.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if the update does not match this
    /// state, or [`Error::Other`] if the state was already finalized.
    pub fn apply(&mut self, update: &StepUpdate) -> Result<()> {
        if self.finalized {
            return Err(Error::Other("decoder state already finalized".into()));
        }
        let n = self.rows.len();
        if update.rows() != n
            || update.parents.len() != n
            || update.finished.len() != n
            || update.cum_log_probs.len() != n
        {
            return Err(Error::InvalidShape(format!(
                "step update for {} rows applied to {n} rows",
                update.rows()
            )));
        }
        if let Some(&bad) = update.parents.iter().find(|&&p| p >= self.beam_width) {
            return Err(Error::InvalidShape(format!(
                "parent beam {bad} out of range for beam width {}",
                self.beam_width
            )));
        }

        for sequence in 0..self.num_sequences() {
            let beams = self.beams(sequence);
            let previous: Vec<Row> = self.rows[beams.clone()].to_vec();
            for (i, row) in beams.enumerate() {
                let mut next = previous[update.parents[row]].clone();
                if let Some(token) = update.tokens[row] {
                    next.tokens.push(token);
                }
                next.finished = update.finished[row];
                next.cum_log_prob = update.cum_log_probs[row];
                // A finished row keeps its own history.
                if previous[i].finished.is_some() {
                    next = previous[i].clone();
                }
                self.rows[row] = next;
            }
        }
        self.steps += 1;
        Ok(())
    }

    /// Read out every row, exactly once.
    ///
    /// # Errors
    /// Returns [`Error::Other`] on a second call.
    pub fn finalize(&mut self) -> Result<Vec<FinalizedSequence>> {
        if self.finalized {
            return Err(Error::Other("decoder state already finalized".into()));
        }
        self.finalized = true;
        Ok(self
            .rows
            .iter()
            .enumerate()
            .map(|(r, row)| FinalizedSequence {
                tokens: row.tokens.clone(),
                prompt_len: self.prompt_lens[r / self.beam_width],
                finish_reason: row.finished,
                cum_log_prob: row.cum_log_prob,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Logits over a small vocabulary with fixed per-row preferences.
    struct FixedLogits {
        rows: Vec<Vec<f32>>,
    }

    impl Logits for FixedLogits {
        fn vocab_size(&self) -> usize {
            self.rows[0].len()
        }

        fn batch_size(&self) -> usize {
            self.rows.len()
        }

        fn argmax(&self, row: usize) -> Result<u32> {
            let r = &self.rows[row];
            let mut best = 0;
            for (i, &v) in r.iter().enumerate() {
                if v > r[best] {
                    best = i;
                }
            }
            Ok(best as u32)
        }

        fn sample_top_p(
            &self,
            row: usize,
            _temperature: f32,
            _top_p: f32,
            rng_seed: u64,
            _repetition_penalty: f32,
            _recent_tokens: &[u32],
        ) -> Result<u32> {
            let candidates: Vec<usize> = (0..self.vocab_size())
                .filter(|&t| self.rows[row][t].is_finite())
                .collect();
            Ok(candidates[(rng_seed % candidates.len() as u64) as usize] as u32)
        }

        fn log_softmax(&self, row: usize) -> Result<Vec<f32>> {
            let r = &self.rows[row];
            let max = r.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum = r.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
            Ok(r.iter().map(|v| v - log_sum).collect())
        }

        fn suppress_token(&mut self, row: usize, token: u32) -> Result<()> {
            self.rows[row][token as usize] = f32::NEG_INFINITY;
            Ok(())
        }
    }

    fn one_hot(rows: usize, vocab: usize, hot: &[u32]) -> FixedLogits {
        FixedLogits {
            rows: (0..rows)
                .map(|r| {
                    let mut v = vec![0.0; vocab];
                    v[hot[r] as usize] = 5.0;
                    v
                })
                .collect(),
        }
    }

    fn criteria(max_new_tokens: usize) -> StopCriteria {
        StopCriteria {
            end_id: 0,
            pad_id: 0,
            max_new_tokens,
            max_sequence_length: 64,
            min_length: 0,
        }
    }

    fn streams() -> SamplingStreams {
        SamplingStreams {
            per_request: false,
            micro_batch: 0,
            first_sequence: 0,
        }
    }

    fn step(
        state: &mut DecoderState,
        logits: &mut FixedLogits,
        sampling: &SamplingConfig,
    ) -> StepUpdate {
        let update = state
            .decode(logits, sampling, &streams(), PayloadTag::default())
            .unwrap();
        state.apply(&update).unwrap();
        update
    }

    #[test]
    fn test_role_from_world() {
        let first = WorldLayout::new(1, 2, 0).unwrap();
        let last = WorldLayout::new(1, 2, 1).unwrap();
        assert_eq!(DecoderRole::for_world(&first), DecoderRole::ReceiveOnly);
        assert_eq!(DecoderRole::for_world(&last), DecoderRole::Local);
        assert_eq!(
            DecoderRole::for_world(&WorldLayout::single()),
            DecoderRole::Local
        );
    }

    // ---- inputs ----

    #[test]
    fn test_inputs_for_context_and_generation_steps() {
        let mut state = DecoderState::new(&[vec![1, 2, 3], vec![4, 5]], 1, criteria(4));
        let first = state.inputs_for_step(0);
        assert_eq!(first.tokens, vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(first.past_lengths, vec![0, 0]);
        assert_eq!(first.input_len(), 3);

        step(&mut state, &mut one_hot(2, 8, &[7, 6]), &SamplingConfig::greedy());
        let next = state.inputs_for_step(1);
        assert_eq!(next.tokens, vec![vec![7], vec![6]]);
        assert_eq!(next.past_lengths, vec![3, 2]);
        assert_eq!(next.live, vec![true, true]);
    }

    #[test]
    fn test_finished_rows_are_fed_pad() {
        let mut state = DecoderState::new(&[vec![1], vec![2]], 1, criteria(4));
        step(&mut state, &mut one_hot(2, 8, &[0, 5]), &SamplingConfig::greedy());
        let next = state.inputs_for_step(1);
        assert_eq!(next.tokens[0], vec![0]);
        assert_eq!(next.live, vec![false, true]);
        assert_eq!(state.live_sequences(), vec![1]);
    }

    // ---- greedy / sampling ----

    #[test]
    fn test_greedy_appends_and_stops_at_length() {
        let mut state = DecoderState::new(&[vec![1, 2, 3], vec![1, 2, 3, 4, 5]], 1, criteria(2));
        let greedy = SamplingConfig::greedy();

        step(&mut state, &mut one_hot(2, 8, &[4, 6]), &greedy);
        assert!(!state.all_finished());
        let last = step(&mut state, &mut one_hot(2, 8, &[5, 7]), &greedy);

        assert_eq!(last.finished, vec![Some(FinishReason::Length); 2]);
        assert_eq!(state.tokens(0), &[1, 2, 3, 4, 5]);
        assert_eq!(state.tokens(1), &[1, 2, 3, 4, 5, 6, 7]);
        assert!(state.all_finished());
    }

    #[test]
    fn test_end_id_not_appended() {
        let mut state = DecoderState::new(&[vec![3, 3]], 1, criteria(4));
        let update = step(&mut state, &mut one_hot(1, 8, &[0]), &SamplingConfig::greedy());
        assert_eq!(update.tokens, vec![None]);
        assert_eq!(state.finish_reason(0), Some(FinishReason::EndId));
        assert_eq!(state.tokens(0), &[3, 3]);
    }

    #[test]
    fn test_max_sequence_length_stops_row() {
        let mut c = criteria(10);
        c.max_sequence_length = 3;
        let mut state = DecoderState::new(&[vec![1, 2]], 1, c);
        step(&mut state, &mut one_hot(1, 8, &[4]), &SamplingConfig::greedy());
        assert_eq!(state.finish_reason(0), Some(FinishReason::Length));
        assert_eq!(state.generated_len(0), 1);
    }

    #[test]
    fn test_min_length_suppresses_end_id() {
        let mut c = criteria(4);
        c.min_length = 1;
        let mut state = DecoderState::new(&[vec![1]], 1, c);
        let mut logits = one_hot(1, 4, &[0]);
        step(&mut state, &mut logits, &SamplingConfig::greedy());
        assert_eq!(state.generated_len(0), 1);
        assert_ne!(state.tokens(0)[1], 0);
        assert_eq!(state.finish_reason(0), None);
    }

    #[test]
    fn test_sampling_streams() {
        let sampling = SamplingConfig {
            temperature: Some(1.0),
            ..SamplingConfig::default()
        };
        let shared = SamplingStreams {
            per_request: false,
            micro_batch: 1,
            first_sequence: 4,
        };
        let own = SamplingStreams {
            per_request: true,
            ..shared
        };
        // Per request, sequence 1 of a micro-batch starting at 4 is stream 5.
        assert_eq!(own.seed(&sampling, 2, 1, 1, 0), sampling.draw_seed(5, 2, 0));
        assert_eq!(shared.seed(&sampling, 2, 1, 1, 0), sampling.draw_seed(1, 2, 1));
    }

    #[test]
    fn test_sampled_tokens_are_reproducible() {
        let sampling = SamplingConfig {
            temperature: Some(0.7),
            ..SamplingConfig::default()
        };
        let run = || {
            let mut state = DecoderState::new(&[vec![1]], 1, criteria(3));
            for _ in 0..3 {
                let mut logits = FixedLogits {
                    rows: vec![vec![1.0; 16]],
                };
                step(&mut state, &mut logits, &sampling);
            }
            state.tokens(0).to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_log_probs_accumulate() {
        let sampling = SamplingConfig {
            output_log_probs: true,
            ..SamplingConfig::default()
        };
        let mut state = DecoderState::new(&[vec![1]], 1, criteria(2));
        let u1 = step(&mut state, &mut one_hot(1, 4, &[2]), &sampling);
        let u2 = step(&mut state, &mut one_hot(1, 4, &[3]), &sampling);
        assert!(u1.cum_log_probs[0] < 0.0);
        assert!(u2.cum_log_probs[0] < u1.cum_log_probs[0]);
    }

    // ---- beam search ----

    #[test]
    fn test_first_beam_step_expands_distinct_tokens() {
        let mut state = DecoderState::new(&[vec![9]], 2, criteria(4));
        let mut logits = FixedLogits {
            rows: vec![vec![0.0, 1.0, 3.0, 2.0], vec![0.0, 1.0, 3.0, 2.0]],
        };
        let update = step(&mut state, &mut logits, &SamplingConfig::beam_search(2));

        assert_eq!(update.tokens, vec![Some(2), Some(3)]);
        assert_eq!(update.parents, vec![0, 0]);
        assert!(update.cum_log_probs[0] > update.cum_log_probs[1]);
        assert_eq!(state.tokens(1), &[9, 3]);
    }

    #[test]
    fn test_beam_backtracking_reorders_histories() {
        let mut state = DecoderState::new(&[vec![9]], 2, criteria(4));
        let beams = SamplingConfig::beam_search(2);
        step(
            &mut state,
            &mut FixedLogits {
                rows: vec![vec![0.0, 1.0, 3.0, 2.9]; 2],
            },
            &beams,
        );
        // Beam 1 (history [9, 3]) now dominates both continuations.
        let update = step(
            &mut state,
            &mut FixedLogits {
                rows: vec![vec![0.0, 0.0, 0.0, 0.0], vec![0.0, 9.0, 9.0, 0.0]],
            },
            &beams,
        );
        assert_eq!(update.parents, vec![1, 1]);
        assert_eq!(state.tokens(0), &[9, 3, 1]);
        assert_eq!(state.tokens(1), &[9, 3, 2]);
    }

    #[test]
    fn test_finished_beam_keeps_history() {
        let mut state = DecoderState::new(&[vec![9]], 2, criteria(4));
        let beams = SamplingConfig::beam_search(2);
        // Best continuation is the end id: slot 0 finishes.
        step(
            &mut state,
            &mut FixedLogits {
                rows: vec![vec![5.0, 1.0, 0.0, 0.0]; 2],
            },
            &beams,
        );
        assert_eq!(state.finish_reason(0), Some(FinishReason::EndId));
        step(
            &mut state,
            &mut FixedLogits {
                rows: vec![vec![0.0, 0.0, 4.0, 0.0]; 2],
            },
            &beams,
        );
        assert_eq!(state.tokens(0), &[9]);
        assert_eq!(state.tokens(1), &[9, 1, 2]);
    }

    // ---- apply / finalize ----

    #[test]
    fn test_apply_rejects_mismatched_update() {
        let mut state = DecoderState::new(&[vec![1]], 1, criteria(2));
        let update = StepUpdate {
            tag: PayloadTag::default(),
            tokens: vec![Some(1), Some(2)],
            parents: vec![0, 1],
            finished: vec![None, None],
            cum_log_probs: vec![0.0, 0.0],
        };
        assert!(matches!(state.apply(&update), Err(Error::InvalidShape(_))));
    }

    #[test]
    fn test_receiving_rank_mirrors_sampling_rank() {
        let greedy = SamplingConfig::greedy();
        let mut local = DecoderState::new(&[vec![1, 2], vec![3]], 1, criteria(3));
        let mut mirror = local.clone();
        for hot in [[4, 5], [6, 0], [7, 7]] {
            let update = step(&mut local, &mut one_hot(2, 8, &hot), &greedy);
            mirror.apply(&update).unwrap();
            assert_eq!(local, mirror);
        }
    }

    #[test]
    fn test_force_finish_keeps_existing_reasons() {
        let mut state = DecoderState::new(&[vec![1], vec![2]], 1, criteria(4));
        step(&mut state, &mut one_hot(2, 8, &[0, 3]), &SamplingConfig::greedy());
        state.force_finish(FinishReason::Aborted);
        assert_eq!(state.finish_reason(0), Some(FinishReason::EndId));
        assert_eq!(state.finish_reason(1), Some(FinishReason::Aborted));
        assert!(state.all_finished());
    }

    #[test]
    fn test_finalize_exactly_once() {
        let mut state = DecoderState::new(&[vec![1, 2, 3]], 1, criteria(1));
        step(&mut state, &mut one_hot(1, 8, &[4]), &SamplingConfig::greedy());
        let out = state.finalize().unwrap();
        assert_eq!(out[0].tokens, vec![1, 2, 3, 4]);
        assert_eq!(out[0].generated(), &[4]);
        assert!(state.finalize().is_err());
        assert!(state.is_finalized());
    }

    #[test]
    #[should_panic(expected = "empty prompt")]
    fn test_empty_prompt_panics() {
        let _ = DecoderState::new(&[vec![]], 1, criteria(1));
    }
}
