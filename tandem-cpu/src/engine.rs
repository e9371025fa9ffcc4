//! Deterministic toy step engine.
//!
//! Stands in for a real forward pass on the host. Logits of a row are a pure
//! function of (seed, last input token, position), so the same request
//! produces the same tokens however it is partitioned and whether or not
//! steps are replayed from recordings.
//!
//! Only the final pipeline stage returns logits; earlier stages return
//! [`StepOutput::Forwarded`].

use std::collections::BTreeSet;

use tandem::engine::{
    ContextId, ShapeBucket, StepEngine, StepInputs, StepOutput, StepPhase, StepShape,
};
use tandem::{Error, Result, WorldLayout};

use crate::logits::HostLogits;

/// Makes `token` overwhelmingly likely once a row reaches `after_position`
/// total tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRule {
    pub token: u32,
    pub after_position: usize,
}

/// Injected failure points, for exercising error paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail the forward pass of `(micro_batch, step)`.
    pub fail_step: Option<(usize, usize)>,
    /// Every `release_recording` call fails (the recording is still dropped).
    pub fail_release: bool,
}

/// Counters for asserting how steps were executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub contexts: usize,
    pub direct_runs: usize,
    pub recordings: usize,
    pub replays: usize,
    pub released: usize,
}

/// Replayable recording of one toy step.
#[derive(Debug, PartialEq, Eq)]
pub struct ToyRecording {
    id: u64,
    context: ContextId,
    shape: StepShape,
}

impl ToyRecording {
    #[must_use]
    pub fn shape(&self) -> StepShape {
        self.shape
    }

    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }
}

/// Host [`StepEngine`] producing deterministic pseudo-random logits.
#[derive(Debug)]
pub struct ToyEngine {
    vocab_size: usize,
    seed: u64,
    final_stage: bool,
    end_rule: Option<EndRule>,
    faults: FaultPlan,
    contexts: Vec<ShapeBucket>,
    live_recordings: BTreeSet<u64>,
    next_recording: u64,
    stats: EngineStats,
}

impl ToyEngine {
    /// Engine for this rank's stage of `world`.
    ///
    /// # Panics
    /// Panics if `vocab_size` is zero.
    #[must_use]
    pub fn new(vocab_size: usize, seed: u64, world: &WorldLayout) -> Self {
        assert!(vocab_size > 0, "vocab_size must be > 0");
        Self {
            vocab_size,
            seed,
            final_stage: world.is_last_pipeline_rank(),
            end_rule: None,
            faults: FaultPlan::default(),
            contexts: Vec::new(),
            live_recordings: BTreeSet::new(),
            next_recording: 0,
            stats: EngineStats::default(),
        }
    }

    #[must_use]
    pub fn with_end_rule(mut self, rule: EndRule) -> Self {
        self.end_rule = Some(rule);
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Recordings created and not yet released.
    #[must_use]
    pub fn live_recordings(&self) -> usize {
        self.live_recordings.len()
    }

    /// Bucket a context was created for.
    #[must_use]
    pub fn bucket(&self, context: ContextId) -> Option<&ShapeBucket> {
        self.contexts.get(context.0)
    }

    fn check_inputs(&self, context: ContextId, inputs: &StepInputs) -> Result<()> {
        let bucket = self
            .contexts
            .get(context.0)
            .ok_or_else(|| Error::Engine(format!("unknown context {}", context.0)))?;
        let shape = inputs.shape;
        if bucket.phase != shape.phase {
            return Err(Error::InvalidShape(format!(
                "{:?} step on a {:?} context",
                shape.phase, bucket.phase
            )));
        }
        if !bucket.admits(shape.rows, shape.input_len) {
            return Err(Error::InvalidShape(format!(
                "{} rows × {} tokens outside context bucket {} × {}",
                shape.rows, shape.input_len, bucket.max_rows, bucket.max_input_len
            )));
        }
        if inputs.tokens.len() != shape.rows || inputs.past_lengths.len() != shape.rows {
            return Err(Error::InvalidShape(format!(
                "step declares {} rows but carries {}",
                shape.rows,
                inputs.tokens.len()
            )));
        }
        if self.faults.fail_step == Some((inputs.micro_batch, inputs.step)) {
            return Err(Error::Engine(format!(
                "injected failure at micro-batch {} step {}",
                inputs.micro_batch, inputs.step
            )));
        }
        Ok(())
    }

    fn forward(&self, inputs: &StepInputs) -> Result<StepOutput<HostLogits>> {
        if !self.final_stage {
            return Ok(StepOutput::Forwarded);
        }
        let mut data = Vec::with_capacity(inputs.shape.rows * self.vocab_size);
        for (tokens, &past) in inputs.tokens.iter().zip(&inputs.past_lengths) {
            let last = tokens.last().copied().unwrap_or(0);
            let position = past + tokens.len();
            let base = mix(self.seed, (u64::from(last) << 32) | position as u64);
            for v in 0..self.vocab_size {
                #[allow(clippy::cast_precision_loss)]
                let mut value = (mix(base, v as u64) % 1000) as f32 / 100.0;
                if let Some(rule) = self.end_rule {
                    if v == rule.token as usize {
                        value = if position >= rule.after_position {
                            100.0
                        } else {
                            -100.0
                        };
                    }
                }
                data.push(value);
            }
        }
        Ok(StepOutput::Logits(HostLogits::new(
            data,
            inputs.shape.rows,
            self.vocab_size,
        )?))
    }
}

/// splitmix64 over two words.
fn mix(a: u64, b: u64) -> u64 {
    let mut z = a ^ b.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl StepEngine for ToyEngine {
    type Logits = HostLogits;
    type Recording = ToyRecording;

    fn select_context(&mut self, bucket: &ShapeBucket) -> Result<ContextId> {
        if bucket.max_rows == 0 || bucket.max_input_len == 0 {
            return Err(Error::Configuration(format!(
                "empty shape bucket {bucket:?}"
            )));
        }
        if bucket.phase == StepPhase::Generation && bucket.max_input_len != 1 {
            return Err(Error::Configuration(
                "generation contexts take one token per row".into(),
            ));
        }
        if let Some(i) = self.contexts.iter().position(|b| b == bucket) {
            return Ok(ContextId(i));
        }
        self.contexts.push(*bucket);
        self.stats.contexts += 1;
        log::debug!(
            "created {:?} context {} (rows {:?}, input {:?})",
            bucket.phase,
            self.contexts.len() - 1,
            bucket.row_profile(),
            bucket.input_profile()
        );
        Ok(ContextId(self.contexts.len() - 1))
    }

    fn run_step(
        &mut self,
        context: ContextId,
        inputs: &StepInputs,
    ) -> Result<StepOutput<HostLogits>> {
        self.check_inputs(context, inputs)?;
        self.stats.direct_runs += 1;
        self.forward(inputs)
    }

    fn record_step(
        &mut self,
        context: ContextId,
        inputs: &StepInputs,
    ) -> Result<(StepOutput<HostLogits>, ToyRecording)> {
        self.check_inputs(context, inputs)?;
        let output = self.forward(inputs)?;
        let id = self.next_recording;
        self.next_recording += 1;
        self.live_recordings.insert(id);
        self.stats.recordings += 1;
        Ok((
            output,
            ToyRecording {
                id,
                context,
                shape: inputs.shape,
            },
        ))
    }

    fn replay_step(
        &mut self,
        recording: &ToyRecording,
        inputs: &StepInputs,
    ) -> Result<StepOutput<HostLogits>> {
        if !self.live_recordings.contains(&recording.id) {
            return Err(Error::Capture(format!(
                "recording {} was released",
                recording.id
            )));
        }
        if recording.shape != inputs.shape {
            return Err(Error::Capture(format!(
                "recording for {:?} replayed with {:?}",
                recording.shape, inputs.shape
            )));
        }
        self.check_inputs(recording.context, inputs)?;
        self.stats.replays += 1;
        self.forward(inputs)
    }

    fn release_recording(&mut self, recording: ToyRecording) -> Result<()> {
        if !self.live_recordings.remove(&recording.id) {
            return Err(Error::Capture(format!(
                "recording {} released twice",
                recording.id
            )));
        }
        self.stats.released += 1;
        if self.faults.fail_release {
            return Err(Error::Capture(format!(
                "injected release failure for recording {}",
                recording.id
            )));
        }
        Ok(())
    }
}
