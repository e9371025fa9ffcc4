//! The generation session: one rank's driver of the micro-batched decode
//! loop.
//!
//! A call is split into micro-batches that stay in flight together so every
//! pipeline stage has work while the others compute. Each round has two
//! phases over the live micro-batches, always in index order:
//!
//! ```text
//!  issue:    forward pass ─▶ (final stage) decode, apply, send update
//!                          ─▶ (other stages) post receive of the update
//!  complete: wait ─▶ callback ─▶ stop consensus ─▶ grow cache of live rows
//! ```
//!
//! Every rank issues the same sends, receives and flag broadcasts in the
//! same order, and a failure on any rank is folded into the stop broadcast,
//! so all ranks leave a failed call at the same point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};

use tandem::comm::{CrossRankLink, Payload, PayloadTag, StopFlag};
use tandem::engine::{StepEngine, StepInputs, StepOutput, StepPhase, StepShape};
use tandem::{
    Error, FinishReason, KvCacheManager, ModelTopology, ReserveError, Result, SamplingConfig,
    SessionConfig, StepUpdate, WorldLayout,
};

use crate::captured_step::CapturedStepCache;
use crate::context_pool::ContextPool;
use crate::decoder::{DecoderRole, DecoderState, SamplingStreams, StopCriteria};
use crate::io::{GenerationInput, GenerationOutput, StepEvent};
use crate::micro_batch::{partition, MicroBatch, PendingRecv};

/// Shared flag requesting that the current call stop early.
///
/// Honoured by the final-stage rank, which turns it into a stop decision at
/// the next stop check; every rank then marks its unfinished rows
/// [`FinishReason::Aborted`] and the call finalises normally. The flag is
/// cleared when the call ends.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Where a micro-batch stands after [`GenerationSession::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroBatchStatus {
    Running,
    Finished,
}

/// State of one `generate` call between [`GenerationSession::start`] and
/// [`GenerationSession::finish`] (or [`GenerationSession::cancel`]).
#[derive(Debug)]
#[must_use = "a run holds cache reservations until it is finished or cancelled"]
pub struct GenerationRun {
    call: u64,
    sampling: SamplingConfig,
    max_new_tokens: usize,
    pad_id: u32,
    num_sequences: usize,
    beam_width: usize,
    micro_batches: Vec<MicroBatch>,
    poisoned: bool,
    /// Lets the session tell a held run from one dropped without `finish`
    /// or `cancel`.
    _lease: Arc<()>,
}

impl GenerationRun {
    /// Per-session call number, carried in every payload tag.
    #[must_use]
    pub fn call(&self) -> u64 {
        self.call
    }

    #[must_use]
    pub fn num_micro_batches(&self) -> usize {
        self.micro_batches.len()
    }

    #[must_use]
    pub fn micro_batch(&self, index: usize) -> Option<&MicroBatch> {
        self.micro_batches.get(index)
    }

    #[must_use]
    pub fn micro_batches(&self) -> &[MicroBatch] {
        &self.micro_batches
    }

    /// Whether every micro-batch is finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.micro_batches.iter().all(MicroBatch::is_finished)
    }

    /// Whether a step of this run failed. A failed run can only be
    /// cancelled.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.poisoned
    }
}

/// Narrow stepping interface an external batch scheduler composes against.
///
/// `advance` moves one micro-batch one step. Every rank of a pipeline group
/// must advance the same micro-batches in the same order.
pub trait MicroBatchStepper {
    type Run;

    /// Validate and admit a request.
    ///
    /// # Errors
    /// See [`GenerationSession::start`].
    fn start(&mut self, input: &GenerationInput, sampling: &SamplingConfig) -> Result<Self::Run>;

    /// Run one step of `micro_batch`.
    ///
    /// # Errors
    /// See [`GenerationSession::advance`].
    fn advance(
        &mut self,
        run: &mut Self::Run,
        micro_batch: usize,
        output: &mut GenerationOutput<'_>,
    ) -> Result<MicroBatchStatus>;

    /// Finalise a run whose micro-batches are all finished.
    ///
    /// # Errors
    /// See [`GenerationSession::finish`].
    fn finish(&mut self, run: Self::Run, output: &mut GenerationOutput<'_>) -> Result<()>;

    /// Abandon a run, releasing everything it holds.
    fn cancel(&mut self, run: Self::Run);
}

/// The session's view of the run it handed out last.
#[derive(Debug)]
struct Outstanding {
    call: u64,
    num_sequences: usize,
    lease: Weak<()>,
}

/// One rank's generation controller.
///
/// Owns its collaborators: the step engine for this rank's stage, the KV
/// cache manager, and the link to the other ranks of the pipeline group.
/// Calls are strictly sequential.
pub struct GenerationSession<E: StepEngine, C: KvCacheManager, L: CrossRankLink> {
    config: SessionConfig,
    topology: ModelTopology,
    world: WorldLayout,
    role: DecoderRole,
    engine: E,
    cache: C,
    link: L,
    contexts: ContextPool,
    captures: Vec<CapturedStepCache<E::Recording>>,
    num_micro_batches: usize,
    calls: u64,
    outstanding: Option<Outstanding>,
    abort: AbortHandle,
    label: String,
}

impl<E: StepEngine, C: KvCacheManager, L: CrossRankLink> GenerationSession<E, C, L> {
    /// Build the session and every execution context it will use.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the configuration or layout is
    /// invalid, the link belongs to another rank, or the model has fewer
    /// layers than pipeline stages; propagates the engine's refusal of a
    /// context.
    pub fn new(
        config: SessionConfig,
        topology: ModelTopology,
        world: WorldLayout,
        mut engine: E,
        cache: C,
        link: L,
    ) -> Result<Self> {
        config.validate()?;
        world.validate()?;
        if link.rank() != world.rank {
            return Err(Error::Configuration(format!(
                "link belongs to rank {}, session to rank {}",
                link.rank(),
                world.rank
            )));
        }
        if topology.num_layers < world.pipeline_parallelism {
            return Err(Error::Configuration(format!(
                "cannot split {} layers over {} pipeline stages",
                topology.num_layers, world.pipeline_parallelism
            )));
        }

        let num_micro_batches = config.resolve_micro_batches(&world);
        let capacity = config.micro_batch_capacity(num_micro_batches);
        let contexts = ContextPool::build(
            &mut engine,
            num_micro_batches,
            capacity * config.max_beam_width,
            config.max_beam_width,
            config.max_sequence_length,
        )?;
        let captures = (0..num_micro_batches)
            .map(|_| CapturedStepCache::new())
            .collect();
        let role = DecoderRole::for_world(&world);
        let label = format!("rank{}", world.rank);

        let layers = world.layers_for_stage(topology.num_layers);
        info!(
            "[{label}] stage {}/{} (layers {}..{}, {} KV bytes/token), {num_micro_batches} \
             micro-batches of up to {capacity} sequences, {role:?} decoder, captured steps {}",
            world.pipeline_rank(),
            world.pipeline_parallelism,
            layers.start,
            layers.end,
            topology.kv_bytes_per_token(layers.len(), world.tensor_parallelism),
            if config.reuse_captured_steps { "on" } else { "off" },
        );

        Ok(Self {
            config,
            topology,
            world,
            role,
            engine,
            cache,
            link,
            contexts,
            captures,
            num_micro_batches,
            calls: 0,
            outstanding: None,
            abort: AbortHandle::default(),
            label,
        })
    }

    /// Override the prefix of this session's log lines.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn topology(&self) -> &ModelTopology {
        &self.topology
    }

    pub fn world(&self) -> &WorldLayout {
        &self.world
    }

    pub fn role(&self) -> DecoderRole {
        self.role
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Micro-batch slots the session was built for.
    pub fn num_micro_batches(&self) -> usize {
        self.num_micro_batches
    }

    /// Handle for requesting an abort from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Release every captured step. Also done on drop.
    pub fn clear_captured_steps(&mut self) {
        for captures in &mut self.captures {
            captures.clear(&mut self.engine);
        }
    }

    /// Generate up to `input.max_new_tokens` tokens for every prompt and
    /// write the results into `output` (on the first pipeline rank).
    ///
    /// # Errors
    /// * [`Error::Configuration`] if the request exceeds the session's
    ///   limits (nothing is reserved or run);
    /// * [`Error::ResourceExhausted`] if a micro-batch cannot be admitted;
    /// * [`Error::Synchronization`] if any rank fails a step or a cross-rank
    ///   wait;
    /// * [`Error::Callback`] if the step callback fails.
    ///
    /// Every cache reservation is released before an error is returned.
    pub fn generate(
        &mut self,
        output: &mut GenerationOutput<'_>,
        input: &GenerationInput,
        sampling: &SamplingConfig,
    ) -> Result<()> {
        let mut run = self.start(input, sampling)?;
        if let Err(e) = self.run_rounds(&mut run, output) {
            self.cancel(run);
            return Err(e);
        }
        self.finish(run, output)
    }

    /// Validate a request, partition it and reserve its cache.
    ///
    /// # Errors
    /// [`Error::Configuration`] for a request outside the session's limits
    /// or while an earlier run is still held by the caller,
    /// [`Error::ResourceExhausted`] naming the first micro-batch the cache
    /// could not admit. Either way nothing stays reserved.
    ///
    /// Reservations of an earlier run that was dropped without `finish` or
    /// `cancel` are released here.
    pub fn start(
        &mut self,
        input: &GenerationInput,
        sampling: &SamplingConfig,
    ) -> Result<GenerationRun> {
        self.validate(input, sampling)?;
        self.reclaim_dropped_run()?;
        self.calls += 1;
        let call = self.calls;
        let beam_width = sampling.beam_width;
        let criteria = StopCriteria {
            end_id: input.end_id,
            pad_id: input.pad_id,
            max_new_tokens: input.max_new_tokens,
            max_sequence_length: self.config.max_sequence_length,
            min_length: sampling.min_length,
        };

        let groups = partition(input.batch_size(), self.num_micro_batches);
        let mut micro_batches: Vec<MicroBatch> = Vec::with_capacity(groups.len());
        for (index, sequences) in groups.into_iter().enumerate() {
            let prompts = &input.sequences[sequences.clone()];
            let slots: Vec<usize> = sequences.clone().collect();
            let prompt_lens: Vec<usize> = prompts.iter().map(Vec::len).collect();
            if let Err(e) = self.cache.reserve(&slots, &prompt_lens, beam_width) {
                for admitted in &micro_batches {
                    self.cache.release(&admitted.reserved);
                }
                warn!(
                    "[{}] call {call}: micro-batch {index} not admitted ({e}), \
                     released {} admitted micro-batches",
                    self.label,
                    micro_batches.len()
                );
                return Err(match e {
                    ReserveError::Exhausted(e) => Error::ResourceExhausted {
                        micro_batch: index,
                        requested: e.requested,
                        available: e.available,
                    },
                    ReserveError::AlreadyReserved(slot) => Error::Configuration(format!(
                        "cache slot {slot} is held outside this session"
                    )),
                });
            }
            let decoder = DecoderState::new(prompts, beam_width, criteria);
            micro_batches.push(MicroBatch::new(index, sequences, decoder));
        }

        info!(
            "[{}] call {call}: {} sequences in {} micro-batches, beam {beam_width}, \
             up to {} new tokens",
            self.label,
            input.batch_size(),
            micro_batches.len(),
            input.max_new_tokens
        );
        let lease = Arc::new(());
        self.outstanding = Some(Outstanding {
            call,
            num_sequences: input.batch_size(),
            lease: Arc::downgrade(&lease),
        });
        Ok(GenerationRun {
            call,
            sampling: sampling.clone(),
            max_new_tokens: input.max_new_tokens,
            pad_id: input.pad_id,
            num_sequences: input.batch_size(),
            beam_width,
            micro_batches,
            poisoned: false,
            _lease: lease,
        })
    }

    /// Run one step of one micro-batch: issue it and complete it.
    ///
    /// A finished micro-batch is left alone.
    ///
    /// # Errors
    /// [`Error::Configuration`] for an unknown micro-batch or a failed run;
    /// otherwise the step's error, after which the run is failed and must
    /// be cancelled.
    pub fn advance(
        &mut self,
        run: &mut GenerationRun,
        micro_batch: usize,
        output: &mut GenerationOutput<'_>,
    ) -> Result<MicroBatchStatus> {
        if run.poisoned {
            return Err(Error::Configuration(format!(
                "call {} already failed and must be cancelled",
                run.call
            )));
        }
        let call = run.call;
        let max_new_tokens = run.max_new_tokens;
        let num_micro_batches = run.micro_batches.len();
        let mb = run.micro_batches.get_mut(micro_batch).ok_or_else(|| {
            Error::Configuration(format!(
                "micro-batch {micro_batch} out of range ({num_micro_batches} in call {call})"
            ))
        })?;
        if mb.is_finished() {
            return Ok(MicroBatchStatus::Finished);
        }
        let result = self
            .issue(call, &run.sampling, mb)
            .and_then(|()| self.complete(max_new_tokens, mb, output));
        if result.is_err() {
            run.poisoned = true;
        }
        result
    }

    /// Finalise every micro-batch, write the output on the first pipeline
    /// rank and release every reservation.
    ///
    /// # Errors
    /// [`Error::Configuration`] if the run failed or still has live
    /// micro-batches; [`Error::Synchronization`] if the output transfer
    /// fails or the ranks' decoder states disagree.
    pub fn finish(&mut self, mut run: GenerationRun, output: &mut GenerationOutput<'_>) -> Result<()> {
        if run.poisoned || !run.is_finished() {
            let reason = if run.poisoned {
                "failed"
            } else {
                "still has live micro-batches"
            };
            let error = Error::Configuration(format!("call {} {reason}", run.call));
            self.cancel(run);
            return Err(error);
        }

        let result = self.collect(&mut run, output);
        self.release(&mut run);
        self.abort.reset();
        match &result {
            Ok(()) => info!(
                "[{}] call {} finished: {} sequences",
                self.label, run.call, run.num_sequences
            ),
            Err(e) => error!("[{}] call {} failed during finalisation: {e}", self.label, run.call),
        }
        result
    }

    /// Abandon a run: drop its in-flight transfers and release its
    /// reservations.
    pub fn cancel(&mut self, mut run: GenerationRun) {
        for mb in &mut run.micro_batches {
            if let Some(pending) = mb.pending.take() {
                pending.discard(&mut self.link);
            }
            for event in mb.sends.drain(..) {
                self.link.discard(event);
            }
        }
        self.release(&mut run);
        self.abort.reset();
        warn!("[{}] call {} cancelled", self.label, run.call);
    }

    fn reclaim_dropped_run(&mut self) -> Result<()> {
        let Some(previous) = self.outstanding.take() else {
            return Ok(());
        };
        if previous.lease.strong_count() > 0 {
            let call = previous.call;
            self.outstanding = Some(previous);
            return Err(Error::Configuration(format!(
                "call {call} is still outstanding; finish or cancel it first"
            )));
        }
        let slots: Vec<usize> = (0..previous.num_sequences).collect();
        self.cache.release(&slots);
        self.abort.reset();
        warn!(
            "[{}] call {} was dropped unfinished, released its {} sequences",
            self.label, previous.call, previous.num_sequences
        );
        Ok(())
    }

    fn validate(&self, input: &GenerationInput, sampling: &SamplingConfig) -> Result<()> {
        let batch = input.batch_size();
        if batch == 0 {
            return Err(Error::Configuration("empty batch".into()));
        }
        if batch > self.config.max_batch_size {
            return Err(Error::Configuration(format!(
                "batch size {batch} exceeds max_batch_size {}",
                self.config.max_batch_size
            )));
        }
        sampling.validate()?;
        if sampling.beam_width > self.config.max_beam_width {
            return Err(Error::Configuration(format!(
                "beam width {} exceeds max_beam_width {}",
                sampling.beam_width, self.config.max_beam_width
            )));
        }
        if input.max_new_tokens == 0 {
            return Err(Error::Configuration("max_new_tokens must be > 0".into()));
        }
        if let Some(i) = input.sequences.iter().position(Vec::is_empty) {
            return Err(Error::Configuration(format!("prompt {i} is empty")));
        }
        let longest = input.max_prompt_len();
        if longest + input.max_new_tokens > self.config.max_sequence_length {
            return Err(Error::Configuration(format!(
                "prompt of {longest} tokens + {} new tokens exceeds max_sequence_length {}",
                input.max_new_tokens, self.config.max_sequence_length
            )));
        }
        let vocab = self.topology.vocab_size;
        for (name, id) in [("end_id", input.end_id), ("pad_id", input.pad_id)] {
            if id as usize >= vocab {
                return Err(Error::Configuration(format!(
                    "{name} {id} outside vocabulary of {vocab}"
                )));
            }
        }
        if let Some(&token) = input.sequences.iter().flatten().find(|&&t| t as usize >= vocab) {
            return Err(Error::Configuration(format!(
                "prompt token {token} outside vocabulary of {vocab}"
            )));
        }
        Ok(())
    }

    fn run_rounds(&mut self, run: &mut GenerationRun, output: &mut GenerationOutput<'_>) -> Result<()> {
        let mut round = 0;
        while !run.is_finished() {
            let live: Vec<usize> = run
                .micro_batches
                .iter()
                .filter(|mb| !mb.is_finished())
                .map(MicroBatch::index)
                .collect();
            debug!(
                "[{}] call {} round {round}: micro-batches {live:?}",
                self.label, run.call
            );
            for &i in &live {
                self.issue(run.call, &run.sampling, &mut run.micro_batches[i])?;
            }
            for &i in &live {
                self.complete(run.max_new_tokens, &mut run.micro_batches[i], output)?;
            }
            round += 1;
        }
        Ok(())
    }

    /// Forward pass of the micro-batch's next step, then the decoder half:
    /// the final stage decodes and sends the outcome (or the failure) to
    /// every other stage, the others post the matching receive. Step
    /// failures are recorded on the micro-batch, not returned, so the
    /// transfers every peer expects still happen. A failure left over from
    /// the previous step's cache growth skips the forward pass.
    fn issue(&mut self, call: u64, sampling: &SamplingConfig, mb: &mut MicroBatch) -> Result<()> {
        let step = mb.step;
        let tag = PayloadTag {
            call,
            micro_batch: mb.index,
            step,
        };
        let rows = mb.decoder.inputs_for_step(step);
        let phase = if step == 0 {
            StepPhase::Context
        } else {
            StepPhase::Generation
        };
        let inputs = StepInputs {
            shape: StepShape {
                phase,
                rows: mb.decoder.num_rows(),
                beam_width: mb.decoder.beam_width(),
                input_len: rows.input_len(),
            },
            micro_batch: mb.index,
            step,
            tokens: rows.tokens,
            past_lengths: rows.past_lengths,
            live: rows.live,
            cache_slots: mb.row_slots(),
        };
        let forward = match mb.failure.take() {
            Some(e) => Err(e),
            None => self.forward(&inputs),
        };

        match self.role {
            DecoderRole::Local => {
                let decoded = forward.and_then(|out| self.decode(sampling, mb, out, tag));
                let payload = match decoded {
                    Ok(update) => {
                        let payload = Payload::DecoderStep(update.clone());
                        mb.update = Some(update);
                        payload
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        mb.record_failure(e);
                        Payload::StepFailed { tag, reason }
                    }
                };
                for peer in self.world.pipeline_peers() {
                    let event = self.link.send_async(peer, payload.clone())?;
                    mb.sends.push(event);
                }
            }
            DecoderRole::ReceiveOnly => {
                if let Err(e) = forward {
                    mb.record_failure(e);
                }
                let last = self.world.last_pipeline_rank();
                mb.pending = Some(PendingRecv::post(&mut self.link, last, tag)?);
            }
        }
        Ok(())
    }

    fn forward(&mut self, inputs: &StepInputs) -> Result<StepOutput<E::Logits>> {
        let shape = inputs.shape;
        let context = self.contexts.select(
            inputs.micro_batch,
            shape.phase,
            inputs.step % 2,
            shape.rows,
            shape.input_len,
        )?;
        if shape.phase == StepPhase::Generation && self.config.reuse_captured_steps {
            self.captures[inputs.micro_batch].run(&mut self.engine, context, inputs)
        } else {
            self.engine.run_step(context, inputs)
        }
    }

    fn decode(
        &self,
        sampling: &SamplingConfig,
        mb: &mut MicroBatch,
        output: StepOutput<E::Logits>,
        tag: PayloadTag,
    ) -> Result<StepUpdate> {
        let mut logits = output
            .into_logits()
            .ok_or_else(|| Error::Engine("final pipeline stage produced no logits".into()))?;
        let streams = SamplingStreams {
            per_request: self.config.decoder_per_request,
            micro_batch: mb.index,
            first_sequence: mb.sequences.start,
        };
        let update = mb.decoder.decode(&mut logits, sampling, &streams, tag)?;
        mb.decoder.apply(&update)?;
        Ok(update)
    }

    /// Second half of a step: settle the transfer, report the step, agree
    /// on stopping, then grow the cache of rows that will take another step.
    /// A callback failure is part of this step's flag.
    fn complete(
        &mut self,
        max_new_tokens: usize,
        mb: &mut MicroBatch,
        output: &mut GenerationOutput<'_>,
    ) -> Result<MicroBatchStatus> {
        self.settle(mb);
        let last = self.world.last_pipeline_rank();
        let finished = mb.decoder.all_finished();
        let abort = self.world.rank == last && self.abort.is_requested();
        let step = mb.step;
        if mb.failure.is_none() {
            let tokens = mb.update.take().map(|u| u.tokens).unwrap_or_default();
            let event = StepEvent {
                micro_batch: mb.index,
                step,
                first_sequence: mb.sequences.start,
                beam_width: mb.decoder.beam_width(),
                tokens,
                finished: finished || abort || step + 1 >= max_new_tokens,
            };
            if let Err(e) = output.notify(&event) {
                mb.record_failure(e);
            }
        }

        let local = if mb.failure.is_some() {
            StopFlag::Failed
        } else if finished || abort {
            StopFlag::Stop
        } else {
            StopFlag::Continue
        };
        let resolved = self.link.broadcast_flag(last, local)?;
        debug!(
            "[{}] micro-batch {} step {step}: local {local:?}, resolved {resolved:?}",
            self.label, mb.index
        );

        match resolved {
            StopFlag::Failed => {
                let error = mb.failure.take().unwrap_or_else(|| {
                    Error::Synchronization(format!(
                        "a peer rank failed micro-batch {} step {step}",
                        mb.index
                    ))
                });
                error!(
                    "[{}] micro-batch {} step {step} failed: {error}",
                    self.label, mb.index
                );
                return Err(error);
            }
            StopFlag::Stop if !finished => {
                debug!(
                    "[{}] micro-batch {} stopped early at step {step}",
                    self.label, mb.index
                );
                mb.decoder.force_finish(FinishReason::Aborted);
            }
            StopFlag::Stop | StopFlag::Continue => {}
        }

        mb.step += 1;
        mb.done = resolved == StopFlag::Stop || mb.step >= max_new_tokens;
        // Only rows that take another step grow. A refusal fails the next
        // step on this rank, which every peer then learns from its flag.
        if !mb.done {
            if let Err(e) = self.cache.extend(&mb.live_slots()) {
                warn!(
                    "[{}] micro-batch {} cannot grow for step {}: {e}",
                    self.label, mb.index, mb.step
                );
                mb.record_failure(Error::ResourceExhausted {
                    micro_batch: mb.index,
                    requested: e.requested,
                    available: e.available,
                });
            }
        }

        Ok(if mb.done {
            MicroBatchStatus::Finished
        } else {
            MicroBatchStatus::Running
        })
    }

    /// Wait for the step's transfer: the sends on the final stage, the
    /// update (applied to the mirror) elsewhere. Failures land on `mb`.
    fn settle(&mut self, mb: &mut MicroBatch) {
        let last = self.world.last_pipeline_rank();
        match self.role {
            DecoderRole::Local => {
                for event in std::mem::take(&mut mb.sends) {
                    if let Err(e) = self.link.wait(event) {
                        mb.record_failure(e);
                    }
                }
            }
            DecoderRole::ReceiveOnly => {
                if let Some(pending) = mb.pending.take() {
                    match pending.wait(&mut self.link) {
                        Ok(Payload::DecoderStep(update)) => match mb.decoder.apply(&update) {
                            Ok(()) => mb.update = Some(update),
                            Err(e) => mb.record_failure(e),
                        },
                        Ok(Payload::StepFailed { reason, .. }) => {
                            mb.record_failure(Error::Synchronization(format!(
                                "rank {last} failed micro-batch {} step {}: {reason}",
                                mb.index, mb.step
                            )));
                        }
                        Ok(other) => mb.record_failure(Error::Synchronization(format!(
                            "expected a decoder step from rank {last}, received {:?}",
                            other.tag()
                        ))),
                        Err(e) => mb.record_failure(e),
                    }
                }
            }
        }
    }

    /// Read out every micro-batch. The final stage holds the authoritative
    /// rows and ships them to the first stage, which checks them against
    /// its own mirror before writing.
    fn collect(&mut self, run: &mut GenerationRun, output: &mut GenerationOutput<'_>) -> Result<()> {
        let first = self.world.first_pipeline_rank();
        let last = self.world.last_pipeline_rank();
        let writes = self.world.rank == first;
        if writes {
            output.prepare(
                run.num_sequences,
                run.beam_width,
                run.pad_id,
                run.sampling.output_log_probs,
            );
        }

        for mb in &mut run.micro_batches {
            let tag = PayloadTag {
                call: run.call,
                micro_batch: mb.index,
                step: mb.step,
            };
            let rows = mb.decoder.finalize()?;
            match self.role {
                DecoderRole::Local if writes => output.write(mb.sequences.start, rows),
                DecoderRole::Local => {
                    let event = self
                        .link
                        .send_async(first, Payload::OutputIds { tag, sequences: rows })?;
                    self.link.wait(event)?;
                }
                DecoderRole::ReceiveOnly if writes => {
                    let pending = PendingRecv::post(&mut self.link, last, tag)?;
                    match pending.wait(&mut self.link)? {
                        Payload::OutputIds { sequences, .. } => {
                            if sequences != rows {
                                return Err(Error::Synchronization(format!(
                                    "decoder state of micro-batch {} diverged from rank {last}",
                                    mb.index
                                )));
                            }
                            output.write(mb.sequences.start, sequences);
                        }
                        other => {
                            return Err(Error::Synchronization(format!(
                                "expected output ids from rank {last}, received {:?}",
                                other.tag()
                            )))
                        }
                    }
                }
                DecoderRole::ReceiveOnly => {}
            }
        }
        Ok(())
    }

    fn release(&mut self, run: &mut GenerationRun) {
        if self
            .outstanding
            .as_ref()
            .is_some_and(|o| o.call == run.call)
        {
            self.outstanding = None;
        }
        for mb in &mut run.micro_batches {
            self.cache.release(&mb.reserved);
            mb.reserved.clear();
        }
    }
}

impl<E: StepEngine, C: KvCacheManager, L: CrossRankLink> MicroBatchStepper
    for GenerationSession<E, C, L>
{
    type Run = GenerationRun;

    fn start(&mut self, input: &GenerationInput, sampling: &SamplingConfig) -> Result<GenerationRun> {
        GenerationSession::start(self, input, sampling)
    }

    fn advance(
        &mut self,
        run: &mut GenerationRun,
        micro_batch: usize,
        output: &mut GenerationOutput<'_>,
    ) -> Result<MicroBatchStatus> {
        GenerationSession::advance(self, run, micro_batch, output)
    }

    fn finish(&mut self, run: GenerationRun, output: &mut GenerationOutput<'_>) -> Result<()> {
        GenerationSession::finish(self, run, output)
    }

    fn cancel(&mut self, run: GenerationRun) {
        GenerationSession::cancel(self, run);
    }
}

impl<E: StepEngine, C: KvCacheManager, L: CrossRankLink> Drop for GenerationSession<E, C, L> {
    fn drop(&mut self) {
        self.clear_captured_steps();
    }
}

impl<E: StepEngine, C: KvCacheManager, L: CrossRankLink> std::fmt::Debug
    for GenerationSession<E, C, L>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("label", &self.label)
            .field("world", &self.world)
            .field("role", &self.role)
            .field("num_micro_batches", &self.num_micro_batches)
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}
