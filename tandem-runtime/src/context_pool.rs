//! Execution contexts preallocated per micro-batch slot.
//!
//! Every micro-batch slot gets one context-phase context sized for a full
//! micro-batch of prompts, and two single-token generation contexts that
//! alternate by step parity (matching the captured-step slots).

use tandem::engine::{ContextId, ShapeBucket, StepEngine, StepPhase};
use tandem::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct SlotContexts {
    context: (ContextId, ShapeBucket),
    generation: [(ContextId, ShapeBucket); 2],
}

/// Contexts of every micro-batch slot, built once per session.
#[derive(Debug, Clone)]
pub struct ContextPool {
    slots: Vec<SlotContexts>,
}

impl ContextPool {
    /// Ask `engine` for the contexts of `num_micro_batches` slots of
    /// `max_rows` rows (micro-batch capacity × beam width) each.
    ///
    /// # Errors
    /// Propagates the engine's refusal of a bucket.
    pub fn build<E: StepEngine>(
        engine: &mut E,
        num_micro_batches: usize,
        max_rows: usize,
        beam_width: usize,
        max_sequence_length: usize,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(num_micro_batches);
        for _ in 0..num_micro_batches {
            let context_bucket = ShapeBucket {
                phase: StepPhase::Context,
                max_rows,
                beam_width,
                max_input_len: max_sequence_length,
                max_sequence_length,
                flip: 0,
            };
            let context = (engine.select_context(&context_bucket)?, context_bucket);

            let mut generation = [context; 2];
            for (flip, entry) in generation.iter_mut().enumerate() {
                let bucket = ShapeBucket {
                    phase: StepPhase::Generation,
                    max_rows,
                    beam_width,
                    max_input_len: 1,
                    max_sequence_length,
                    flip,
                };
                *entry = (engine.select_context(&bucket)?, bucket);
            }
            slots.push(SlotContexts {
                context,
                generation,
            });
        }
        Ok(Self { slots })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bucket of a micro-batch's context for `phase` / `flip`.
    #[must_use]
    pub fn bucket(&self, micro_batch: usize, phase: StepPhase, flip: usize) -> Option<&ShapeBucket> {
        let slot = self.slots.get(micro_batch)?;
        Some(match phase {
            StepPhase::Context => &slot.context.1,
            StepPhase::Generation => &slot.generation[flip % 2].1,
        })
    }

    /// Context for a step of `rows` rows and `input_len` tokens per row.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the micro-batch has no slot or
    /// the shape exceeds the slot's bucket.
    pub fn select(
        &self,
        micro_batch: usize,
        phase: StepPhase,
        flip: usize,
        rows: usize,
        input_len: usize,
    ) -> Result<ContextId> {
        let slot = self.slots.get(micro_batch).ok_or_else(|| {
            Error::Configuration(format!(
                "micro-batch {micro_batch} has no execution context ({} slots)",
                self.slots.len()
            ))
        })?;
        let (id, bucket) = match phase {
            StepPhase::Context => slot.context,
            StepPhase::Generation => slot.generation[flip % 2],
        };
        if !bucket.admits(rows, input_len) {
            return Err(Error::Configuration(format!(
                "{phase:?} step of {rows} rows × {input_len} tokens exceeds context bucket \
                 {} rows × {} tokens",
                bucket.max_rows, bucket.max_input_len
            )));
        }
        Ok(id)
    }
}
