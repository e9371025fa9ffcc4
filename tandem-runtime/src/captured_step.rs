//! Ping-pong cache of captured generation steps.
//!
//! Each micro-batch owns two slots, selected by step parity, so the
//! recording used by step `n` stays alive while step `n + 1` replays or
//! re-records the other slot. A slot only replays for the exact
//! [`StepShape`] it was recorded against; any other shape releases the stale
//! recording and records afresh.

use tandem::engine::{ContextId, StepEngine, StepInputs, StepOutput, StepShape};
use tandem::Result;

/// Observable state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Capturing,
    Ready(StepShape),
}

enum Slot<R> {
    Empty,
    Capturing,
    Ready { shape: StepShape, recording: R },
}

impl<R> Slot<R> {
    fn state(&self) -> SlotState {
        match self {
            Self::Empty => SlotState::Empty,
            Self::Capturing => SlotState::Capturing,
            Self::Ready { shape, .. } => SlotState::Ready(*shape),
        }
    }
}

/// Two-slot recording cache of one micro-batch.
pub struct CapturedStepCache<R> {
    slots: [Slot<R>; 2],
}

impl<R> Default for CapturedStepCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> CapturedStepCache<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [Slot::Empty, Slot::Empty],
        }
    }

    /// Slot used by `step`.
    #[must_use]
    pub fn slot_for(step: usize) -> usize {
        step % 2
    }

    #[must_use]
    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot].state()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| matches!(s, Slot::Empty))
    }

    /// Execute `inputs` through the slot of its step: replay when the slot
    /// holds a recording of the same shape, otherwise record.
    ///
    /// # Errors
    /// Returns the engine's error; a slot whose recording failed is left
    /// empty.
    ///
    /// # Panics
    /// Panics if the other slot is mid-capture.
    pub fn run<E>(
        &mut self,
        engine: &mut E,
        context: ContextId,
        inputs: &StepInputs,
    ) -> Result<StepOutput<E::Logits>>
    where
        E: StepEngine<Recording = R>,
    {
        let slot = Self::slot_for(inputs.step);
        assert!(
            !matches!(self.slots[1 - slot], Slot::Capturing),
            "slot {} is still capturing",
            1 - slot
        );

        if let Slot::Ready { shape, recording } = &self.slots[slot] {
            if *shape == inputs.shape {
                log::debug!(
                    "micro-batch {} step {}: replaying slot {slot}",
                    inputs.micro_batch,
                    inputs.step
                );
                return engine.replay_step(recording, inputs);
            }
        }

        if let Slot::Ready { shape, recording } =
            std::mem::replace(&mut self.slots[slot], Slot::Capturing)
        {
            log::debug!(
                "micro-batch {} step {}: shape changed from {shape:?}, re-recording slot {slot}",
                inputs.micro_batch,
                inputs.step
            );
            if let Err(e) = engine.release_recording(recording) {
                log::warn!("failed to release stale captured step: {e}");
            }
        } else {
            log::debug!(
                "micro-batch {} step {}: recording slot {slot}",
                inputs.micro_batch,
                inputs.step
            );
        }

        match engine.record_step(context, inputs) {
            Ok((output, recording)) => {
                self.slots[slot] = Slot::Ready {
                    shape: inputs.shape,
                    recording,
                };
                Ok(output)
            }
            Err(e) => {
                self.slots[slot] = Slot::Empty;
                Err(e)
            }
        }
    }

    /// Release both slots. Safe on an empty cache; release failures are
    /// logged and suppressed.
    pub fn clear<E>(&mut self, engine: &mut E)
    where
        E: StepEngine<Recording = R>,
    {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Ready { recording, .. } = std::mem::replace(slot, Slot::Empty) {
                if let Err(e) = engine.release_recording(recording) {
                    log::warn!("failed to release captured step in slot {i}: {e}");
                }
            }
        }
    }
}
