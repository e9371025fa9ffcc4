//! Micro-batch partitioning and per-micro-batch call state.

use std::ops::Range;

use tandem::comm::{CrossRankLink, Payload, PayloadTag, SyncEvent};
use tandem::{Error, Result, StepUpdate};

use crate::decoder::DecoderState;

/// Split `batch_size` sequences into `min(num_micro_batches, batch_size)`
/// contiguous groups of `ceil(batch_size / n)` sequences; the last group
/// takes the remainder.
///
/// The assignment depends only on its arguments, so the cache reservation
/// and the decode loop always agree on it.
#[must_use]
pub fn partition(batch_size: usize, num_micro_batches: usize) -> Vec<Range<usize>> {
    if batch_size == 0 {
        return Vec::new();
    }
    let n = num_micro_batches.clamp(1, batch_size);
    let size = batch_size.div_ceil(n);
    (0..batch_size)
        .step_by(size)
        .map(|start| start..(start + size).min(batch_size))
        .collect()
}

/// A posted receive whose payload is not readable until waited on.
#[derive(Debug)]
#[must_use = "a posted receive must be waited on or discarded"]
pub struct PendingRecv {
    event: SyncEvent,
    expected: PayloadTag,
}

impl PendingRecv {
    /// Post a receive from `peer` for the payload tagged `expected`.
    ///
    /// # Errors
    /// Returns the link's error if the receive cannot be posted.
    pub fn post<L: CrossRankLink>(link: &mut L, peer: usize, expected: PayloadTag) -> Result<Self> {
        Ok(Self {
            event: link.recv_async(peer)?,
            expected,
        })
    }

    #[must_use]
    pub fn expected(&self) -> PayloadTag {
        self.expected
    }

    /// Block until the payload arrives. Payloads left over from an earlier
    /// call are skipped by re-posting.
    ///
    /// # Errors
    /// Returns [`Error::Synchronization`] if the receive fails or a payload
    /// of the current call arrives out of order.
    pub fn wait<L: CrossRankLink>(self, link: &mut L) -> Result<Payload> {
        let mut event = self.event;
        loop {
            let payload = link.wait(event)?.ok_or_else(|| {
                Error::Synchronization(format!("receive event {} carried no payload", event.id()))
            })?;
            let tag = payload.tag();
            if tag == self.expected {
                return Ok(payload);
            }
            if tag.call < self.expected.call {
                log::debug!("skipping stale payload {tag:?}");
                event = link.recv_async(event.peer())?;
                continue;
            }
            return Err(Error::Synchronization(format!(
                "expected payload {:?}, received {tag:?}",
                self.expected
            )));
        }
    }

    /// Abandon the receive.
    pub fn discard<L: CrossRankLink>(self, link: &mut L) {
        link.discard(self.event);
    }
}

/// One micro-batch of a `generate` call.
#[derive(Debug)]
pub struct MicroBatch {
    pub(crate) index: usize,
    pub(crate) sequences: Range<usize>,
    pub(crate) decoder: DecoderState,
    /// Steps completed.
    pub(crate) step: usize,
    /// Every rank agreed the micro-batch is done.
    pub(crate) done: bool,
    /// Cache slots held (absolute sequence indices).
    pub(crate) reserved: Vec<usize>,
    /// Receive posted for the step in flight (non-final stages).
    pub(crate) pending: Option<PendingRecv>,
    /// Sends issued for the step in flight (final stage).
    pub(crate) sends: Vec<SyncEvent>,
    /// Update applied for the step in flight.
    pub(crate) update: Option<StepUpdate>,
    /// First failure of the step in flight.
    pub(crate) failure: Option<Error>,
}

impl MicroBatch {
    pub(crate) fn new(index: usize, sequences: Range<usize>, decoder: DecoderState) -> Self {
        Self {
            index,
            reserved: sequences.clone().collect(),
            sequences,
            decoder,
            step: 0,
            done: false,
            pending: None,
            sends: Vec::new(),
            update: None,
            failure: None,
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Absolute sequence indices covered.
    #[must_use]
    pub fn sequences(&self) -> Range<usize> {
        self.sequences.clone()
    }

    #[must_use]
    pub fn decoder(&self) -> &DecoderState {
        &self.decoder
    }

    /// Steps completed so far.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Whether the stop consensus retired this micro-batch.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Cache slot of every row, sequence-major.
    pub(crate) fn row_slots(&self) -> Vec<usize> {
        let beam = self.decoder.beam_width();
        self.sequences
            .clone()
            .flat_map(|s| std::iter::repeat(s).take(beam))
            .collect()
    }

    /// Absolute indices of sequences that are still generating.
    pub(crate) fn live_slots(&self) -> Vec<usize> {
        self.decoder
            .live_sequences()
            .into_iter()
            .map(|s| self.sequences.start + s)
            .collect()
    }

    pub(crate) fn record_failure(&mut self, error: Error) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}
