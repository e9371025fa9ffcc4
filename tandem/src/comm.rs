//! Cross-rank link between pipeline stages.
//!
//! The session exchanges three things between pipeline ranks: the decoder
//! outcome of every step (final stage → every other stage), the stop flag
//! of every round (resolved identically on all ranks), and the finalised
//! output ids (final stage → first stage).
//!
//! Transfers are asynchronous: `send_async` / `recv_async` return a
//! [`SyncEvent`] immediately, and a received payload only becomes readable
//! through [`CrossRankLink::wait`] on its event.

use crate::step::{FinalizedSequence, StepUpdate};
use crate::{Error, Result};

/// Identifies which call, micro-batch and step a payload belongs to.
///
/// Receivers use it to skip payloads left over from a call that aborted
/// before they were consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PayloadTag {
    /// Per-session `generate` call counter.
    pub call: u64,
    pub micro_batch: usize,
    pub step: usize,
}

/// Message carried between pipeline ranks.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Decoder outcome of one step.
    DecoderStep(StepUpdate),
    /// The final stage failed this step; receivers must not wait for an
    /// update.
    StepFailed { tag: PayloadTag, reason: String },
    /// Finalised rows of one micro-batch.
    OutputIds {
        tag: PayloadTag,
        sequences: Vec<FinalizedSequence>,
    },
}

impl Payload {
    #[must_use]
    pub fn tag(&self) -> PayloadTag {
        match self {
            Self::DecoderStep(update) => update.tag,
            Self::StepFailed { tag, .. } | Self::OutputIds { tag, .. } => *tag,
        }
    }
}

/// Direction of the transfer an event marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Send,
    Recv,
}

/// Marker for one asynchronous link operation.
///
/// Paired with exactly one producing operation; consumers wait on it
/// through the link that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncEvent {
    id: u64,
    kind: EventKind,
    peer: usize,
}

impl SyncEvent {
    #[must_use]
    pub fn new(id: u64, kind: EventKind, peer: usize) -> Self {
        Self { id, kind, peer }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Rank on the other end of the transfer.
    #[must_use]
    pub fn peer(&self) -> usize {
        self.peer
    }
}

/// Per-round stop decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopFlag {
    Continue,
    Stop,
    /// Some rank failed this round; every rank abandons the call.
    Failed,
}

impl StopFlag {
    /// Resolve the flag every rank acts on: `Failed` from any contributor
    /// dominates, otherwise the root's value wins.
    #[must_use]
    pub fn resolve(root: StopFlag, others: impl IntoIterator<Item = StopFlag>) -> StopFlag {
        if root == Self::Failed || others.into_iter().any(|f| f == Self::Failed) {
            Self::Failed
        } else {
            root
        }
    }

    /// Encode as one byte for transports that move raw bytes.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Continue => 0,
            Self::Stop => 1,
            Self::Failed => 2,
        }
    }

    /// Decode a byte produced by [`StopFlag::to_byte`]; unknown values are
    /// treated as failures.
    #[must_use]
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Continue,
            1 => Self::Stop,
            _ => Self::Failed,
        }
    }
}

/// Pipeline-parallel communication used by the generation session.
pub trait CrossRankLink {
    /// Global rank of this end of the link.
    fn rank(&self) -> usize;

    /// Start sending `payload` to `peer`.
    ///
    /// # Errors
    /// Returns [`Error::Synchronization`] if the peer is unreachable.
    fn send_async(&mut self, peer: usize, payload: Payload) -> Result<SyncEvent>;

    /// Post a receive for the next payload from `peer`.
    ///
    /// # Errors
    /// Returns [`Error::Synchronization`] if the peer is unreachable.
    fn recv_async(&mut self, peer: usize) -> Result<SyncEvent>;

    /// Block until `event` completes. Receive events yield their payload;
    /// send events yield `None`.
    ///
    /// # Errors
    /// Returns [`Error::Synchronization`] if the transfer does not complete.
    fn wait(&mut self, event: SyncEvent) -> Result<Option<Payload>>;

    /// Abandon an event that will never be waited on. A discarded receive
    /// still consumes its payload when it arrives, so later receives from
    /// the same peer stay paired with their own payloads.
    fn discard(&mut self, _event: SyncEvent) {}

    /// Contribute this rank's stop view and return the value every pipeline
    /// rank resolves (see [`StopFlag::resolve`]).
    ///
    /// # Errors
    /// Returns [`Error::Synchronization`] if the exchange does not complete.
    fn broadcast_flag(&mut self, root: usize, flag: StopFlag) -> Result<StopFlag>;
}

/// Link for a single-stage (single-process) pipeline: nothing to exchange.
#[derive(Debug, Clone, Copy)]
pub struct LocalLink {
    rank: usize,
}

impl LocalLink {
    #[must_use]
    pub fn new(rank: usize) -> Self {
        Self { rank }
    }
}

impl Default for LocalLink {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CrossRankLink for LocalLink {
    fn rank(&self) -> usize {
        self.rank
    }

    fn send_async(&mut self, peer: usize, _payload: Payload) -> Result<SyncEvent> {
        Err(Error::Synchronization(format!(
            "single-process link has no peer {peer}"
        )))
    }

    fn recv_async(&mut self, peer: usize) -> Result<SyncEvent> {
        Err(Error::Synchronization(format!(
            "single-process link has no peer {peer}"
        )))
    }

    fn wait(&mut self, event: SyncEvent) -> Result<Option<Payload>> {
        Err(Error::Synchronization(format!(
            "single-process link issued no event {}",
            event.id()
        )))
    }

    fn broadcast_flag(&mut self, _root: usize, flag: StopFlag) -> Result<StopFlag> {
        Ok(flag)
    }
}
