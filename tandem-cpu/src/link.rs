//! In-process cross-rank link over `std::sync::mpsc` channels.
//!
//! One [`ChannelLink`] per rank of a pipeline group, each driven from its own
//! thread. Payload sends complete immediately (unbounded channels); receives
//! are matched to posted events in FIFO order per peer and block for at most
//! the configured timeout.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tandem::comm::{CrossRankLink, EventKind, Payload, StopFlag, SyncEvent};
use tandem::{Error, Result};

struct Peer {
    payload_tx: Sender<Payload>,
    payload_rx: Receiver<Payload>,
    flag_tx: Sender<StopFlag>,
    flag_rx: Receiver<StopFlag>,
    /// Receive events posted against this peer, oldest first.
    posted: VecDeque<u64>,
}

/// One rank's end of an in-process pipeline group.
pub struct ChannelLink {
    rank: usize,
    peers: BTreeMap<usize, Peer>,
    timeout: Duration,
    next_event: u64,
    /// Issued send events not yet waited on.
    sent: HashMap<u64, usize>,
    /// Receive events whose payload arrived but was not yet claimed.
    arrived: HashMap<u64, Payload>,
    /// Posted receives whose payload is dropped on arrival.
    abandoned: HashSet<u64>,
}

impl ChannelLink {
    /// Create fully connected links for `ranks` (global rank ids), returned
    /// in the same order.
    ///
    /// # Panics
    /// Panics if `ranks` contains duplicates.
    #[must_use]
    pub fn group(ranks: &[usize], timeout: Duration) -> Vec<ChannelLink> {
        let mut links: Vec<ChannelLink> = ranks
            .iter()
            .map(|&rank| ChannelLink {
                rank,
                peers: BTreeMap::new(),
                timeout,
                next_event: 0,
                sent: HashMap::new(),
                arrived: HashMap::new(),
                abandoned: HashSet::new(),
            })
            .collect();

        for i in 0..ranks.len() {
            for j in 0..ranks.len() {
                if i == j {
                    continue;
                }
                assert_ne!(ranks[i], ranks[j], "duplicate rank {}", ranks[i]);
                // i → j
                let (payload_tx, payload_rx_j) = mpsc::channel();
                let (flag_tx, flag_rx_j) = mpsc::channel();
                // j → i
                let (payload_tx_j, payload_rx) = mpsc::channel();
                let (flag_tx_j, flag_rx) = mpsc::channel();
                if i < j {
                    links[i].peers.insert(
                        ranks[j],
                        Peer {
                            payload_tx,
                            payload_rx,
                            flag_tx,
                            flag_rx,
                            posted: VecDeque::new(),
                        },
                    );
                    links[j].peers.insert(
                        ranks[i],
                        Peer {
                            payload_tx: payload_tx_j,
                            payload_rx: payload_rx_j,
                            flag_tx: flag_tx_j,
                            flag_rx: flag_rx_j,
                            posted: VecDeque::new(),
                        },
                    );
                }
            }
        }
        links
    }

    /// Group peers of this rank, ascending.
    #[must_use]
    pub fn peers(&self) -> Vec<usize> {
        self.peers.keys().copied().collect()
    }

    fn peer(&mut self, rank: usize) -> Result<&mut Peer> {
        let me = self.rank;
        self.peers
            .get_mut(&rank)
            .ok_or_else(|| Error::Synchronization(format!("rank {me} has no link to {rank}")))
    }

    fn event_id(&mut self) -> u64 {
        let id = self.next_event;
        self.next_event += 1;
        id
    }

    fn disconnected(&self, peer: usize, what: &str, err: RecvTimeoutError) -> Error {
        match err {
            RecvTimeoutError::Timeout => Error::Synchronization(format!(
                "rank {}: {what} from rank {peer} timed out after {:?}",
                self.rank, self.timeout
            )),
            RecvTimeoutError::Disconnected => Error::Synchronization(format!(
                "rank {}: rank {peer} hung up during {what}",
                self.rank
            )),
        }
    }
}

impl CrossRankLink for ChannelLink {
    fn rank(&self) -> usize {
        self.rank
    }

    fn send_async(&mut self, peer: usize, payload: Payload) -> Result<SyncEvent> {
        let me = self.rank;
        self.peer(peer)?.payload_tx.send(payload).map_err(|_| {
            Error::Synchronization(format!("rank {me}: rank {peer} hung up before send"))
        })?;
        let id = self.event_id();
        self.sent.insert(id, peer);
        Ok(SyncEvent::new(id, EventKind::Send, peer))
    }

    fn recv_async(&mut self, peer: usize) -> Result<SyncEvent> {
        self.peer(peer)?;
        let id = self.event_id();
        self.peer(peer)?.posted.push_back(id);
        Ok(SyncEvent::new(id, EventKind::Recv, peer))
    }

    fn wait(&mut self, event: SyncEvent) -> Result<Option<Payload>> {
        match event.kind() {
            EventKind::Send => {
                self.sent.remove(&event.id()).map(|_| None).ok_or_else(|| {
                    Error::Synchronization(format!("unknown send event {}", event.id()))
                })
            }
            EventKind::Recv => {
                let timeout = self.timeout;
                let peer_rank = event.peer();
                while !self.arrived.contains_key(&event.id()) {
                    let peer = self.peer(peer_rank)?;
                    if !peer.posted.contains(&event.id()) {
                        return Err(Error::Synchronization(format!(
                            "unknown receive event {}",
                            event.id()
                        )));
                    }
                    let received = peer.payload_rx.recv_timeout(timeout);
                    let payload =
                        received.map_err(|e| self.disconnected(peer_rank, "receive", e))?;
                    if let Some(id) = self.peer(peer_rank)?.posted.pop_front() {
                        if self.abandoned.remove(&id) {
                            log::debug!(
                                "rank {}: dropping payload {:?} of abandoned receive",
                                self.rank,
                                payload.tag()
                            );
                        } else {
                            self.arrived.insert(id, payload);
                        }
                    }
                }
                Ok(self.arrived.remove(&event.id()))
            }
        }
    }

    fn discard(&mut self, event: SyncEvent) {
        match event.kind() {
            EventKind::Send => {
                self.sent.remove(&event.id());
            }
            EventKind::Recv => {
                if self.arrived.remove(&event.id()).is_none() {
                    self.abandoned.insert(event.id());
                }
            }
        }
    }

    fn broadcast_flag(&mut self, root: usize, flag: StopFlag) -> Result<StopFlag> {
        let timeout = self.timeout;
        if self.rank == root {
            let mut contributions = Vec::with_capacity(self.peers.len());
            let ranks: Vec<usize> = self.peers.keys().copied().collect();
            for &r in &ranks {
                let got = self.peer(r)?.flag_rx.recv_timeout(timeout);
                match got {
                    Ok(f) => contributions.push(f),
                    Err(e) => return Err(self.disconnected(r, "stop flag", e)),
                }
            }
            let resolved = StopFlag::resolve(flag, contributions);
            for &r in &ranks {
                // A peer that already hung up surfaces on its own side.
                let _ = self.peer(r)?.flag_tx.send(resolved);
            }
            Ok(resolved)
        } else {
            let me = self.rank;
            self.peer(root)?.flag_tx.send(flag).map_err(|_| {
                Error::Synchronization(format!("rank {me}: root {root} hung up before stop flag"))
            })?;
            let got = self.peer(root)?.flag_rx.recv_timeout(timeout);
            got.map_err(|e| self.disconnected(root, "stop flag", e))
        }
    }
}
