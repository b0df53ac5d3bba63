//! ECU source address detection
//!
//! Watches bus traffic and ranks the nodes it sees. A node that sends
//! diagnostic (PF 0xDA) frames is very likely the bootloader; the
//! destinations of those frames tell which tester address it talks to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::j1939::CanIdentifier;
use crate::transport::{CanFrame, CanPort, Direction, TransportError};
use crate::uds::UdsIdentifiers;

#[derive(Debug, Clone, Default)]
struct NodeStats {
    total: u64,
    uds: u64,
    last_seen: u64,
    tester_votes: HashMap<u8, u64>,
}

/// A node seen on the bus, ranked by [`NodeObserver::candidates`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub address: u8,
    pub total: u64,
    pub uds: u64,
    /// Observation counter value when the node was last heard
    pub last_seen: u64,
    /// Most frequent destination of the node's diagnostic frames
    pub tester: u8,
}

/// Bus traffic statistics per source address
#[derive(Debug, Clone)]
pub struct NodeObserver {
    own_address: u8,
    nodes: HashMap<u8, NodeStats>,
    counter: u64,
}

impl NodeObserver {
    /// Frames from `identifiers`' tester address are ours and never counted
    pub fn new(identifiers: &UdsIdentifiers) -> Self {
        Self {
            own_address: identifiers.tester_address(),
            nodes: HashMap::new(),
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.counter = 0;
    }

    /// Count one frame; the table is keyed by source address, so it never
    /// holds more than 256 nodes
    pub fn observe(&mut self, frame: &CanFrame) {
        if frame.direction == Direction::Tx {
            return;
        }
        let id = CanIdentifier::decode(frame.id);
        if id.src() == self.own_address {
            return;
        }

        self.counter += 1;
        let stats = self.nodes.entry(id.src()).or_default();
        stats.total += 1;
        stats.last_seen = self.counter;
        if id.is_diagnostic() {
            stats.uds += 1;
            *stats.tester_votes.entry(id.dst()).or_default() += 1;
        }
    }

    /// All nodes, most likely bootloader first
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .nodes
            .iter()
            .map(|(address, stats)| self.candidate(*address, stats))
            .collect();
        candidates.sort_by(|a, b| rank(b).cmp(&rank(a)).then(a.address.cmp(&b.address)));
        candidates
    }

    pub fn best(&self) -> Option<Candidate> {
        self.candidates().into_iter().next()
    }

    fn candidate(&self, address: u8, stats: &NodeStats) -> Candidate {
        let tester = stats
            .tester_votes
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(tester, _)| *tester)
            .unwrap_or(self.own_address);
        Candidate {
            address,
            total: stats.total,
            uds: stats.uds,
            last_seen: stats.last_seen,
            tester,
        }
    }
}

fn rank(c: &Candidate) -> (u64, u64, u64) {
    (c.uds, c.total, c.last_seen)
}

/// Listen on `port` for `window` and rank what was heard
pub async fn detect(
    port: Arc<dyn CanPort>,
    identifiers: &UdsIdentifiers,
    window: Duration,
) -> Result<Vec<Candidate>, TransportError> {
    let mut frames = port.subscribe();
    let mut observer = NodeObserver::new(identifiers);
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = frames.recv() => match frame {
                Ok(frame) => observer.observe(&frame),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Detection fell behind the bus"),
                Err(RecvError::Closed) => return Err(TransportError::Closed),
            },
        }
    }

    debug!(nodes = observer.len(), "Detection finished");
    Ok(observer.candidates())
}
