//! Fuel and temperature telemetry from the nodes on the bus
//!
//! Nodes are learned from any received traffic. Each known node is then
//! asked for `raw_fuel_level` and `raw_temperature` in turn, with a
//! ReadDataById request addressed to it, and the answers are kept per node.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CollectorConfig;
use crate::j1939::CanIdentifier;
use crate::transport::{ensure_connected, CanFrame, CanPort, Direction, TransportError};
use crate::uds::data_identifiers::{CURR_FUEL_TANK, RAW_FUEL_LEVEL, RAW_TEMPERATURE};
use crate::uds::services::ReadDataById;
use crate::uds::{ByteOrder, UdsIdentifiers, UdsVar};

/// Read in this order from every node
const POLLED: [UdsVar; 2] = [RAW_FUEL_LEVEL, RAW_TEMPERATURE];

/// Lower bound of the silence after which a node is dropped
const MIN_STALE_TIMEOUT: Duration = Duration::from_secs(6);

/// Latest telemetry of one node
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodeReading {
    pub address: u8,
    /// `curr_fuel_tank` when the node reports it, the poll interval in ms otherwise
    pub period: u32,
    pub fuel_level: u32,
    /// Degrees Celsius
    pub temperature: f64,
    pub fuel_count: u64,
    pub temperature_count: u64,
    #[serde(skip)]
    pub last_seen: Instant,
}

impl NodeReading {
    fn new(address: u8, now: Instant) -> Self {
        Self {
            address,
            period: 0,
            fuel_level: 0,
            temperature: 0.0,
            fuel_count: 0,
            temperature_count: 0,
            last_seen: now,
        }
    }
}

/// One ReadDataById request and when the next one is due
#[derive(Debug, Clone, PartialEq)]
pub struct Poll {
    pub address: u8,
    pub pid: u16,
    pub frame: CanFrame,
    pub next_in: Duration,
}

/// Round-robin telemetry poller
#[derive(Debug, Clone)]
pub struct Collector {
    identifiers: UdsIdentifiers,
    byte_order: ByteOrder,
    config: CollectorConfig,
    /// Known nodes in the order they were first heard
    nodes: Vec<NodeReading>,
    next_node: usize,
    /// Index into [`POLLED`]
    phase: usize,
}

impl Collector {
    pub fn new(identifiers: &UdsIdentifiers, byte_order: ByteOrder, config: CollectorConfig) -> Self {
        Self {
            identifiers: *identifiers,
            byte_order,
            config,
            nodes: Vec::new(),
            next_node: 0,
            phase: 0,
        }
    }

    pub fn readings(&self) -> &[NodeReading] {
        &self.nodes
    }

    pub fn reading(&self, address: u8) -> Option<&NodeReading> {
        self.nodes.iter().find(|n| n.address == address)
    }

    fn tester(&self) -> u8 {
        self.identifiers.tester_address()
    }

    /// Learn the sender of `frame` and take any telemetry it carries
    ///
    /// Returns true when a reading changed.
    pub fn observe(&mut self, frame: &CanFrame, now: Instant) -> bool {
        if frame.direction == Direction::Tx {
            return false;
        }
        let id = CanIdentifier::decode(frame.id);
        let tester = self.tester();
        let address = if id.src() == tester { id.dst() } else { id.src() };
        if address == tester {
            return false;
        }

        let index = match self.nodes.iter().position(|n| n.address == address) {
            Some(index) => index,
            None => {
                debug!("New node 0x{:02X}", address);
                self.nodes.push(NodeReading::new(address, now));
                self.nodes.len() - 1
            }
        };
        self.nodes[index].last_seen = now;

        if id.pgn() != self.identifiers.rx.pgn() {
            return false;
        }
        let data = frame.payload();
        let order = self.byte_order;
        let value = ReadDataById::value(data);
        let poll_interval_ms = u32::try_from(self.config.poll_interval_ms).unwrap_or(u32::MAX);
        let node = &mut self.nodes[index];

        if ReadDataById::verify(data, CURR_FUEL_TANK.pid, order) {
            node.period = value;
        } else if ReadDataById::verify(data, RAW_FUEL_LEVEL.pid, order) {
            node.period = poll_interval_ms;
            node.fuel_level = value;
            node.fuel_count += 1;
        } else if ReadDataById::verify(data, RAW_TEMPERATURE.pid, order) {
            node.period = poll_interval_ms;
            node.temperature = value as f64 / 10.0;
            node.temperature_count += 1;
        } else {
            return false;
        }
        true
    }

    /// Silence after which a node counts as gone
    pub fn stale_timeout(&self) -> Duration {
        let cycle = self.config.poll_interval() + self.config.cycle_pause();
        let nodes = self.nodes.len().max(1) as f64;
        cycle.mul_f64(2.5 * nodes).max(MIN_STALE_TIMEOUT)
    }

    /// Drop nodes not heard from within [`Self::stale_timeout`]
    pub fn prune(&mut self, now: Instant) -> usize {
        let timeout = self.stale_timeout();
        let before = self.nodes.len();
        self.nodes
            .retain(|n| now.saturating_duration_since(n.last_seen) <= timeout);
        let removed = before - self.nodes.len();

        if removed > 0 {
            debug!(removed, nodes = self.nodes.len(), "Stale nodes pruned");
            if self.nodes.is_empty() {
                self.next_node = 0;
                self.phase = 0;
            } else {
                self.next_node %= self.nodes.len();
            }
        }
        removed
    }

    /// Next request of the round-robin, `None` while no node is known
    pub fn next_request(&mut self) -> Option<Poll> {
        if self.nodes.is_empty() {
            return None;
        }
        self.next_node %= self.nodes.len();
        let address = self.nodes[self.next_node].address;
        let var = POLLED[self.phase];

        let id = self.identifiers.tx.with_dst(address);
        let frame = CanFrame::new(id.encode(), ReadDataById::request(var.pid, self.byte_order));

        let next_in = if self.phase + 1 < POLLED.len() {
            self.phase += 1;
            self.config.poll_interval()
        } else {
            self.phase = 0;
            self.next_node = (self.next_node + 1) % self.nodes.len();
            self.config.cycle_pause()
        };

        Some(Poll {
            address,
            pid: var.pid,
            frame,
            next_in,
        })
    }

    /// Listen and poll on `port` for `window`
    pub async fn run(&mut self, port: Arc<dyn CanPort>, window: Duration) -> Result<(), TransportError> {
        let mut frames = port.subscribe();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        // Give the bus a moment to show who is there
        let poll = tokio::time::sleep(self.config.cycle_pause());
        tokio::pin!(poll);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut poll => {
                    let now = Instant::now();
                    let mut next_in = self.config.cycle_pause();
                    if port.is_connected().await {
                        self.prune(now);
                        if let Some(request) = self.next_request() {
                            next_in = request.next_in;
                            port.send_frame(request.frame).await?;
                        }
                    } else {
                        ensure_connected(port.as_ref()).await?;
                    }
                    poll.as_mut().reset(now + next_in);
                }
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        self.observe(&frame, Instant::now());
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Collector fell behind the bus"),
                    Err(RecvError::Closed) => return Err(TransportError::Closed),
                },
            }
        }

        debug!(nodes = self.nodes.len(), "Collection finished");
        Ok(())
    }
}
