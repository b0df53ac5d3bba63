//! In-memory CAN bus for testing
//!
//! Any number of ports can be attached to one [`MockCanBus`]. A frame sent
//! through a port is delivered to that port as [`Direction::Tx`] (the local
//! echo a real controller produces) and to every other port as
//! [`Direction::Rx`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{CanFrame, CanPort, Direction, TransportError};
use crate::config::MockConfig;

const CHANNEL_CAPACITY: usize = 4096;

struct Attached {
    node: usize,
    incoming_tx: broadcast::Sender<CanFrame>,
}

/// Shared in-memory bus
pub struct MockCanBus {
    ports: RwLock<Vec<Attached>>,
    /// Every frame put on the bus, in order, as seen by its sender
    history: RwLock<Vec<CanFrame>>,
    next_node: AtomicUsize,
}

impl MockCanBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            next_node: AtomicUsize::new(0),
        })
    }

    /// Attach a new node to the bus
    pub fn attach(self: &Arc<Self>, config: &MockConfig) -> MockCanPort {
        let node = self.next_node.fetch_add(1, Ordering::SeqCst);
        let (incoming_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.ports.write().push(Attached {
            node,
            incoming_tx: incoming_tx.clone(),
        });

        MockCanPort {
            node,
            bus: Arc::clone(self),
            config: config.clone(),
            connected: AtomicBool::new(true),
            incoming_tx,
        }
    }

    /// Put a frame on the bus from a node that is not attached
    pub fn inject(&self, id: u32, bytes: &[u8]) {
        let frame = CanFrame::received(id, bytes);
        self.history.write().push(frame.clone());
        self.deliver(None, frame);
    }

    /// Frames put on the bus so far
    pub fn history(&self) -> Vec<CanFrame> {
        self.history.read().clone()
    }

    pub fn clear_history(&self) {
        self.history.write().clear();
    }

    fn deliver(&self, from: Option<usize>, frame: CanFrame) {
        let ports = self.ports.read();
        for port in ports.iter() {
            let direction = if Some(port.node) == from {
                Direction::Tx
            } else {
                Direction::Rx
            };
            // No subscribers is fine
            let _ = port
                .incoming_tx
                .send(frame.clone().with_direction(direction));
        }
    }
}

/// One node on a [`MockCanBus`]
pub struct MockCanPort {
    node: usize,
    bus: Arc<MockCanBus>,
    config: MockConfig,
    connected: AtomicBool,
    incoming_tx: broadcast::Sender<CanFrame>,
}

impl MockCanPort {
    pub fn bus(&self) -> &Arc<MockCanBus> {
        &self.bus
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl CanPort for MockCanPort {
    async fn send_frame(&self, frame: CanFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let frame = CanFrame {
            timestamp: Instant::now(),
            direction: Direction::Tx,
            ..frame
        };
        tracing::debug!(node = self.node, frame = %frame, "Mock bus: frame sent");

        self.bus.history.write().push(frame.clone());
        self.bus.deliver(Some(self.node), frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> String {
        format!("mock#{}", self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(b: u8) -> [u8; 8] {
        [b; 8]
    }

    #[tokio::test]
    async fn test_sender_sees_echo_others_see_rx() {
        let bus = MockCanBus::new();
        let a = bus.attach(&MockConfig::default());
        let b = bus.attach(&MockConfig::default());
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        a.send_frame(CanFrame::new(0x18DA_6AF1, payload(1))).await.unwrap();

        let echo = rx_a.recv().await.unwrap();
        let seen = rx_b.recv().await.unwrap();
        assert_eq!(echo.direction, Direction::Tx);
        assert_eq!(seen.direction, Direction::Rx);
        assert_eq!(seen.id, 0x18DA_6AF1);
        assert_eq!(bus.history().len(), 1);
    }

    #[tokio::test]
    async fn test_inject_reaches_everyone_as_rx() {
        let bus = MockCanBus::new();
        let a = bus.attach(&MockConfig::default());
        let mut rx = a.subscribe();

        bus.inject(0x0CF0_0400, &[0x01, 0x02]);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.direction, Direction::Rx);
        assert_eq!(frame.payload(), &[0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_disconnected_port_rejects_send() {
        let bus = MockCanBus::new();
        let a = bus.attach(&MockConfig::default());
        a.set_connected(false);

        let result = a.send_frame(CanFrame::new(0x100, payload(0))).await;
        assert_eq!(result, Err(TransportError::Closed));
        assert!(!a.is_connected().await);

        a.reconnect().await.unwrap();
        assert!(a.is_connected().await);
        assert!(bus.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency() {
        let bus = MockCanBus::new();
        let a = bus.attach(&MockConfig { latency_ms: 5 });
        let start = tokio::time::Instant::now();
        a.send_frame(CanFrame::new(0x100, payload(0))).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
