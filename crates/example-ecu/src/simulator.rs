//! Bus side of the simulated ECU
//!
//! Listens for diagnostic frames addressed to the ECU's current source
//! address, reassembles them, and answers from that address. After a source
//! address write the answer already leaves from the new address.

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use canboot_uds::j1939::CanIdentifier;
use canboot_uds::transport::{CanFrame, CanPort, Direction, TransportError};
use canboot_uds::uds::services::{padded, Payload};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::EcuConfig;
use crate::ecu::SimulatedBootloader;
use crate::isotp::{Reassembler, Received};

/// Proprietary B PGN used for the status broadcast
pub const HEARTBEAT_PGN: u32 = 0xFF00;

/// Simulated bootloader attached to a CAN port
pub struct EcuSimulator {
    port: Arc<dyn CanPort>,
    /// Subscribed on construction so nothing sent after `new` is missed
    frames: broadcast::Receiver<CanFrame>,
    ecu: Arc<SimulatedBootloader>,
    /// One reassembly channel per tester address
    channels: HashMap<u8, Reassembler>,
}

impl EcuSimulator {
    pub fn new(port: Arc<dyn CanPort>, config: EcuConfig) -> Self {
        Self {
            frames: port.subscribe(),
            port,
            ecu: Arc::new(SimulatedBootloader::new(config)),
            channels: HashMap::new(),
        }
    }

    /// Shared view of the bootloader state
    pub fn ecu(&self) -> Arc<SimulatedBootloader> {
        Arc::clone(&self.ecu)
    }

    /// Run on the current runtime until the port closes
    pub fn spawn(self) -> JoinHandle<Result<(), TransportError>> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut heartbeat = match self.ecu.config().transport.heartbeat_ms {
            0 => None,
            ms => {
                let mut interval = tokio::time::interval(Duration::from_millis(ms));
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(interval)
            }
        };

        info!(
            port = %self.port.name(),
            address = format!("0x{:02X}", self.ecu.source_address()),
            "ECU simulator ready"
        );

        loop {
            tokio::select! {
                frame = self.frames.recv() => match frame {
                    Ok(frame) => self.on_frame(frame).await,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Simulator fell behind the bus"),
                    Err(RecvError::Closed) => {
                        info!("Bus closed, simulator stopping");
                        return Ok(());
                    }
                },
                _ = tick(&mut heartbeat) => self.send_heartbeat().await,
            }
        }
    }

    async fn on_frame(&mut self, frame: CanFrame) {
        if frame.direction == Direction::Tx {
            return;
        }
        let id = CanIdentifier::decode(frame.id);
        if !id.is_diagnostic() || id.dst() != self.ecu.source_address() {
            return;
        }

        let tester = id.src();
        let flow_control = self.ecu.config().flow_control;
        let received = self
            .channels
            .entry(tester)
            .or_insert_with(|| Reassembler::new(flow_control))
            .push(frame.payload());

        match received {
            Received::Message(request) => self.answer(tester, &request).await,
            Received::FlowControl(frames) => {
                for fc in frames {
                    self.send(tester, fc).await;
                }
            }
            Received::Nothing => {}
        }
    }

    async fn answer(&self, tester: u8, request: &[u8]) {
        debug!(request = %hex::encode_upper(request), "Received UDS request");

        let delay = self.ecu.config().behavior.response_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        for response in self.ecu.process_request(request) {
            if response.len() > 7 {
                error!(len = response.len(), "Response does not fit a single frame");
                continue;
            }
            debug!(response = %hex::encode_upper(&response), "Sending UDS response");
            let mut bytes = Vec::with_capacity(8);
            bytes.push(response.len() as u8);
            bytes.extend_from_slice(&response);
            self.send(tester, padded(&bytes)).await;
        }
    }

    async fn send(&self, tester: u8, data: Payload) {
        let priority = self.ecu.config().transport.priority;
        let id = CanIdentifier::diagnostic(priority, tester, self.ecu.source_address());
        if let Err(e) = self.port.send_frame(CanFrame::new(id.encode(), data)).await {
            error!(error = %e, "Failed to send frame");
        }
    }

    async fn send_heartbeat(&self) {
        let transport = &self.ecu.config().transport;
        let id = CanIdentifier::new(transport.priority, HEARTBEAT_PGN, self.ecu.source_address());
        let data = padded(&[self.ecu.session()]);
        if let Err(e) = self.port.send_frame(CanFrame::new(id.encode(), data)).await {
            debug!(error = %e, "Failed to send heartbeat");
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcuTransportConfig;
    use canboot_uds::config::MockConfig;
    use canboot_uds::transport::MockCanBus;

    #[tokio::test(start_paused = true)]
    async fn test_answers_session_request() {
        let bus = MockCanBus::new();
        let port: Arc<dyn CanPort> = Arc::new(bus.attach(&MockConfig::default()));
        let simulator = EcuSimulator::new(port, EcuConfig::default());
        let ecu = simulator.ecu();
        let task = simulator.spawn();

        let tester = bus.attach(&MockConfig::default());
        let mut rx = tester.subscribe();
        tester
            .send_frame(CanFrame::new(0x18DA_6AF1, padded(&[0x02, 0x10, 0x02])))
            .await
            .unwrap();

        let response = loop {
            let frame = rx.recv().await.unwrap();
            if frame.direction == Direction::Rx {
                break frame;
            }
        };
        assert_eq!(response.id, 0x18DA_F16A);
        assert_eq!(&response.payload()[..7], &[0x06, 0x50, 0x02, 0x00, 0x32, 0x01, 0xF4]);
        assert_eq!(ecu.session(), 0x02);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_other_destinations() {
        let bus = MockCanBus::new();
        let port: Arc<dyn CanPort> = Arc::new(bus.attach(&MockConfig::default()));
        let simulator = EcuSimulator::new(port, EcuConfig::default());
        let ecu = simulator.ecu();
        let task = simulator.spawn();

        bus.inject(0x18DA_22F1, &[0x02, 0x10, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(ecu.session(), 0x01);
        assert_eq!(bus.history().len(), 1);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat() {
        let bus = MockCanBus::new();
        let port: Arc<dyn CanPort> = Arc::new(bus.attach(&MockConfig::default()));
        let config = EcuConfig {
            transport: EcuTransportConfig {
                heartbeat_ms: 100,
                ..Default::default()
            },
            ..Default::default()
        };
        let task = EcuSimulator::new(port, config).spawn();

        tokio::time::sleep(Duration::from_millis(250)).await;

        let beats: Vec<_> = bus
            .history()
            .into_iter()
            .filter(|f| CanIdentifier::decode(f.id).pgn() == HEARTBEAT_PGN)
            .collect();
        assert_eq!(beats.len(), 3);
        assert_eq!(CanIdentifier::decode(beats[0].id).src(), 0x6A);
        task.abort();
    }
}
