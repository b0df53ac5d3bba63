//! End-to-end tests for the canboot bootloader client
//!
//! Everything runs in-process: the bootloader driver and the simulated ECU
//! from `example-ecu` share one [`MockCanBus`]. Tests use paused tokio time,
//! so consecutive frame pacing and timeouts cost nothing.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p canboot-tests
//! ```
//!
//! # Test Structure
//!
//! - `flash_test.rs` - Complete downloads, flow control variants, failures
//! - `addressing_test.rs` - Source address changes, detection, filtering
//! - `service_test.rs` - Fingerprint check and resets
//! - `collector_test.rs` - Telemetry polling across several ECUs

use std::sync::Arc;

use bytes::Bytes;
use canboot_uds::config::MockConfig;
use canboot_uds::j1939::CanIdentifier;
use canboot_uds::transport::MockCanBus;
use canboot_uds::{
    spawn, wait_for, BootloaderError, BootloaderHandle, CanFrame, CanPort, MachineConfig,
    Notification,
};
use example_ecu::{EcuConfig, EcuSimulator, SimulatedBootloader};
use tokio::task::JoinHandle;

/// Driver and simulated ECU on one bus
pub struct TestHarness {
    pub bus: Arc<MockCanBus>,
    pub ecu: Arc<SimulatedBootloader>,
    pub handle: BootloaderHandle,
    pub tester_port: Arc<dyn CanPort>,
    /// Tester address the driver started with
    pub tester: u8,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHarness {
    /// Must be called inside a tokio runtime
    pub fn new(ecu_config: EcuConfig, machine: MachineConfig) -> Self {
        let bus = MockCanBus::new();

        let ecu_port: Arc<dyn CanPort> = Arc::new(bus.attach(&MockConfig::default()));
        let simulator = EcuSimulator::new(ecu_port, ecu_config);
        let ecu = simulator.ecu();
        let simulator = simulator.spawn();

        let tester = machine.identifiers.tester_address();
        let tester_port: Arc<dyn CanPort> = Arc::new(bus.attach(&MockConfig::default()));
        let (handle, driver) = spawn(Arc::clone(&tester_port), machine);

        Self {
            bus,
            ecu,
            handle,
            tester_port,
            tester,
            tasks: vec![
                driver,
                tokio::spawn(async move {
                    let _ = simulator.await;
                }),
            ],
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EcuConfig::default(), MachineConfig::default())
    }

    /// Put another simulated ECU on the bus
    pub fn add_ecu(&mut self, config: EcuConfig) -> Arc<SimulatedBootloader> {
        let port: Arc<dyn CanPort> = Arc::new(self.bus.attach(&MockConfig::default()));
        let simulator = EcuSimulator::new(port, config);
        let ecu = simulator.ecu();
        let simulator = simulator.spawn();
        self.tasks.push(tokio::spawn(async move {
            let _ = simulator.await;
        }));
        ecu
    }

    /// Load `image`, run the download and return the finished flag
    pub async fn flash(&self, image: &[u8]) -> Result<bool, BootloaderError> {
        self.handle
            .set_firmware(Bytes::copy_from_slice(image))
            .await?;
        let mut notifications = self.handle.subscribe();
        self.handle.start().await?;
        wait_for(&mut notifications, |n| match n {
            Notification::Finished { success } => Some(*success),
            _ => None,
        })
        .await
    }

    /// Frames the tester put on the bus
    pub fn tester_frames(&self) -> Vec<CanFrame> {
        self.frames_from(self.tester)
    }

    /// Frames sent from `address`
    pub fn frames_from(&self, address: u8) -> Vec<CanFrame> {
        self.bus
            .history()
            .into_iter()
            .filter(|f| CanIdentifier::decode(f.id).src() == address)
            .collect()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Deterministic image contents
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}
