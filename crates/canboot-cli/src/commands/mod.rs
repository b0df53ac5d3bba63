//! Command implementations for canboot

pub mod check;
pub mod collect;
pub mod detect;
pub mod flash;
pub mod ids;
pub mod reset;
pub mod source_address;

pub use check::check;
pub use collect::collect;
pub use detect::detect;
pub use flash::flash;
pub use ids::ids;
pub use reset::reset;
pub use source_address::{read_source_address, write_source_address};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use canboot_uds::config::TransportConfig;
use canboot_uds::transport::{create_port, MockCanBus};
use canboot_uds::{
    ensure_connected, spawn, BootloaderConfig, BootloaderError, BootloaderHandle, CanPort,
    MachineConfig,
};
use example_ecu::{EcuConfig, EcuSimulator};
use tokio::task::JoinHandle;
use tracing::debug;

/// Heartbeat of the in-process ECU, so `detect` has something to see
const MOCK_HEARTBEAT_MS: u64 = 100;

/// A running bootloader driver and the port under it
pub struct Session {
    pub config: BootloaderConfig,
    pub port: Arc<dyn CanPort>,
    pub handle: BootloaderHandle,
    /// Where `--save` writes identifiers
    pub config_path: PathBuf,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub async fn connect(config: BootloaderConfig, config_path: PathBuf) -> Result<Self> {
        let mut tasks = Vec::new();

        let port: Arc<dyn CanPort> = match &config.transport {
            TransportConfig::Mock(mock) => {
                let bus = MockCanBus::new();
                let ecu_port: Arc<dyn CanPort> = Arc::new(bus.attach(mock));
                let mut ecu_config = EcuConfig::default();
                ecu_config.transport.ecu_address = config.uds_identifiers().ecu_address();
                ecu_config.transport.heartbeat_ms = MOCK_HEARTBEAT_MS;
                ecu_config.transfer.byte_order = config.transfer.byte_order;
                let simulator = EcuSimulator::new(ecu_port, ecu_config).spawn();
                tasks.push(tokio::spawn(async move {
                    if let Ok(Err(e)) = simulator.await {
                        debug!(error = %e, "Simulated ECU stopped");
                    }
                }));
                Arc::new(bus.attach(mock))
            }
            TransportConfig::SocketCan(_) => create_port(&config.transport)
                .await
                .context("Failed to open CAN interface")?,
        };

        ensure_connected(port.as_ref())
            .await
            .with_context(|| format!("CAN port {} is not usable", port.name()))?;

        let (handle, driver) = spawn(Arc::clone(&port), MachineConfig::from(&config));
        tasks.push(driver);

        Ok(Self {
            config,
            port,
            handle,
            config_path,
            tasks,
        })
    }

    /// Deadline for answers the machine does not time out by itself
    pub fn answer_deadline(&self) -> Duration {
        self.config.timeouts.source_address()
    }

    /// Wait for `outcome` or give up after the answer deadline
    ///
    /// On timeout the machine is put back to READY so the next command runs.
    pub async fn within_deadline<T>(
        &self,
        what: &str,
        outcome: impl Future<Output = Result<T, BootloaderError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.answer_deadline(), outcome).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                self.handle.reset_state().await?;
                anyhow::bail!("No answer from ECU to {}", what)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
