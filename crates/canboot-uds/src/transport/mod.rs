//! CAN transport
//!
//! This module provides the ports the bootloader talks through:
//! - SocketCAN raw port (Linux only)
//! - Mock bus for testing
//!
//! # Example
//!
//! ```ignore
//! use canboot_uds::transport::{create_port, CanPort};
//! use canboot_uds::config::TransportConfig;
//!
//! let port = create_port(&TransportConfig::default()).await?;
//! let mut frames = port.subscribe();
//! ```

mod adapter;
pub mod error;
mod frame;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::CanPort;
pub use error::TransportError;
pub use frame::{CanFrame, Direction};
pub use mock::{MockCanBus, MockCanPort};

use std::sync::Arc;

use tracing::warn;

use crate::config::TransportConfig;

/// Create a CAN port based on configuration
///
/// A mock transport gets a fresh bus of its own; attach more nodes through
/// [`MockCanBus::attach`] when something has to answer.
pub async fn create_port(config: &TransportConfig) -> Result<Arc<dyn CanPort>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let port = socketcan::SocketCanPort::new(cfg).await?;
            Ok(Arc::new(port))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => {
            let bus = MockCanBus::new();
            Ok(Arc::new(bus.attach(cfg)))
        }
    }
}

/// Reopen `port` if it reports itself down
pub async fn ensure_connected(port: &dyn CanPort) -> Result<(), TransportError> {
    if port.is_connected().await {
        return Ok(());
    }
    warn!(port = %port.name(), "CAN port is down, reconnecting");
    port.reconnect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;

    #[tokio::test]
    async fn test_ensure_connected_reopens_port() {
        let bus = MockCanBus::new();
        let port = bus.attach(&MockConfig::default());

        ensure_connected(&port).await.unwrap();
        assert!(port.is_connected().await);

        port.set_connected(false);
        ensure_connected(&port).await.unwrap();
        assert!(port.is_connected().await);
    }
}
