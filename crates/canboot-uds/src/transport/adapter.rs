//! CAN port trait

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{CanFrame, TransportError};

/// Raw CAN access used by the bootloader
///
/// The bootloader never waits on a send: requests go out through
/// [`CanPort::send_frame`] and answers come back later on the stream returned
/// by [`CanPort::subscribe`], which carries every frame seen on the bus,
/// including our own transmissions marked [`super::Direction::Tx`].
#[async_trait]
pub trait CanPort: Send + Sync {
    /// Transmit one classic CAN frame with an extended identifier
    async fn send_frame(&self, frame: CanFrame) -> Result<(), TransportError>;

    /// Subscribe to bus traffic
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;

    /// Check if the port is usable
    async fn is_connected(&self) -> bool;

    /// Reopen the underlying device
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Human readable port name (interface or "mock")
    fn name(&self) -> String;
}
