//! Raw SocketCAN port for J1939/UDS traffic
//!
//! ISO-TP segmentation is done by the bootloader itself, so the socket is a
//! plain CAN_RAW socket and every extended data frame on the bus is
//! published to subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanFrame as RawFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SocketCanConfig;
use crate::transport::{CanFrame, CanPort, Direction, TransportError};

const CHANNEL_CAPACITY: usize = 4096;

/// Raw CAN port on a SocketCAN interface
pub struct SocketCanPort {
    config: SocketCanConfig,
    socket: Arc<Mutex<CanSocket>>,
    connected: Arc<AtomicBool>,
    incoming_tx: broadcast::Sender<CanFrame>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanPort {
    pub async fn new(config: &SocketCanConfig) -> Result<Self, TransportError> {
        let socket = Self::open_socket(&config.interface)?;
        let (incoming_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        let port = Self {
            config: config.clone(),
            socket: Arc::new(Mutex::new(socket)),
            connected: Arc::new(AtomicBool::new(true)),
            incoming_tx,
            listener_handle: Mutex::new(None),
        };
        port.start_listener();

        tracing::info!(interface = %config.interface, "SocketCAN port opened");
        Ok(port)
    }

    fn open_socket(interface: &str) -> Result<CanSocket, TransportError> {
        let socket = CanSocket::open(interface).map_err(|e| TransportError::Open {
            interface: interface.to_string(),
            reason: e.to_string(),
        })?;

        socket.set_nonblocking(true).map_err(|e| {
            TransportError::Setup(format!("non-blocking mode: {}", e))
        })?;

        Ok(socket)
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let incoming_tx = self.incoming_tx.clone();
        let connected = self.connected.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while connected.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(frame) if frame.is_extended() && !frame.is_remote_frame() => {
                        let frame = CanFrame::received(frame.raw_id(), frame.data());
                        tracing::trace!(frame = %frame, "CAN frame received");
                        // No receivers, but that's okay
                        let _ = incoming_tx.send(frame);
                    }
                    Ok(_) => {
                        // Standard or remote frame, not ours
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        tracing::error!(?e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            tracing::debug!("SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }
}

#[async_trait]
impl CanPort for SocketCanPort {
    async fn send_frame(&self, frame: CanFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = ExtendedId::new(frame.id).ok_or_else(|| {
            TransportError::InvalidFrame(format!("identifier 0x{:X} exceeds 29 bits", frame.id))
        })?;
        let raw = RawFrame::new(id, frame.payload()).ok_or_else(|| {
            TransportError::InvalidFrame(format!("payload of {} bytes", frame.dlc))
        })?;

        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || {
            socket
                .lock()
                .write_frame(&raw)
                .map_err(|e| TransportError::Send(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::Send(format!("writer task failed: {}", e)))??;

        if self.config.echo_tx {
            let _ = self
                .incoming_tx
                .send(frame.with_direction(Direction::Tx));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let socket = Self::open_socket(&self.config.interface)?;
        *self.socket.lock() = socket;

        if !self.connected.swap(true, Ordering::SeqCst) {
            self.start_listener();
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.config.interface.clone()
    }
}

impl Drop for SocketCanPort {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
