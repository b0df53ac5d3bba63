//! canboot-uds - UDS-over-CAN bootloader client
//!
//! This crate flashes firmware into ECUs running a UDS bootloader on a
//! J1939 network (29-bit identifiers, diagnostic PGN 0xDA00).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   BootloaderHandle                          │
//! │  start / check_state / resets / source address / ids       │
//! │                          │ mpsc + oneshot                   │
//! │  ┌───────────────────────┴─────────────────────────────┐   │
//! │  │ driver task                                          │   │
//! │  │   ┌────────────┐  effects  ┌──────────────────────┐ │   │
//! │  │   │ Bootloader │ ────────▶ │ frames, timers,      │ │   │
//! │  │   │ (pure FSM) │ ◀──────── │ notifications        │ │   │
//! │  │   └─────┬──────┘  events   └──────────────────────┘ │   │
//! │  │         │ services / isotp / j1939                   │   │
//! │  └─────────┼────────────────────────────────────────────┘   │
//! │      ┌─────┴─────┐                                          │
//! │      │  CanPort  │  SocketCAN raw socket or MockCanBus      │
//! │      └───────────┘                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bootloader;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod error;
pub mod firmware;
pub mod isotp;
pub mod j1939;
pub mod transport;
pub mod uds;

pub use bootloader::driver::{wait_for, wait_while_active, Snapshot};
pub use bootloader::{
    spawn, Bootloader, BootloaderHandle, BootloaderState, Command, Effect, Event, MachineConfig,
    Notification, Severity, TimerKind,
};
pub use collector::{Collector, NodeReading};
pub use config::{BootloaderConfig, CollectorConfig, ConfigError, TransportConfig};
pub use discovery::{detect, Candidate, NodeObserver};
pub use error::BootloaderError;
pub use j1939::CanIdentifier;
pub use transport::{create_port, ensure_connected, CanFrame, CanPort, Direction, TransportError};
pub use uds::{ByteOrder, NegativeResponseCode, UdsError, UdsIdentifiers};
