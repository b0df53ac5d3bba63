//! example-ecu - simulated UDS bootloader
//!
//! Stands in for a real ECU on a SocketCAN interface or on the in-memory
//! bus, so the bootloader client can be exercised end to end.
//!
//! # Modules
//!
//! - [`config`] - Simulator configuration (TOML)
//! - [`ecu`] - UDS request handling and flash memory
//! - [`isotp`] - Request reassembly and flow control
//! - [`simulator`] - Bus loop answering from the current source address

pub mod config;
pub mod ecu;
pub mod isotp;
pub mod simulator;

pub use config::EcuConfig;
pub use ecu::SimulatedBootloader;
pub use simulator::EcuSimulator;
