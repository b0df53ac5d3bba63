//! CAN port errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Cannot open CAN interface {interface}: {reason}")]
    Open { interface: String, reason: String },

    /// Socket opened but could not be configured
    #[error("CAN socket setup failed: {0}")]
    Setup(String),

    #[error("CAN port closed")]
    Closed,

    /// Identifier or payload the bus cannot carry
    #[error("Invalid CAN frame: {0}")]
    InvalidFrame(String),

    #[error("Failed to send CAN frame: {0}")]
    Send(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}
