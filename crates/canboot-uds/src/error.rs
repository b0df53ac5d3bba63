//! Bootloader client errors

use std::path::PathBuf;

use thiserror::Error;

use crate::bootloader::BootloaderState;
use crate::transport::TransportError;
use crate::uds::UdsError;

/// Errors returned synchronously by bootloader commands
///
/// Protocol failures during an exchange are not errors of the command that
/// started it; they arrive later as status notifications.
#[derive(Debug, Error)]
pub enum BootloaderError {
    /// Command issued while another exchange is running
    #[error("Bootloader busy in state {state}")]
    PreconditionViolation { state: BootloaderState },

    /// `start` without a firmware image
    #[error("No firmware loaded")]
    NoFirmware,

    #[error("Firmware image is empty")]
    EmptyFirmware,

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Firmware error at {path}: {message}")]
    Firmware { path: PathBuf, message: String },

    #[error(transparent)]
    Uds(#[from] UdsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The driver task is gone
    #[error("Bootloader driver closed")]
    Closed,
}
