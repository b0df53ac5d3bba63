//! UDS protocol errors

use thiserror::Error;

use super::NegativeResponseCode;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    #[error("Negative response: service 0x{service_id:02X}, NRC 0x{nrc:02X} ({nrc})")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Value of {size} bytes does not fit in a single frame (max 4)")]
    ValueTooLarge { size: u16 },

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
