//! J1939 addressing
//!
//! Only the parts needed to route UDS frames: the 29-bit identifier layout
//! and the physically addressed diagnostic PGN range.

mod identifier;

pub use identifier::{parse_hex_u32, CanIdentifier, DIAGNOSTIC_PDU_FORMAT, EXTENDED_ID_MASK};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum J1939Error {
    #[error("Invalid CAN identifier {0}")]
    Parse(String),

    #[error("CAN identifier 0x{0:X} does not fit in 29 bits")]
    OutOfRange(u32),
}
