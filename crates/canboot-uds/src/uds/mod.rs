//! UDS (ISO 14229) layer for the bootloader
//!
//! Frame builders and response verifiers for the services used while
//! programming an ECU, the data identifier catalog and the tester/ECU
//! identifier pair.

pub mod data_identifiers;
mod error;
mod identifiers;
mod nrc;
pub mod services;

use serde::{Deserialize, Serialize};

pub use data_identifiers::UdsVar;
pub use error::UdsError;
pub use identifiers::{UdsIdentifiers, DEFAULT_ECU_ADDRESS, DEFAULT_TESTER_ADDRESS};
pub use nrc::NegativeResponseCode;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Offset added to a request SID in its positive response
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

    pub const fn positive_response(sid: u8) -> u8 {
        sid + POSITIVE_RESPONSE_OFFSET
    }
}

/// DiagnosticSessionControl (0x10) session types
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    pub const HARD_RESET: u8 = 0x01;
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    /// Restart into the application
    pub const SOFTWARE_RESET: u8 = 0x03;
    /// Restart into the bootloader (manufacturer specific)
    pub const UDS_SOFTWARE_RESET: u8 = 0x60;
}

/// SecurityAccess (0x27) sub-functions
pub mod security_level {
    pub const REQUEST_SEED: u8 = 0x01;
    pub const SEND_KEY: u8 = 0x02;
}

/// RoutineControl (0x31) sub-functions and routine identifiers
pub mod routine {
    pub const START_ROUTINE: u8 = 0x01;
    /// Erase the application flash area
    pub const ERASE_MEMORY: u16 = 0x00FF;
}

/// RequestDownload (0x34) parameters
pub mod download {
    /// Uncompressed, unencrypted
    pub const DATA_FORMAT: u8 = 0x00;
    /// 4-byte memory size, 4-byte memory address
    pub const ADDRESS_AND_LENGTH_FORMAT: u8 = 0x44;
    /// Start of the application area (flash base + 30 KiB bootloader)
    pub const DEFAULT_MEMORY_ADDRESS: u32 = 0x0800_0000 + 30 * 1024;
    /// Size of the application area
    pub const MAX_MEMORY_LENGTH: u32 = 80 * 1024;
}

/// Order of multi-byte fields (PID, memory address, memory length)
///
/// Firmware revisions of the bootloader disagree on this, so it is a
/// runtime setting rather than a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            Self::Big => value.to_be_bytes(),
            Self::Little => value.to_le_bytes(),
        }
    }

    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Self::Big => value.to_be_bytes(),
            Self::Little => value.to_le_bytes(),
        }
    }

    pub fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::Big => u16::from_be_bytes(bytes),
            Self::Little => u16::from_le_bytes(bytes),
        }
    }

    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Big => u32::from_be_bytes(bytes),
            Self::Little => u32::from_le_bytes(bytes),
        }
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Big => f.write_str("big"),
            Self::Little => f.write_str("little"),
        }
    }
}

impl std::str::FromStr for ByteOrder {
    type Err = UdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "big" | "be" => Ok(Self::Big),
            "little" | "le" => Ok(Self::Little),
            other => Err(UdsError::InvalidValue(format!(
                "unknown byte order '{}'",
                other
            ))),
        }
    }
}
