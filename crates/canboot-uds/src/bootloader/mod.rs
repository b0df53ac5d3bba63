//! Firmware download state machine
//!
//! [`Bootloader`] is a pure state machine: commands and events go in,
//! [`Effect`]s come out. It never touches a socket or a clock. The
//! [`driver`] module runs it on a tokio task, turning effects into CAN
//! frames, timers and notifications.
//!
//! ```text
//! READY ─start─▶ SET_PROGRAMMING_SESSION ─▶ REQUEST_SEED ─▶ SEED_VERIFICATION
//!                                                                 │
//!   ┌─────────────────────────────────────────────────────────────┘
//!   ▼
//! WRITE_FINGERPRINT ─▶ ERASE_FIRMWARE ─▶ REQUEST_DOWNLOAD ─▶ REQUEST_DOWNLOAD_CONSECUTIVE
//!                                                                 │
//!   ┌─────────────────────────────────────────────────────────────┘
//!   ▼
//! TRANSFER_DATA_FF ◀──▶ TRANSFER_DATA_CF ─▶ REQUEST_TRANSFER_EXIT ─▶ READY
//!
//! any programming step ──failure──▶ ERROR ──reset_state──▶ READY
//! ```

pub mod driver;
mod machine;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::transport::CanFrame;
use crate::uds::{ByteOrder, UdsIdentifiers};

pub use driver::{spawn, BootloaderHandle};
pub use machine::{Bootloader, MachineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootloaderState {
    Error,
    Ready,
    SetProgrammingSession,
    RequestSeed,
    SeedVerification,
    WriteFingerprint,
    EraseFirmware,
    RequestDownload,
    RequestDownloadConsecutive,
    TransferDataFf,
    TransferDataCf,
    RequestTransferExit,
    EcuUdsReset,
    EcuSoftwareReset,
    ReadFingerprint,
    WriteCanSourceAddress,
    ReadCanSourceAddress,
}

impl BootloaderState {
    /// States of the download sequence proper; a failure here is fatal
    pub fn is_programming(&self) -> bool {
        matches!(
            self,
            Self::SetProgrammingSession
                | Self::RequestSeed
                | Self::SeedVerification
                | Self::WriteFingerprint
                | Self::EraseFirmware
                | Self::RequestDownload
                | Self::RequestDownloadConsecutive
                | Self::TransferDataFf
                | Self::TransferDataCf
                | Self::RequestTransferExit
        )
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

impl fmt::Display for BootloaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "ERROR",
            Self::Ready => "READY",
            Self::SetProgrammingSession => "SET_PROGRAMMING_SESSION",
            Self::RequestSeed => "REQUEST_SEED",
            Self::SeedVerification => "SEED_VERIFICATION",
            Self::WriteFingerprint => "WRITE_FINGERPRINT",
            Self::EraseFirmware => "ERASE_FIRMWARE",
            Self::RequestDownload => "REQUEST_DOWNLOAD",
            Self::RequestDownloadConsecutive => "REQUEST_DOWNLOAD_CONSECUTIVE",
            Self::TransferDataFf => "TRANSFER_DATA_FF",
            Self::TransferDataCf => "TRANSFER_DATA_CF",
            Self::RequestTransferExit => "REQUEST_TRANSFER_EXIT",
            Self::EcuUdsReset => "ECU_UDS_RESET",
            Self::EcuSoftwareReset => "ECU_SOFTWARE_RESET",
            Self::ReadFingerprint => "READ_FINGERPRINT",
            Self::WriteCanSourceAddress => "WRITE_CAN_SOURCE_ADDRESS",
            Self::ReadCanSourceAddress => "READ_CAN_SOURCE_ADDRESS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// User-facing outcome of a state machine step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StateChanged(BootloaderState),
    Status {
        severity: Severity,
        message: String,
    },
    /// Cumulative TransferData bytes (including block headers)
    Progress {
        sent: usize,
        total: usize,
    },
    /// End of a download run
    Finished {
        success: bool,
    },
    SourceAddressApplied {
        address: u8,
        success: bool,
    },
    SourceAddressRead {
        address: u8,
        success: bool,
    },
    /// Fingerprint check result; `active` means the bootloader answered
    BootloaderActive {
        active: bool,
    },
    /// Outcome of an ECU reset request
    ResetCompleted {
        kind: u8,
        success: bool,
    },
    IdentifiersChanged(UdsIdentifiers),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Repeating, one consecutive frame per tick
    ConsecutiveFrame,
    /// Single shot, source address read/write deadline
    SourceAddress,
}

/// Work the machine asks its driver to perform
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(CanFrame),
    Notify(Notification),
    StartTimer { kind: TimerKind, period: Duration },
    CancelTimer(TimerKind),
}

/// Inputs besides commands
#[derive(Debug, Clone)]
pub enum Event {
    Frame(CanFrame),
    TimerFired(TimerKind),
}

/// Operations a caller can request
#[derive(Debug, Clone)]
pub enum Command {
    /// Begin the download sequence with the loaded firmware
    Start,
    SetFirmware(Bytes),
    /// Recover from ERROR (or abort a stuck exchange)
    ResetState,
    /// Restart into the bootloader
    EcuUdsReset,
    /// Restart into the application
    EcuSoftwareReset,
    /// Read the fingerprint to see whether the bootloader is running
    CheckState,
    WriteSourceAddress(u16),
    ReadSourceAddress,
    SetByteOrder(ByteOrder),
    SetIdentifiers(UdsIdentifiers),
    /// Address an ECU found on the bus
    ApplyCandidate { device: u8, tester: u8 },
}
