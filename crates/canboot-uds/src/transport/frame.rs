//! Classic CAN frame as seen by the bootloader

use std::fmt;
use std::time::Instant;

use crate::uds::services::{Payload, PADDING};

/// Which way a frame crossed the bus from our point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by this node (local echo)
    Tx,
    /// Received from another node
    Rx,
}

/// Extended-identifier CAN frame with an 8-byte payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub timestamp: Instant,
    /// 29-bit identifier
    pub id: u32,
    pub direction: Direction,
    /// Data length code (0..=8)
    pub dlc: u8,
    pub data: Payload,
}

impl CanFrame {
    /// Outbound frame, always 8 bytes long
    pub fn new(id: u32, data: Payload) -> Self {
        Self {
            timestamp: Instant::now(),
            id,
            direction: Direction::Tx,
            dlc: 8,
            data,
        }
    }

    /// Frame built from raw received bytes, short payloads padded with 0xFF
    pub fn received(id: u32, bytes: &[u8]) -> Self {
        let mut data = [PADDING; 8];
        let dlc = bytes.len().min(8);
        data[..dlc].copy_from_slice(&bytes[..dlc]);
        Self {
            timestamp: Instant::now(),
            id,
            direction: Direction::Rx,
            dlc: dlc as u8,
            data,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// The bytes actually carried on the wire
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.dlc as usize).min(8)]
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Tx => "Tx",
            Direction::Rx => "Rx",
        };
        write!(
            f,
            "{} 0x{:08X} [{}] {}",
            dir,
            self.id,
            self.dlc,
            hex::encode_upper(self.payload())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_short_payload() {
        let frame = CanFrame::received(0x18DA_F16A, &[0x02, 0x50, 0x02]);
        assert_eq!(frame.dlc, 3);
        assert_eq!(frame.payload(), &[0x02, 0x50, 0x02]);
        assert_eq!(frame.data[3..], [0xFF; 5]);
        assert_eq!(frame.direction, Direction::Rx);
    }

    #[test]
    fn test_display() {
        let frame = CanFrame::new(0x18DA_6AF1, [0x02, 0x10, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(frame.to_string(), "Tx 0x18DA6AF1 [8] 021002FFFFFFFFFF");
    }
}
